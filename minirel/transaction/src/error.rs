use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransNumError {
    #[error("transaction number overflow, reached {0}")]
    Overflow(u64),
}
