use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

/// Errors returned by the lock manager and lock contexts. Every error is raised before
/// any lock state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("duplicate lock request: {0}")]
    DuplicateLock(String),
    #[error("no lock held: {0}")]
    NoLockHeld(String),
    #[error("invalid lock request: {0}")]
    InvalidLock(String),
    #[error("lock context is read-only: {0}")]
    ReadOnly(String),
}
