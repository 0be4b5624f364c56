use minirel_concurrency::LockError;
use minirel_transaction::TransNum;
use thiserror::Error;

use crate::disk::{PageNum, PartNum};
use crate::record::Lsn;

pub type RecoveryResult<T> = Result<T, RecoveryError>;
pub type LogResult<T> = Result<T, LogError>;
pub type DiskResult<T> = Result<T, DiskError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Log error: {0}")]
    Log(#[from] LogError),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Disk error: {0}")]
    Disk(#[from] DiskError),
    #[error("Transaction {0} has no transaction table entry")]
    MissingTransaction(TransNum),
    #[error("Transaction {0} has no savepoint named {1:?}")]
    MissingSavepoint(TransNum, String),
    #[error("Corrupt log: {0}")]
    CorruptLog(String),
    #[error("Before image of {before} bytes does not match after image of {after} bytes")]
    ImageLengthMismatch { before: usize, after: usize },
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("No log record at LSN {0}")]
    InvalidLsn(Lsn),
    #[error("Unexpected record: {0}")]
    UnexpectedRecord(String),
    #[error("Log is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiskError {
    #[error("Partition {0} is already allocated")]
    PartitionAlreadyAllocated(PartNum),
    #[error("Partition {0} is not allocated")]
    PartitionNotAllocated(PartNum),
    #[error("Page {0} is already allocated")]
    PageAlreadyAllocated(PageNum),
    #[error("Page {0} is not allocated")]
    PageNotAllocated(PageNum),
    #[error("Write of {len} bytes at offset {offset} overflows page {page_num}")]
    OutOfBounds {
        page_num: PageNum,
        offset: usize,
        len: usize,
    },
}

impl DiskError {
    /// Errors redo can skip: the change they refuse is already on disk.
    pub fn is_already_applied(&self) -> bool {
        matches!(
            self,
            DiskError::PartitionAlreadyAllocated(_)
                | DiskError::PartitionNotAllocated(_)
                | DiskError::PageAlreadyAllocated(_)
                | DiskError::PageNotAllocated(_)
        )
    }
}
