//! Write-ahead logging and ARIES crash recovery for the minirel storage engine.
//!
//! [`AriesRecoveryManager`] is driven by the transaction layer during normal operation
//! (commit, abort, page writes, allocations, savepoints, checkpoints) and rebuilds a
//! consistent database from the log after a crash with [`AriesRecoveryManager::restart`].
//!
//! The log lives behind [`LogStore`]: [`MemoryLog`] for tests and simulations,
//! [`FileLog`] for a checksummed log file on disk.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod log;
pub mod manager;
pub mod record;
mod restart;
pub mod table;

pub use buffer::{BufferManager, FlushListener, MemoryBufferManager};
pub use disk::{
    DiskSpaceManager, EFFECTIVE_PAGE_SIZE, LOG_PARTITION, MemoryDiskSpaceManager, PAGE_SIZE,
    PageNum, PartNum, page_num, part_num,
};
pub use error::{DiskError, LogError, RecoveryError, RecoveryResult};
pub use log::LogStore;
pub use log::file::{FileLog, FileLogConfig};
pub use log::memory::MemoryLog;
pub use manager::{AriesRecoveryManager, NewTransactionFn, RecoveryConfig};
pub use record::{LogEntry, LogRecord, LogType, Lsn, MASTER_LSN};
pub use table::TransactionTableEntry;
