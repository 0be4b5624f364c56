//! Log storage.
//!
//! A [`LogStore`] hands out increasing LSNs on append and keeps the master record at
//! [`MASTER_LSN`](crate::record::MASTER_LSN), where it can be rewritten in place.

pub mod file;
pub mod memory;

use crate::error::LogResult;
use crate::record::{LogEntry, LogRecord, Lsn};

/// Forward iterator over log entries.
pub type LogScan<'a> = Box<dyn Iterator<Item = LogResult<LogEntry>> + 'a>;

pub trait LogStore: Send + Sync {
    /// Append a record and return its LSN. The record is not durable until
    /// [`Self::flush_to_lsn`] covers it. Master records cannot be appended.
    fn append(&self, record: LogRecord) -> LogResult<Lsn>;

    /// Make every record up to and including `lsn` durable.
    fn flush_to_lsn(&self, lsn: Lsn) -> LogResult<()>;

    fn fetch(&self, lsn: Lsn) -> LogResult<LogEntry>;

    /// Iterate over the records starting at `lsn`, in LSN order.
    fn scan_from(&self, lsn: Lsn) -> LogResult<LogScan<'_>>;

    /// Replace the master record. Durable when this returns.
    fn rewrite_master(&self, record: LogRecord) -> LogResult<()>;

    /// Flush everything and stop accepting appends.
    fn close(&self) -> LogResult<()>;
}
