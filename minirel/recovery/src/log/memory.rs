use parking_lot::Mutex;

use super::{LogScan, LogStore};
use crate::error::{LogError, LogResult};
use crate::record::{LogEntry, LogRecord, Lsn, MASTER_LSN};

#[derive(Debug)]
struct MemoryLogInner {
    /// Record at index `i` has LSN `i`.
    records: Vec<LogRecord>,
    /// Number of records that survive a crash.
    durable: usize,
    closed: bool,
}

/// Log kept in memory, with LSNs equal to record indexes.
///
/// Only the flushed prefix survives [`MemoryLog::crash`].
#[derive(Debug)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLogInner {
                records: vec![LogRecord::Master {
                    last_checkpoint_lsn: MASTER_LSN,
                }],
                durable: 1,
                closed: false,
            }),
        }
    }

    /// LSN of the last durable record.
    pub fn flushed_lsn(&self) -> Lsn {
        (self.inner.lock().durable - 1) as Lsn
    }

    /// LSN the next appended record will get.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().records.len() as Lsn
    }

    /// Every record in the log, master included.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .records
            .iter()
            .enumerate()
            .map(|(lsn, record)| LogEntry {
                lsn: lsn as Lsn,
                record: record.clone(),
            })
            .collect()
    }

    /// Drop every record that was never flushed and reopen the log.
    pub fn crash(&self) {
        let mut inner = self.inner.lock();
        let durable = inner.durable;
        inner.records.truncate(durable);
        inner.closed = false;
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLog {
    fn append(&self, record: LogRecord) -> LogResult<Lsn> {
        if matches!(record, LogRecord::Master { .. }) {
            return Err(LogError::UnexpectedRecord(
                "master records are rewritten, not appended".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        inner.records.push(record);
        Ok((inner.records.len() - 1) as Lsn)
    }

    fn flush_to_lsn(&self, lsn: Lsn) -> LogResult<()> {
        let mut inner = self.inner.lock();
        let len = inner.records.len();
        let upto = (lsn as usize).saturating_add(1).min(len);
        inner.durable = inner.durable.max(upto);
        Ok(())
    }

    fn fetch(&self, lsn: Lsn) -> LogResult<LogEntry> {
        let inner = self.inner.lock();
        let record = inner
            .records
            .get(lsn as usize)
            .cloned()
            .ok_or(LogError::InvalidLsn(lsn))?;
        Ok(LogEntry { lsn, record })
    }

    fn scan_from(&self, lsn: Lsn) -> LogResult<LogScan<'_>> {
        let mut next = lsn;
        Ok(Box::new(std::iter::from_fn(move || {
            let inner = self.inner.lock();
            let record = inner.records.get(next as usize)?.clone();
            let entry = LogEntry { lsn: next, record };
            next += 1;
            Some(Ok(entry))
        })))
    }

    fn rewrite_master(&self, record: LogRecord) -> LogResult<()> {
        if !matches!(record, LogRecord::Master { .. }) {
            return Err(LogError::UnexpectedRecord(format!(
                "expected a master record, got {}",
                record.log_type()
            )));
        }
        self.inner.lock().records[MASTER_LSN as usize] = record;
        Ok(())
    }

    fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.durable = inner.records.len();
        inner.closed = true;
        Ok(())
    }
}
