//! ARIES recovery manager: forward processing and checkpointing.
//!
//! Restart recovery lives in [`crate::restart`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use minirel_concurrency::{LockContext, LockType, ensure_sufficient_lock_held};
use minirel_transaction::{Transaction, TransNum, TransNumGenerator, TransactionStatus};
use tracing::{debug, info};

use crate::buffer::{BufferManager, FlushListener};
use crate::disk::{DiskSpaceManager, LOG_PARTITION, PageNum, PartNum, part_num};
use crate::error::{RecoveryError, RecoveryResult};
use crate::log::LogStore;
use crate::record::{LogEntry, LogRecord, Lsn, MASTER_LSN};
use crate::table::TransactionTableEntry;

/// Builds a transaction object for a transaction number found in the log.
pub type NewTransactionFn = Box<dyn Fn(TransNum) -> Arc<dyn Transaction> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Entries (dirty pages, transactions and touched pages) per end-checkpoint record.
    pub end_checkpoint_capacity: usize,
    /// Overrides the buffer manager's usable page size when deciding whether to split
    /// page write records.
    pub effective_page_size: Option<usize>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            end_checkpoint_capacity: 200,
            effective_page_size: None,
        }
    }
}

/// Accumulates checkpoint state into end-checkpoint records of bounded size.
struct EndCheckpointBuilder {
    capacity: usize,
    entries: usize,
    dirty_page_table: BTreeMap<PageNum, Lsn>,
    transaction_table: BTreeMap<TransNum, (TransactionStatus, Lsn)>,
    touched_pages: BTreeMap<TransNum, Vec<PageNum>>,
}

impl EndCheckpointBuilder {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: 0,
            dirty_page_table: BTreeMap::new(),
            transaction_table: BTreeMap::new(),
            touched_pages: BTreeMap::new(),
        }
    }

    /// The full record to write before one more entry can be added, if any.
    fn make_room(&mut self) -> Option<LogRecord> {
        (self.entries >= self.capacity).then(|| self.take())
    }

    fn take(&mut self) -> LogRecord {
        self.entries = 0;
        LogRecord::EndCheckpoint {
            dirty_page_table: std::mem::take(&mut self.dirty_page_table),
            transaction_table: std::mem::take(&mut self.transaction_table),
            touched_pages: std::mem::take(&mut self.touched_pages),
        }
    }
}

/// Recovery manager implementing ARIES with fuzzy checkpoints.
///
/// The transaction layer calls the forward-processing hooks ([`Self::commit`],
/// [`Self::log_page_write`], ...) as transactions run, and [`Self::restart`] after a
/// crash. The manager keeps the dirty page table and the transaction table in memory
/// and rebuilds them from the log on restart.
pub struct AriesRecoveryManager {
    pub(crate) db_context: LockContext,
    pub(crate) log: Arc<dyn LogStore>,
    pub(crate) disk: Arc<dyn DiskSpaceManager>,
    pub(crate) buffer: Arc<dyn BufferManager>,
    pub(crate) trans_counter: Arc<TransNumGenerator>,
    pub(crate) new_transaction: NewTransactionFn,
    config: RecoveryConfig,
    /// recLSN of every page changed since it was last written to disk.
    pub(crate) dirty_page_table: DashMap<PageNum, Lsn>,
    pub(crate) transaction_table: DashMap<TransNum, TransactionTableEntry>,
}

impl AriesRecoveryManager {
    pub fn new(
        db_context: LockContext,
        log: Arc<dyn LogStore>,
        disk: Arc<dyn DiskSpaceManager>,
        buffer: Arc<dyn BufferManager>,
        trans_counter: Arc<TransNumGenerator>,
        new_transaction: NewTransactionFn,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            db_context,
            log,
            disk,
            buffer,
            trans_counter,
            new_transaction,
            config,
            dirty_page_table: DashMap::new(),
            transaction_table: DashMap::new(),
        }
    }

    /// Set up a fresh database: reset the master record and take a first checkpoint.
    pub fn initialize(&self) -> RecoveryResult<()> {
        self.log.rewrite_master(LogRecord::Master {
            last_checkpoint_lsn: MASTER_LSN,
        })?;
        self.checkpoint()
    }

    pub fn start_transaction(&self, transaction: Arc<dyn Transaction>) {
        self.transaction_table
            .insert(transaction.trans_num(), TransactionTableEntry::new(transaction));
    }

    /// Write a commit record and flush the log through it.
    pub fn commit(&self, trans_num: TransNum) -> RecoveryResult<Lsn> {
        let lsn = self.append_for(trans_num, None, |prev_lsn| LogRecord::CommitTransaction {
            trans_num,
            prev_lsn,
        })?;
        self.log.flush_to_lsn(lsn)?;
        self.set_status(trans_num, TransactionStatus::Committing)?;
        Ok(lsn)
    }

    /// Write an abort record. The changes are rolled back by [`Self::end`].
    pub fn abort(&self, trans_num: TransNum) -> RecoveryResult<Lsn> {
        let lsn = self.append_for(trans_num, None, |prev_lsn| LogRecord::AbortTransaction {
            trans_num,
            prev_lsn,
        })?;
        self.set_status(trans_num, TransactionStatus::Aborting)?;
        Ok(lsn)
    }

    /// Finish a transaction, rolling it back first if it is aborting.
    pub fn end(&self, trans_num: TransNum) -> RecoveryResult<Lsn> {
        let status = self.entry_mut(trans_num)?.transaction.status();
        if status == TransactionStatus::Aborting {
            self.rollback_to_lsn(trans_num, MASTER_LSN)?;
        }
        let (_, entry) = self
            .transaction_table
            .remove(&trans_num)
            .ok_or(RecoveryError::MissingTransaction(trans_num))?;
        entry.transaction.set_status(TransactionStatus::Complete);
        let lsn = self.log.append(LogRecord::EndTransaction {
            trans_num,
            prev_lsn: entry.last_lsn,
        })?;
        debug!(%trans_num, lsn, %status, "transaction ended");
        Ok(lsn)
    }

    /// Called before a page stamped with `page_lsn` is written to disk.
    pub fn page_flush_hook(&self, page_lsn: Lsn) -> RecoveryResult<()> {
        self.log.flush_to_lsn(page_lsn)?;
        Ok(())
    }

    /// Called once a page has been written to disk.
    pub fn disk_io_hook(&self, page_num: PageNum) {
        self.dirty_page_table.remove(&page_num);
    }

    /// Log a write of `after` over `before` at `offset` of a page and return the LSN of
    /// the last record written.
    ///
    /// Writes too large for one record are logged as an undo-only record followed by a
    /// redo-only record.
    pub fn log_page_write(
        &self,
        trans_num: TransNum,
        page_num: PageNum,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> RecoveryResult<Lsn> {
        if before.len() != after.len() {
            return Err(RecoveryError::ImageLengthMismatch {
                before: before.len(),
                after: after.len(),
            });
        }
        let split = before.len() + after.len() > self.effective_page_size() / 2;

        let (first_lsn, last_lsn) = {
            let mut entry = self.entry_mut(trans_num)?;
            let (first_lsn, last_lsn) = if split {
                let undo_lsn = self.log.append(LogRecord::UpdatePage {
                    trans_num,
                    page_num,
                    prev_lsn: entry.last_lsn,
                    offset,
                    before: Some(before.to_vec()),
                    after: None,
                })?;
                let redo_lsn = self.log.append(LogRecord::UpdatePage {
                    trans_num,
                    page_num,
                    prev_lsn: undo_lsn,
                    offset,
                    before: None,
                    after: Some(after.to_vec()),
                })?;
                (undo_lsn, redo_lsn)
            } else {
                let lsn = self.log.append(LogRecord::UpdatePage {
                    trans_num,
                    page_num,
                    prev_lsn: entry.last_lsn,
                    offset,
                    before: Some(before.to_vec()),
                    after: Some(after.to_vec()),
                })?;
                (lsn, lsn)
            };
            entry.last_lsn = last_lsn;
            entry.touched_pages.insert(page_num);
            (first_lsn, last_lsn)
        };
        self.dirty_page_table.entry(page_num).or_insert(first_lsn);
        Ok(last_lsn)
    }

    /// Log the allocation of a partition. Returns `None` for the log partition, which is
    /// never logged.
    pub fn log_alloc_part(
        &self,
        trans_num: TransNum,
        part_num: PartNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part_num == LOG_PARTITION {
            return Ok(None);
        }
        let lsn = self.append_for(trans_num, None, |prev_lsn| LogRecord::AllocPart {
            trans_num,
            part_num,
            prev_lsn,
        })?;
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    pub fn log_free_part(
        &self,
        trans_num: TransNum,
        part_num: PartNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part_num == LOG_PARTITION {
            return Ok(None);
        }
        let lsn = self.append_for(trans_num, None, |prev_lsn| LogRecord::FreePart {
            trans_num,
            part_num,
            prev_lsn,
        })?;
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    pub fn log_alloc_page(
        &self,
        trans_num: TransNum,
        page_num: PageNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part_num(page_num) == LOG_PARTITION {
            return Ok(None);
        }
        let lsn = self.append_for(trans_num, Some(page_num), |prev_lsn| {
            LogRecord::AllocPage {
                trans_num,
                page_num,
                prev_lsn,
            }
        })?;
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    /// Log freeing a page. The page leaves the dirty page table since it will never be
    /// written back.
    pub fn log_free_page(
        &self,
        trans_num: TransNum,
        page_num: PageNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part_num(page_num) == LOG_PARTITION {
            return Ok(None);
        }
        let lsn = self.append_for(trans_num, Some(page_num), |prev_lsn| {
            LogRecord::FreePage {
                trans_num,
                page_num,
                prev_lsn,
            }
        })?;
        self.dirty_page_table.remove(&page_num);
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    pub fn savepoint(&self, trans_num: TransNum, name: &str) -> RecoveryResult<()> {
        self.entry_mut(trans_num)?.add_savepoint(name);
        Ok(())
    }

    pub fn release_savepoint(&self, trans_num: TransNum, name: &str) -> RecoveryResult<()> {
        self.entry_mut(trans_num)?
            .delete_savepoint(name)
            .map(|_| ())
            .ok_or_else(|| RecoveryError::MissingSavepoint(trans_num, name.to_string()))
    }

    /// Undo every change the transaction made after the savepoint `name`. The
    /// transaction keeps running.
    pub fn rollback_to_savepoint(&self, trans_num: TransNum, name: &str) -> RecoveryResult<()> {
        let savepoint = self
            .entry_mut(trans_num)?
            .savepoint(name)
            .ok_or_else(|| RecoveryError::MissingSavepoint(trans_num, name.to_string()))?;
        self.rollback_to_lsn(trans_num, savepoint)
    }

    /// Take a fuzzy checkpoint.
    ///
    /// Writes a begin-checkpoint record, as many end-checkpoint records as the dirty page
    /// table, transaction table and touched pages need, and finally points the master
    /// record at the begin-checkpoint record.
    pub fn checkpoint(&self) -> RecoveryResult<()> {
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint {
            max_trans_num: self.trans_counter.current(),
        })?;

        let mut dirty_pages: Vec<(PageNum, Lsn)> = self
            .dirty_page_table
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        dirty_pages.sort_unstable();
        let mut transactions: Vec<(TransNum, TransactionStatus, Lsn, Vec<PageNum>)> = self
            .transaction_table
            .iter()
            .map(|entry| {
                (
                    *entry.key(),
                    entry.transaction.status(),
                    entry.last_lsn,
                    entry.touched_pages.iter().copied().collect(),
                )
            })
            .collect();
        transactions.sort_unstable_by_key(|(trans_num, ..)| *trans_num);

        let mut builder = EndCheckpointBuilder::new(self.config.end_checkpoint_capacity);
        let mut records = 0;
        for (page_num, rec_lsn) in &dirty_pages {
            if let Some(record) = builder.make_room() {
                self.log.append(record)?;
                records += 1;
            }
            builder.dirty_page_table.insert(*page_num, *rec_lsn);
            builder.entries += 1;
        }
        for (trans_num, status, last_lsn, _) in &transactions {
            if let Some(record) = builder.make_room() {
                self.log.append(record)?;
                records += 1;
            }
            builder
                .transaction_table
                .insert(*trans_num, (*status, *last_lsn));
            builder.entries += 1;
        }
        for (trans_num, _, _, pages) in &transactions {
            for page_num in pages {
                if let Some(record) = builder.make_room() {
                    self.log.append(record)?;
                    records += 1;
                }
                builder
                    .touched_pages
                    .entry(*trans_num)
                    .or_default()
                    .push(*page_num);
                builder.entries += 1;
            }
        }
        let end_lsn = self.log.append(builder.take())?;
        records += 1;

        self.log.flush_to_lsn(end_lsn)?;
        self.log.rewrite_master(LogRecord::Master {
            last_checkpoint_lsn: begin_lsn,
        })?;
        info!(
            begin_lsn,
            end_records = records,
            dirty_pages = dirty_pages.len(),
            transactions = transactions.len(),
            "checkpoint complete"
        );
        Ok(())
    }

    /// Take a final checkpoint and close the log.
    pub fn close(&self) -> RecoveryResult<()> {
        self.checkpoint()?;
        self.log.close()?;
        Ok(())
    }

    /// Snapshot of the dirty page table.
    pub fn dirty_page_table(&self) -> BTreeMap<PageNum, Lsn> {
        self.dirty_page_table
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Transactions currently in the transaction table.
    pub fn active_transactions(&self) -> Vec<TransNum> {
        let mut active: Vec<TransNum> = self
            .transaction_table
            .iter()
            .map(|entry| *entry.key())
            .collect();
        active.sort_unstable();
        active
    }

    pub fn transaction(&self, trans_num: TransNum) -> Option<Arc<dyn Transaction>> {
        self.transaction_table
            .get(&trans_num)
            .map(|entry| entry.transaction.clone())
    }

    pub fn last_lsn(&self, trans_num: TransNum) -> Option<Lsn> {
        self.transaction_table
            .get(&trans_num)
            .map(|entry| entry.last_lsn)
    }

    pub fn touched_pages(&self, trans_num: TransNum) -> Option<BTreeSet<PageNum>> {
        self.transaction_table
            .get(&trans_num)
            .map(|entry| entry.touched_pages.clone())
    }

    pub(crate) fn effective_page_size(&self) -> usize {
        self.config
            .effective_page_size
            .unwrap_or_else(|| self.buffer.effective_page_size())
    }

    pub(crate) fn entry_mut(
        &self,
        trans_num: TransNum,
    ) -> RecoveryResult<RefMut<'_, TransNum, TransactionTableEntry>> {
        self.transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::MissingTransaction(trans_num))
    }

    fn set_status(&self, trans_num: TransNum, status: TransactionStatus) -> RecoveryResult<()> {
        self.entry_mut(trans_num)?.transaction.set_status(status);
        Ok(())
    }

    /// Append the record built from the transaction's last LSN and make it the new last
    /// LSN.
    fn append_for(
        &self,
        trans_num: TransNum,
        touched_page: Option<PageNum>,
        make_record: impl FnOnce(Lsn) -> LogRecord,
    ) -> RecoveryResult<Lsn> {
        let mut entry = self.entry_mut(trans_num)?;
        let lsn = self.log.append(make_record(entry.last_lsn))?;
        entry.last_lsn = lsn;
        if let Some(page_num) = touched_page {
            entry.touched_pages.insert(page_num);
        }
        Ok(lsn)
    }

    /// Undo the transaction's changes with LSNs greater than `target`, newest first.
    fn rollback_to_lsn(&self, trans_num: TransNum, target: Lsn) -> RecoveryResult<()> {
        let mut next = self.entry_mut(trans_num)?.last_lsn;
        while next > target {
            let LogEntry { record, .. } = self.log.fetch(next)?;
            if record.trans_num() != Some(trans_num) {
                return Err(RecoveryError::CorruptLog(format!(
                    "record at LSN {next} does not belong to {trans_num}"
                )));
            }
            self.undo_record(trans_num, &record)?;
            next = record
                .undo_next_lsn()
                .or_else(|| record.prev_lsn())
                .unwrap_or(MASTER_LSN);
        }
        Ok(())
    }

    /// Write and apply the compensation record for `record`, if it can be undone.
    pub(crate) fn undo_record(
        &self,
        trans_num: TransNum,
        record: &LogRecord,
    ) -> RecoveryResult<bool> {
        let (clr, clr_lsn, flush) = {
            let mut entry = self.entry_mut(trans_num)?;
            let Some((clr, flush)) = record.undo(entry.last_lsn) else {
                return Ok(false);
            };
            let clr_lsn = self.log.append(clr.clone())?;
            entry.last_lsn = clr_lsn;
            (clr, clr_lsn, flush)
        };
        if flush {
            self.log.flush_to_lsn(clr_lsn)?;
        }
        clr.redo(clr_lsn, self.disk.as_ref(), self.buffer.as_ref())?;
        if let Some(page_num) = clr.page_num() {
            if matches!(clr, LogRecord::UndoUpdatePage { .. }) {
                self.dirty_page_table.entry(page_num).or_insert(clr_lsn);
            } else {
                self.dirty_page_table.remove(&page_num);
            }
        }
        Ok(true)
    }

    /// Take an X lock on a page, with the intent locks above it, for `transaction`.
    pub(crate) fn lock_page(
        &self,
        transaction: &Arc<dyn Transaction>,
        page_num: PageNum,
    ) -> RecoveryResult<()> {
        let context = self
            .db_context
            .child(part_num(page_num) as u64)
            .child(page_num);
        ensure_sufficient_lock_held(&context, transaction.context(), LockType::X)?;
        Ok(())
    }
}

impl FlushListener for AriesRecoveryManager {
    fn page_flush_hook(&self, page_lsn: Lsn) -> RecoveryResult<()> {
        AriesRecoveryManager::page_flush_hook(self, page_lsn)
    }

    fn disk_io_hook(&self, page_num: PageNum) {
        AriesRecoveryManager::disk_io_hook(self, page_num)
    }
}
