//! Restart recovery: analysis, redo and undo.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use minirel_transaction::{Transaction, TransNum, TransactionStatus};
use tracing::{debug, info, warn};

use crate::error::{RecoveryError, RecoveryResult};
use crate::manager::AriesRecoveryManager;
use crate::record::{LogEntry, LogRecord, Lsn, MASTER_LSN};
use crate::table::TransactionTableEntry;

impl AriesRecoveryManager {
    /// Recover after a crash.
    ///
    /// Runs analysis and redo, then drops pages that are cached and clean from the dirty
    /// page table. Undo and the closing checkpoint are left to the returned step, so new
    /// transactions may start before the losers are rolled back.
    pub fn restart(
        self: &Arc<Self>,
    ) -> RecoveryResult<impl FnOnce() -> RecoveryResult<()> + Send + 'static> {
        self.restart_analysis()?;
        self.restart_redo()?;

        let mut clean = Vec::new();
        self.buffer.iter_page_nums(&mut |page_num, dirty| {
            if !dirty {
                clean.push(page_num);
            }
        });
        for page_num in clean {
            self.dirty_page_table.remove(&page_num);
        }

        let manager = Arc::clone(self);
        Ok(move || {
            manager.restart_undo()?;
            manager.checkpoint()
        })
    }

    /// Rebuild the dirty page table and transaction table from the last checkpoint
    /// onwards.
    ///
    /// Committing transactions are ended and running ones are marked as aborting;
    /// transactions still active afterwards hold X locks on every page they touched.
    pub fn restart_analysis(&self) -> RecoveryResult<()> {
        info!("Starting analysis phase of recovery");
        let LogRecord::Master {
            last_checkpoint_lsn,
        } = self.log.fetch(MASTER_LSN)?.record
        else {
            return Err(RecoveryError::CorruptLog(format!(
                "no master record at LSN {MASTER_LSN}"
            )));
        };

        let mut ended = HashSet::new();
        let mut scanned = 0usize;
        for entry in self.log.scan_from(last_checkpoint_lsn)? {
            let LogEntry { lsn, record } = entry?;
            scanned += 1;
            match &record {
                LogRecord::Master { .. } => {}
                LogRecord::BeginCheckpoint { max_trans_num } => {
                    self.trans_counter.update_if_greater(*max_trans_num);
                }
                LogRecord::EndCheckpoint {
                    dirty_page_table,
                    transaction_table,
                    touched_pages,
                } => {
                    for (&page_num, &rec_lsn) in dirty_page_table {
                        self.dirty_page_table.insert(page_num, rec_lsn);
                    }
                    for (trans_num, &(status, last_lsn)) in transaction_table {
                        if ended.contains(trans_num) {
                            continue;
                        }
                        let mut entry = self.recovered_entry(*trans_num);
                        entry.last_lsn = entry.last_lsn.max(last_lsn);
                        if entry.transaction.status() == TransactionStatus::Running {
                            match status {
                                TransactionStatus::Committing => {
                                    entry.transaction.set_status(TransactionStatus::Committing)
                                }
                                TransactionStatus::Aborting
                                | TransactionStatus::RecoveryAborting => entry
                                    .transaction
                                    .set_status(TransactionStatus::RecoveryAborting),
                                _ => {}
                            }
                        }
                    }
                    for (trans_num, pages) in touched_pages {
                        if ended.contains(trans_num) {
                            continue;
                        }
                        let transaction = {
                            let mut entry = self.recovered_entry(*trans_num);
                            entry.touched_pages.extend(pages.iter().copied());
                            entry.transaction.clone()
                        };
                        for &page_num in pages {
                            self.lock_page(&transaction, page_num)?;
                        }
                    }
                }
                LogRecord::CommitTransaction { trans_num, .. } => {
                    let mut entry = self.recovered_entry(*trans_num);
                    entry.last_lsn = lsn;
                    entry.transaction.set_status(TransactionStatus::Committing);
                }
                LogRecord::AbortTransaction { trans_num, .. } => {
                    let mut entry = self.recovered_entry(*trans_num);
                    entry.last_lsn = lsn;
                    entry
                        .transaction
                        .set_status(TransactionStatus::RecoveryAborting);
                }
                LogRecord::EndTransaction { trans_num, .. } => {
                    let transaction = self.recovered_entry(*trans_num).transaction.clone();
                    self.transaction_table.remove(trans_num);
                    transaction.cleanup();
                    transaction.set_status(TransactionStatus::Complete);
                    ended.insert(*trans_num);
                }
                _ => self.analyze_operation(lsn, &record)?,
            }
        }

        let mut committing = Vec::new();
        let mut running = Vec::new();
        for entry in self.transaction_table.iter() {
            match entry.transaction.status() {
                TransactionStatus::Committing => committing.push(*entry.key()),
                TransactionStatus::Running => running.push(*entry.key()),
                _ => {}
            }
        }
        committing.sort_unstable();
        running.sort_unstable();

        for trans_num in &committing {
            let Some((_, entry)) = self.transaction_table.remove(trans_num) else {
                continue;
            };
            self.log.append(LogRecord::EndTransaction {
                trans_num: *trans_num,
                prev_lsn: entry.last_lsn,
            })?;
            entry.transaction.cleanup();
            entry.transaction.set_status(TransactionStatus::Complete);
        }
        for trans_num in &running {
            let mut entry = self.entry_mut(*trans_num)?;
            entry.last_lsn = self.log.append(LogRecord::AbortTransaction {
                trans_num: *trans_num,
                prev_lsn: entry.last_lsn,
            })?;
            entry
                .transaction
                .set_status(TransactionStatus::RecoveryAborting);
        }

        info!(
            scanned,
            dirty_pages = self.dirty_page_table.len(),
            ended = committing.len(),
            aborting = running.len(),
            "Analysis phase complete"
        );
        Ok(())
    }

    /// Track a page or partition operation of a transaction during analysis.
    fn analyze_operation(&self, lsn: Lsn, record: &LogRecord) -> RecoveryResult<()> {
        let Some(trans_num) = record.trans_num() else {
            return Ok(());
        };
        let page_num = record.page_num();
        let transaction = {
            let mut entry = self.recovered_entry(trans_num);
            entry.last_lsn = lsn;
            if let Some(page_num) = page_num {
                entry.touched_pages.insert(page_num);
            }
            entry.transaction.clone()
        };
        let Some(page_num) = page_num else {
            return Ok(());
        };
        self.lock_page(&transaction, page_num)?;
        match record {
            LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                self.dirty_page_table.entry(page_num).or_insert(lsn);
            }
            _ => {
                // Allocation changes go straight to disk.
                self.dirty_page_table.remove(&page_num);
            }
        }
        Ok(())
    }

    /// Reapply every redoable change from the oldest recLSN onwards that may not have
    /// reached disk.
    pub fn restart_redo(&self) -> RecoveryResult<()> {
        let Some(start) = self
            .dirty_page_table
            .iter()
            .map(|entry| *entry.value())
            .min()
        else {
            info!("No dirty pages, skipping redo phase");
            return Ok(());
        };
        info!(start, "Starting redo phase of recovery");

        let mut redone = 0usize;
        for entry in self.log.scan_from(start)? {
            let LogEntry { lsn, record } = entry?;
            if !record.is_redoable() {
                continue;
            }
            if let Some(page_num) = record.page_num() {
                let rec_lsn = self.dirty_page_table.get(&page_num).map(|rec| *rec);
                if !rec_lsn.is_some_and(|rec_lsn| rec_lsn <= lsn) {
                    continue;
                }
                let page_lsn = match self.buffer.page_lsn(page_num) {
                    Ok(page_lsn) => page_lsn,
                    Err(e) if e.is_already_applied() => {
                        warn!(lsn, page_num, error = %e, "Skipping redo of missing page");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if page_lsn >= lsn {
                    continue;
                }
            }
            record.redo(lsn, self.disk.as_ref(), self.buffer.as_ref())?;
            redone += 1;
        }

        info!(redone, "Redo phase complete");
        Ok(())
    }

    /// Roll back every transaction marked as aborting by analysis, always undoing the
    /// record with the highest LSN next.
    pub fn restart_undo(&self) -> RecoveryResult<()> {
        let mut queue: BinaryHeap<(Lsn, TransNum)> = self
            .transaction_table
            .iter()
            .filter(|entry| entry.transaction.status() == TransactionStatus::RecoveryAborting)
            .map(|entry| (entry.last_lsn, *entry.key()))
            .collect();
        info!(losers = queue.len(), "Starting undo phase of recovery");

        let mut compensated = 0usize;
        while let Some((lsn, trans_num)) = queue.pop() {
            let record = self.log.fetch(lsn)?.record;
            if self.undo_record(trans_num, &record)? {
                compensated += 1;
            }
            let next = record
                .undo_next_lsn()
                .or_else(|| record.prev_lsn())
                .unwrap_or(MASTER_LSN);
            if next != MASTER_LSN {
                queue.push((next, trans_num));
                continue;
            }

            let (_, entry) = self
                .transaction_table
                .remove(&trans_num)
                .ok_or(RecoveryError::MissingTransaction(trans_num))?;
            self.log.append(LogRecord::EndTransaction {
                trans_num,
                prev_lsn: entry.last_lsn,
            })?;
            entry.transaction.cleanup();
            entry.transaction.set_status(TransactionStatus::Complete);
            debug!(%trans_num, "Rolled back transaction");
        }

        info!(compensated, "Undo phase complete");
        Ok(())
    }

    /// Table entry for a transaction found in the log, creating it on first sight.
    fn recovered_entry(
        &self,
        trans_num: TransNum,
    ) -> RefMut<'_, TransNum, TransactionTableEntry> {
        self.trans_counter.update_if_greater(trans_num.raw() + 1);
        self.transaction_table.entry(trans_num).or_insert_with(|| {
            let transaction: Arc<dyn Transaction> = (self.new_transaction)(trans_num);
            TransactionTableEntry::new(transaction)
        })
    }
}
