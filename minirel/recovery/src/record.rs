//! Log records.
//!
//! Every record knows whether it can be redone and undone. Undoing a record yields a
//! compensation record (CLR) that redoes the inverse change and points, through its
//! `undo_next_lsn`, at the next record of the transaction still to be undone.

use std::collections::BTreeMap;

use minirel_transaction::{TransNum, TransactionStatus};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumDiscriminants};
use tracing::warn;

use crate::buffer::BufferManager;
use crate::disk::{DiskSpaceManager, PageNum, PartNum};
use crate::error::{DiskResult, LogError, LogResult, RecoveryResult};

/// Log sequence number. LSN 0 is the master record, so no transaction record ever has
/// it and a `prev_lsn` of 0 marks the start of a transaction's chain.
pub type Lsn = u64;

/// LSN of the master record.
pub const MASTER_LSN: Lsn = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(LogType), derive(Display, Hash))]
pub enum LogRecord {
    /// Points at the begin-checkpoint record of the last complete checkpoint.
    Master { last_checkpoint_lsn: Lsn },
    BeginCheckpoint {
        /// Next transaction number to be handed out.
        max_trans_num: u64,
    },
    EndCheckpoint {
        dirty_page_table: BTreeMap<PageNum, Lsn>,
        transaction_table: BTreeMap<TransNum, (TransactionStatus, Lsn)>,
        touched_pages: BTreeMap<TransNum, Vec<PageNum>>,
    },
    CommitTransaction {
        trans_num: TransNum,
        prev_lsn: Lsn,
    },
    AbortTransaction {
        trans_num: TransNum,
        prev_lsn: Lsn,
    },
    EndTransaction {
        trans_num: TransNum,
        prev_lsn: Lsn,
    },
    /// A write to a page. Large writes are split into an undo-only record (no `after`)
    /// followed by a redo-only record (no `before`).
    UpdatePage {
        trans_num: TransNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        offset: u16,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    },
    UndoUpdatePage {
        trans_num: TransNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        offset: u16,
        after: Vec<u8>,
    },
    AllocPart {
        trans_num: TransNum,
        part_num: PartNum,
        prev_lsn: Lsn,
    },
    FreePart {
        trans_num: TransNum,
        part_num: PartNum,
        prev_lsn: Lsn,
    },
    UndoAllocPart {
        trans_num: TransNum,
        part_num: PartNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    UndoFreePart {
        trans_num: TransNum,
        part_num: PartNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    AllocPage {
        trans_num: TransNum,
        page_num: PageNum,
        prev_lsn: Lsn,
    },
    FreePage {
        trans_num: TransNum,
        page_num: PageNum,
        prev_lsn: Lsn,
    },
    UndoAllocPage {
        trans_num: TransNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    UndoFreePage {
        trans_num: TransNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
}

/// A record together with the LSN it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub record: LogRecord,
}

impl LogRecord {
    pub fn log_type(&self) -> LogType {
        self.into()
    }

    pub fn trans_num(&self) -> Option<TransNum> {
        use LogRecord::*;
        match self {
            Master { .. } | BeginCheckpoint { .. } | EndCheckpoint { .. } => None,
            CommitTransaction { trans_num, .. }
            | AbortTransaction { trans_num, .. }
            | EndTransaction { trans_num, .. }
            | UpdatePage { trans_num, .. }
            | UndoUpdatePage { trans_num, .. }
            | AllocPart { trans_num, .. }
            | FreePart { trans_num, .. }
            | UndoAllocPart { trans_num, .. }
            | UndoFreePart { trans_num, .. }
            | AllocPage { trans_num, .. }
            | FreePage { trans_num, .. }
            | UndoAllocPage { trans_num, .. }
            | UndoFreePage { trans_num, .. } => Some(*trans_num),
        }
    }

    /// LSN of the previous record of the same transaction.
    pub fn prev_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            Master { .. } | BeginCheckpoint { .. } | EndCheckpoint { .. } => None,
            CommitTransaction { prev_lsn, .. }
            | AbortTransaction { prev_lsn, .. }
            | EndTransaction { prev_lsn, .. }
            | UpdatePage { prev_lsn, .. }
            | UndoUpdatePage { prev_lsn, .. }
            | AllocPart { prev_lsn, .. }
            | FreePart { prev_lsn, .. }
            | UndoAllocPart { prev_lsn, .. }
            | UndoFreePart { prev_lsn, .. }
            | AllocPage { prev_lsn, .. }
            | FreePage { prev_lsn, .. }
            | UndoAllocPage { prev_lsn, .. }
            | UndoFreePage { prev_lsn, .. } => Some(*prev_lsn),
        }
    }

    /// For compensation records, the next record of the transaction left to undo.
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UndoUpdatePage { undo_next_lsn, .. }
            | UndoAllocPart { undo_next_lsn, .. }
            | UndoFreePart { undo_next_lsn, .. }
            | UndoAllocPage { undo_next_lsn, .. }
            | UndoFreePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn page_num(&self) -> Option<PageNum> {
        use LogRecord::*;
        match self {
            UpdatePage { page_num, .. }
            | UndoUpdatePage { page_num, .. }
            | AllocPage { page_num, .. }
            | FreePage { page_num, .. }
            | UndoAllocPage { page_num, .. }
            | UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    pub fn part_num(&self) -> Option<PartNum> {
        use LogRecord::*;
        match self {
            AllocPart { part_num, .. }
            | FreePart { part_num, .. }
            | UndoAllocPart { part_num, .. }
            | UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    pub fn is_redoable(&self) -> bool {
        use LogRecord::*;
        match self {
            UpdatePage { after, .. } => after.is_some(),
            UndoUpdatePage { .. }
            | AllocPart { .. }
            | FreePart { .. }
            | UndoAllocPart { .. }
            | UndoFreePart { .. }
            | AllocPage { .. }
            | FreePage { .. }
            | UndoAllocPage { .. }
            | UndoFreePage { .. } => true,
            _ => false,
        }
    }

    pub fn is_undoable(&self) -> bool {
        use LogRecord::*;
        match self {
            UpdatePage { before, .. } => before.is_some(),
            AllocPart { .. } | FreePart { .. } | AllocPage { .. } | FreePage { .. } => true,
            _ => false,
        }
    }

    /// The compensation record undoing this record, and whether the log must be flushed
    /// through it before it is applied. `last_lsn` is the transaction's last LSN and
    /// becomes the CLR's `prev_lsn`.
    ///
    /// Returns `None` for records that cannot be undone.
    pub fn undo(&self, last_lsn: Lsn) -> Option<(LogRecord, bool)> {
        use LogRecord::*;
        let clr = match self {
            UpdatePage {
                trans_num,
                page_num,
                prev_lsn,
                offset,
                before: Some(before),
                ..
            } => {
                return Some((
                    UndoUpdatePage {
                        trans_num: *trans_num,
                        page_num: *page_num,
                        prev_lsn: last_lsn,
                        undo_next_lsn: *prev_lsn,
                        offset: *offset,
                        after: before.clone(),
                    },
                    false,
                ));
            }
            AllocPart {
                trans_num,
                part_num,
                prev_lsn,
            } => UndoAllocPart {
                trans_num: *trans_num,
                part_num: *part_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            FreePart {
                trans_num,
                part_num,
                prev_lsn,
            } => UndoFreePart {
                trans_num: *trans_num,
                part_num: *part_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            AllocPage {
                trans_num,
                page_num,
                prev_lsn,
            } => UndoAllocPage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            FreePage {
                trans_num,
                page_num,
                prev_lsn,
            } => UndoFreePage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            _ => return None,
        };
        // Allocation changes reach the disk immediately, so their CLRs must be durable
        // first.
        Some((clr, true))
    }

    /// Reapply the change described by this record, which was written at `lsn`.
    ///
    /// Allocation errors meaning the change is already on disk are logged and ignored.
    /// Records that are not redoable are left alone.
    pub fn redo(
        &self,
        lsn: Lsn,
        disk: &dyn DiskSpaceManager,
        buffer: &dyn BufferManager,
    ) -> RecoveryResult<()> {
        use LogRecord::*;
        match self {
            UpdatePage {
                page_num,
                offset,
                after: Some(after),
                ..
            }
            | UndoUpdatePage {
                page_num,
                offset,
                after,
                ..
            } => {
                buffer.write_page(*page_num, *offset as usize, after, lsn)?;
                Ok(())
            }
            AllocPart { part_num, .. } | UndoFreePart { part_num, .. } => {
                self.tolerate_applied(lsn, disk.alloc_part(*part_num))
            }
            FreePart { part_num, .. } | UndoAllocPart { part_num, .. } => {
                self.tolerate_applied(lsn, buffer.free_part(*part_num))
            }
            AllocPage { page_num, .. } | UndoFreePage { page_num, .. } => {
                self.tolerate_applied(lsn, disk.alloc_page(*page_num))
            }
            FreePage { page_num, .. } | UndoAllocPage { page_num, .. } => {
                self.tolerate_applied(lsn, buffer.free_page(*page_num))
            }
            _ => Ok(()),
        }
    }

    fn tolerate_applied<T>(&self, lsn: Lsn, result: DiskResult<T>) -> RecoveryResult<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_applied() => {
                warn!(lsn, log_type = %self.log_type(), error = %e, "redo found change already applied");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_bytes(&self) -> LogResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| LogError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> LogResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| LogError::DeserializationFailed(e.to_string()))
    }
}
