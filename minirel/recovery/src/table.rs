use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use minirel_transaction::Transaction;

use crate::disk::PageNum;
use crate::record::Lsn;

/// Recovery bookkeeping for one live transaction.
pub struct TransactionTableEntry {
    pub transaction: Arc<dyn Transaction>,
    /// LSN of the transaction's most recent record, or 0 before it wrote any.
    pub last_lsn: Lsn,
    pub touched_pages: BTreeSet<PageNum>,
    savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    pub fn new(transaction: Arc<dyn Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: 0,
            touched_pages: BTreeSet::new(),
            savepoints: HashMap::new(),
        }
    }

    /// Mark the current position as `name`, replacing an older savepoint of that name.
    pub fn add_savepoint(&mut self, name: &str) {
        self.savepoints.insert(name.to_string(), self.last_lsn);
    }

    pub fn savepoint(&self, name: &str) -> Option<Lsn> {
        self.savepoints.get(name).copied()
    }

    pub fn delete_savepoint(&mut self, name: &str) -> Option<Lsn> {
        self.savepoints.remove(name)
    }
}

impl fmt::Debug for TransactionTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTableEntry")
            .field("trans_num", &self.transaction.trans_num())
            .field("status", &self.transaction.status())
            .field("last_lsn", &self.last_lsn)
            .field("touched_pages", &self.touched_pages)
            .field("savepoints", &self.savepoints)
            .finish()
    }
}
