//! Per-transaction blocking primitives used by the lock manager.
//!
//! A waiter is registered with [`TransactionContext::prepare_block`] while the lock
//! manager's critical section is still held, and the caller parks in
//! [`TransactionContext::block`] only after leaving it. A grant that happens in between
//! clears the flag first, so the wakeup cannot be lost.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::trans_num::TransNum;

pub struct TransactionContext {
    trans_num: TransNum,
    blocked: Mutex<bool>,
    unblocked: Condvar,
}

impl TransactionContext {
    pub fn new(trans_num: TransNum) -> Self {
        Self {
            trans_num,
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
        }
    }

    pub fn trans_num(&self) -> TransNum {
        self.trans_num
    }

    /// Mark the transaction as about to block.
    pub fn prepare_block(&self) {
        *self.blocked.lock() = true;
    }

    /// Park the calling thread until [`Self::unblock`] is called. Returns immediately if
    /// the transaction was unblocked after `prepare_block`.
    pub fn block(&self) {
        let mut blocked = self.blocked.lock();
        while *blocked {
            self.unblocked.wait(&mut blocked);
        }
    }

    /// Wake the transaction if it is blocked.
    pub fn unblock(&self) {
        let mut blocked = self.blocked.lock();
        *blocked = false;
        self.unblocked.notify_all();
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("trans_num", &self.trans_num)
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
