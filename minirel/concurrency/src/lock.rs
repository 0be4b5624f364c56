use std::fmt;
use std::sync::Arc;

use minirel_transaction::{TransNum, TransactionContext};

use crate::lock_type::LockType;
use crate::resource::ResourceName;

/// A lock granted to (or requested by) a transaction on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: ResourceName,
    pub lock_type: LockType,
    pub trans_num: TransNum,
}

impl Lock {
    pub fn new(name: ResourceName, lock_type: LockType, trans_num: TransNum) -> Self {
        Self {
            name,
            lock_type,
            trans_num,
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}({})", self.trans_num, self.lock_type, self.name)
    }
}

/// A pending request in a resource's wait queue.
#[derive(Debug)]
pub(crate) struct LockRequest {
    /// Waiter to wake once the request is granted.
    pub transaction: Arc<TransactionContext>,
    pub lock: Lock,
    /// Resources whose locks are released once `lock` is granted.
    pub released: Vec<ResourceName>,
}

impl LockRequest {
    pub fn new(transaction: Arc<TransactionContext>, lock: Lock) -> Self {
        Self::with_released(transaction, lock, Vec::new())
    }

    pub fn with_released(
        transaction: Arc<TransactionContext>,
        lock: Lock,
        released: Vec<ResourceName>,
    ) -> Self {
        Self {
            transaction,
            lock,
            released,
        }
    }
}
