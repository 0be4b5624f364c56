//! Hierarchical multigranularity locking for minirel.
//!
//! [`LockManager`] keeps the flat per-resource lock table and wait queues,
//! [`LockContext`] layers the database → table → page hierarchy on top of it, and
//! [`ensure_sufficient_lock_held`] picks the locks a read or write needs.
//!
//! ```
//! use std::sync::Arc;
//!
//! use minirel_concurrency::{LockManager, LockType, ensure_sufficient_lock_held};
//! use minirel_transaction::{TransNum, TransactionContext};
//!
//! let manager = Arc::new(LockManager::new());
//! let page = manager.database_context().child_context("table1", 1).child(5);
//! let txn = Arc::new(TransactionContext::new(TransNum::new(1)));
//!
//! ensure_sufficient_lock_held(&page, &txn, LockType::X).unwrap();
//! assert_eq!(page.effective_lock_type(txn.trans_num()), LockType::X);
//! ```

pub mod context;
pub mod error;
pub mod lock;
pub mod lock_type;
pub mod manager;
pub mod resource;
pub mod util;

pub use context::{ContextId, LockContext};
pub use error::{LockError, LockResult};
pub use lock::Lock;
pub use lock_type::LockType;
pub use manager::{DATABASE_RESOURCE_ID, LockManager};
pub use resource::ResourceName;
pub use util::ensure_sufficient_lock_held;
