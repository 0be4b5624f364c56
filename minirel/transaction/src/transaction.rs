//! Transaction trait and related functionality
//!
//! This module defines the interface the recovery manager and lock layer use to drive a
//! transaction, independent of how the database runtime implements it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::context::TransactionContext;
use crate::trans_num::TransNum;

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Running,
    Committing,
    /// Aborted during normal operation; rolled back when the transaction ends.
    Aborting,
    /// Found unfinished during restart; rolled back by the undo pass.
    RecoveryAborting,
    Complete,
}

/// Trait defining the runtime operations recovery and locking need from a transaction.
pub trait Transaction: Send + Sync {
    /// Get the transaction number
    fn trans_num(&self) -> TransNum;

    fn status(&self) -> TransactionStatus;

    fn set_status(&self, status: TransactionStatus);

    /// Blocking context handed to the lock manager for this transaction.
    fn context(&self) -> &Arc<TransactionContext>;

    /// Release every resource the transaction holds (locks, pins). Called once the
    /// transaction is finished, including when recovery ends it.
    fn cleanup(&self);
}
