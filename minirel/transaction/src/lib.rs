//! Common transaction infrastructure for the minirel storage engine.
//!
//! This crate provides the transaction-related types shared by the lock manager and the
//! recovery manager: transaction numbers, lifecycle status, the runtime contract a
//! transaction implements, and the blocking primitives used to suspend lock waiters.

pub mod context;
pub mod error;
pub mod trans_num;
pub mod transaction;

pub use context::TransactionContext;
pub use error::TransNumError;
pub use trans_num::{TransNum, TransNumGenerator};
pub use transaction::{Transaction, TransactionStatus};
