//! Lock acquisition policy.
//!
//! Callers that only know "I need to read" or "I need to write" a resource go through
//! [`ensure_sufficient_lock_held`], which takes whatever intent locks, promotions and
//! escalations are needed along the path from the root.

use std::sync::Arc;

use minirel_transaction::TransactionContext;

use crate::context::LockContext;
use crate::error::{LockError, LockResult};
use crate::lock_type::LockType;

/// Make sure `transaction` can perform `lock_type` (NL, S or X) operations on the
/// resource of `context`, acquiring as little as possible.
///
/// Does nothing if the transaction's effective lock already substitutes `lock_type`.
/// Otherwise ancestors get the intent locks they need (IS or IX, or SIX where a shared
/// lock and an intent-exclusive requirement meet), and the resource itself gets the lock
/// by acquisition, promotion or escalation of the transaction's finer locks. Blocks until
/// every required lock is granted.
pub fn ensure_sufficient_lock_held(
    context: &LockContext,
    transaction: &Arc<TransactionContext>,
    lock_type: LockType,
) -> LockResult<()> {
    use LockType::*;
    match lock_type {
        NL => return Ok(()),
        S | X => {}
        other => {
            return Err(LockError::InvalidLock(format!(
                "only S or X can be requested for {}, not {other}",
                context.resource_name()
            )));
        }
    }

    let trans_num = transaction.trans_num();
    if context.effective_lock_type(trans_num).substitutes(lock_type) {
        return Ok(());
    }

    let held = context.explicit_lock_type(trans_num);
    let wanted = combine(held, lock_type);
    if let Some(parent) = context.parent_context() {
        ensure_ancestor_lock(&parent, transaction, wanted.parent_lock())?;
    }

    if held == NL {
        return context.acquire(transaction, wanted);
    }
    if can_escalate_to(held, wanted) {
        context.escalate(transaction)?;
        if context.explicit_lock_type(trans_num).substitutes(wanted) {
            return Ok(());
        }
    }
    context.promote(transaction, wanted)
}

/// Give the transaction at least a `required` intent lock on `context` and, recursively,
/// whatever its ancestors need for that.
fn ensure_ancestor_lock(
    context: &LockContext,
    transaction: &Arc<TransactionContext>,
    required: LockType,
) -> LockResult<()> {
    let trans_num = transaction.trans_num();
    let held = context.explicit_lock_type(trans_num);
    if held.substitutes(required) {
        return Ok(());
    }

    let wanted = combine(held, required);
    if let Some(parent) = context.parent_context() {
        ensure_ancestor_lock(&parent, transaction, wanted.parent_lock())?;
    }
    if held == LockType::NL {
        context.acquire(transaction, wanted)
    } else {
        context.promote(transaction, wanted)
    }
}

/// The lock that covers both the held lock and a new requirement.
fn combine(held: LockType, required: LockType) -> LockType {
    use LockType::*;
    match (held, required) {
        (S, IX) | (IX, S) => SIX,
        _ => required,
    }
}

/// Whether collapsing the transaction's finer locks into `held`'s resource moves towards
/// `wanted`. Escalating IX into SIX is never done: IX already covers writes below.
fn can_escalate_to(held: LockType, wanted: LockType) -> bool {
    use LockType::*;
    matches!(held, IS | IX | SIX) && !(held == IX && wanted == SIX)
}

#[cfg(test)]
mod tests {
    use minirel_transaction::TransNum;

    use super::*;
    use crate::lock_type::LockType::*;
    use crate::manager::LockManager;

    fn txn(n: u64) -> Arc<TransactionContext> {
        Arc::new(TransactionContext::new(TransNum::new(n)))
    }

    #[test]
    fn test_acquires_intent_locks_on_ancestors() {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        let page = db.child_context("table1", 1).child(5);
        let t1 = txn(1);

        ensure_sufficient_lock_held(&page, &t1, X).unwrap();
        let locks: Vec<_> = manager
            .transaction_locks(t1.trans_num())
            .into_iter()
            .map(|lock| (lock.name.to_string(), lock.lock_type))
            .collect();
        assert_eq!(locks, vec![
            ("database".to_string(), IX),
            ("database/table1".to_string(), IX),
            ("database/table1/5".to_string(), X),
        ]);

        // Already sufficient: nothing changes.
        let before = manager.mutation_count();
        ensure_sufficient_lock_held(&page, &t1, S).unwrap();
        ensure_sufficient_lock_held(&page, &t1, NL).unwrap();
        assert_eq!(manager.mutation_count(), before);
    }

    #[test]
    fn test_shared_then_exclusive_promotes() {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        let table = db.child_context("table1", 1);
        let t1 = txn(1);
        let n = t1.trans_num();

        ensure_sufficient_lock_held(&table, &t1, S).unwrap();
        assert_eq!(db.explicit_lock_type(n), IS);
        assert_eq!(table.explicit_lock_type(n), S);

        ensure_sufficient_lock_held(&table, &t1, X).unwrap();
        assert_eq!(db.explicit_lock_type(n), IX);
        assert_eq!(table.explicit_lock_type(n), X);
    }

    #[test]
    fn test_shared_ancestor_becomes_six() {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        let table = db.child_context("table1", 1);
        let page = table.child(3);
        let t1 = txn(1);
        let n = t1.trans_num();

        ensure_sufficient_lock_held(&table, &t1, S).unwrap();
        ensure_sufficient_lock_held(&page, &t1, X).unwrap();
        assert_eq!(db.explicit_lock_type(n), IX);
        assert_eq!(table.explicit_lock_type(n), SIX);
        assert_eq!(page.explicit_lock_type(n), X);
        assert_eq!(table.effective_lock_type(n), S);
    }

    #[test]
    fn test_intent_lock_plus_shared_becomes_six() {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        let table = db.child_context("table1", 1);
        let t1 = txn(1);
        let n = t1.trans_num();

        ensure_sufficient_lock_held(&table.child(1), &t1, X).unwrap();
        ensure_sufficient_lock_held(&table.child(2), &t1, S).unwrap();
        ensure_sufficient_lock_held(&table, &t1, S).unwrap();
        assert_eq!(table.explicit_lock_type(n), SIX);
        assert_eq!(table.child(1).explicit_lock_type(n), X);
        assert_eq!(table.child(2).explicit_lock_type(n), NL);
    }

    #[test]
    fn test_intent_lock_escalates() {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        let table = db.child_context("table1", 1);
        let t1 = txn(1);
        let n = t1.trans_num();

        ensure_sufficient_lock_held(&table.child(1), &t1, S).unwrap();
        ensure_sufficient_lock_held(&table.child(2), &t1, S).unwrap();
        ensure_sufficient_lock_held(&table, &t1, S).unwrap();
        assert_eq!(table.explicit_lock_type(n), S);
        assert_eq!(table.child(1).explicit_lock_type(n), NL);

        ensure_sufficient_lock_held(&table.child(4), &t1, X).unwrap();
        ensure_sufficient_lock_held(&table, &t1, X).unwrap();
        assert_eq!(table.explicit_lock_type(n), X);
        assert_eq!(table.child(4).explicit_lock_type(n), NL);
        assert_eq!(db.explicit_lock_type(n), IX);
        assert_eq!(db.num_child_locks(n), 1);
    }

    #[test]
    fn test_rejects_intent_requests() {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        let t1 = txn(1);
        assert!(matches!(
            ensure_sufficient_lock_held(&db, &t1, IX),
            Err(LockError::InvalidLock(_))
        ));
    }
}
