//! Flat lock bookkeeping.
//!
//! [`LockManager`] maps resources to their granted locks and wait queues, and
//! transactions to the locks they hold. It treats every resource as independent:
//! intent-lock rules across the hierarchy are enforced one level up, by
//! [`LockContext`](crate::context::LockContext).
//!
//! Every queue is processed whenever a lock on its resource is released: requests are
//! granted from the front for as long as they are compatible with the remaining grants,
//! stopping at the first one that is not. With the queue `S(A) X(A) S(A)` only the first
//! request is granted, even if the third would also fit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use minirel_transaction::{TransNum, TransactionContext};
use parking_lot::Mutex;
use tracing::debug;

use crate::context::{ContextArena, LockContext};
use crate::error::{LockError, LockResult};
use crate::lock::{Lock, LockRequest};
use crate::lock_type::LockType;
use crate::resource::ResourceName;

/// Id of the database resource, the root of the default hierarchy.
pub const DATABASE_RESOURCE_ID: u64 = 0;

/// Granted locks and pending requests on one resource.
#[derive(Debug, Default)]
struct ResourceEntry {
    /// Granted locks, in acquisition order.
    locks: Vec<Lock>,
    waiting_queue: VecDeque<LockRequest>,
}

impl ResourceEntry {
    /// Check whether a `lock_type` lock fits next to the granted locks, ignoring the ones
    /// held by `except`.
    fn check_compatible(&self, lock_type: LockType, except: TransNum) -> bool {
        self.locks
            .iter()
            .filter(|lock| lock.trans_num != except)
            .all(|lock| lock_type.is_compatible_with(lock.lock_type))
    }

    fn transaction_lock_type(&self, trans_num: TransNum) -> LockType {
        self.locks
            .iter()
            .find(|lock| lock.trans_num == trans_num)
            .map(|lock| lock.lock_type)
            .unwrap_or(LockType::NL)
    }
}

#[derive(Debug, Default)]
struct LockTable {
    resource_entries: HashMap<ResourceName, ResourceEntry>,
    /// Locks held by each transaction, in acquisition order.
    transaction_locks: HashMap<TransNum, Vec<Lock>>,
}

impl LockTable {
    fn lock_type(&self, trans_num: TransNum, name: &ResourceName) -> LockType {
        self.resource_entries
            .get(name)
            .map(|entry| entry.transaction_lock_type(trans_num))
            .unwrap_or(LockType::NL)
    }

    fn check_compatible(&self, name: &ResourceName, lock_type: LockType, except: TransNum) -> bool {
        self.resource_entries
            .get(name)
            .is_none_or(|entry| entry.check_compatible(lock_type, except))
    }

    fn queue_is_empty(&self, name: &ResourceName) -> bool {
        self.resource_entries
            .get(name)
            .is_none_or(|entry| entry.waiting_queue.is_empty())
    }

    fn enqueue(&mut self, request: LockRequest, front: bool) {
        let entry = self
            .resource_entries
            .entry(request.lock.name.clone())
            .or_default();
        debug!(lock = %request.lock, front, "lock request queued");
        request.transaction.prepare_block();
        if front {
            entry.waiting_queue.push_front(request);
        } else {
            entry.waiting_queue.push_back(request);
        }
    }

    /// Give `lock` to its transaction. If the transaction already holds a lock on the
    /// resource, the lock type is replaced in place so acquisition order is unchanged.
    fn grant_or_update(&mut self, lock: Lock) {
        debug!(%lock, "lock granted");
        let entry = self.resource_entries.entry(lock.name.clone()).or_default();
        let held = self.transaction_locks.entry(lock.trans_num).or_default();
        match entry
            .locks
            .iter_mut()
            .find(|granted| granted.trans_num == lock.trans_num)
        {
            Some(granted) => {
                granted.lock_type = lock.lock_type;
                if let Some(owned) = held.iter_mut().find(|owned| owned.name == lock.name) {
                    owned.lock_type = lock.lock_type;
                }
            }
            None => {
                entry.locks.push(lock.clone());
                held.push(lock);
            }
        }
    }

    /// Drop the transaction's lock on `name`, then process the resource's queue.
    fn release_lock(&mut self, trans_num: TransNum, name: &ResourceName) {
        if let Some(entry) = self.resource_entries.get_mut(name) {
            entry.locks.retain(|lock| lock.trans_num != trans_num);
        }
        if let Some(held) = self.transaction_locks.get_mut(&trans_num) {
            held.retain(|lock| &lock.name != name);
            if held.is_empty() {
                self.transaction_locks.remove(&trans_num);
            }
        }
        debug!(%trans_num, resource = %name, "lock released");
        self.process_queue(name);
    }

    /// Grant requests from the front of the queue until one does not fit. Locks bundled
    /// with a granted request are released right after it, which processes their queues
    /// in turn.
    fn process_queue(&mut self, name: &ResourceName) {
        loop {
            let Some(entry) = self.resource_entries.get_mut(name) else {
                return;
            };
            let grantable = entry.waiting_queue.front().is_some_and(|request| {
                entry.check_compatible(request.lock.lock_type, request.lock.trans_num)
            });
            if !grantable {
                break;
            }
            let Some(request) = entry.waiting_queue.pop_front() else {
                break;
            };

            let trans_num = request.lock.trans_num;
            let granted_name = request.lock.name.clone();
            self.grant_or_update(request.lock);
            for released in &request.released {
                if *released != granted_name {
                    self.release_lock(trans_num, released);
                }
            }
            request.transaction.unblock();
        }
        self.drop_if_unused(name);
    }

    fn drop_if_unused(&mut self, name: &ResourceName) {
        if self
            .resource_entries
            .get(name)
            .is_some_and(|entry| entry.locks.is_empty() && entry.waiting_queue.is_empty())
        {
            self.resource_entries.remove(name);
        }
    }
}

/// Lock manager for a single database instance.
///
/// All bookkeeping lives behind one mutex. A transaction whose request cannot be granted
/// is parked on its [`TransactionContext`] after the mutex is released, and woken by the
/// release that grants it.
///
/// The manager does not detect deadlocks; [`LockManager::wait_for_edges`] exposes the
/// current wait-for graph for an external policy to inspect.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    pub(crate) contexts: Mutex<ContextArena>,
    mutations: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a `lock_type` lock on `name` for `transaction`.
    ///
    /// The lock is granted immediately if it is compatible with every other transaction's
    /// lock and nobody is queued; otherwise the request goes to the back of the queue and
    /// the caller blocks until it is granted.
    pub fn acquire(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
        lock_type: LockType,
    ) -> LockResult<()> {
        let trans_num = transaction.trans_num();
        let should_block = {
            let mut table = self.table.lock();
            if lock_type == LockType::NL {
                return Err(LockError::InvalidLock(format!(
                    "{trans_num} cannot acquire an NL lock on {name}"
                )));
            }
            let held = table.lock_type(trans_num, name);
            if held != LockType::NL {
                return Err(LockError::DuplicateLock(format!(
                    "{trans_num} already holds {held}({name})"
                )));
            }
            self.mutations.fetch_add(1, Ordering::Relaxed);

            let lock = Lock::new(name.clone(), lock_type, trans_num);
            if table.queue_is_empty(name) && table.check_compatible(name, lock_type, trans_num) {
                table.grant_or_update(lock);
                false
            } else {
                table.enqueue(LockRequest::new(transaction.clone(), lock), false);
                true
            }
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Acquire a `lock_type` lock on `name` and, once it is granted, release the
    /// transaction's locks on every resource in `release_names`, as one atomic step.
    ///
    /// If `name` is itself in `release_names`, the existing lock on it is replaced in
    /// place and keeps its acquisition order. Conflicting requests go to the front of
    /// the queue.
    pub fn acquire_and_release(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
        lock_type: LockType,
        release_names: &[ResourceName],
    ) -> LockResult<()> {
        let trans_num = transaction.trans_num();
        let should_block = {
            let mut table = self.table.lock();
            if lock_type == LockType::NL {
                return Err(LockError::InvalidLock(format!(
                    "{trans_num} cannot acquire an NL lock on {name}"
                )));
            }
            let held = table.lock_type(trans_num, name);
            if held == lock_type && !release_names.contains(name) {
                return Err(LockError::DuplicateLock(format!(
                    "{trans_num} already holds {held}({name})"
                )));
            }
            if let Some(missing) = release_names
                .iter()
                .find(|release| table.lock_type(trans_num, release) == LockType::NL)
            {
                return Err(LockError::NoLockHeld(format!(
                    "{trans_num} holds no lock on {missing}"
                )));
            }
            self.mutations.fetch_add(1, Ordering::Relaxed);

            let lock = Lock::new(name.clone(), lock_type, trans_num);
            if table.check_compatible(name, lock_type, trans_num) {
                table.grant_or_update(lock);
                for release in release_names.iter().filter(|release| *release != name) {
                    table.release_lock(trans_num, release);
                }
                false
            } else {
                let request =
                    LockRequest::with_released(transaction.clone(), lock, release_names.to_vec());
                table.enqueue(request, true);
                true
            }
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Release `transaction`'s lock on `name` and process the resource's queue.
    pub fn release(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
    ) -> LockResult<()> {
        let trans_num = transaction.trans_num();
        let mut table = self.table.lock();
        if table.lock_type(trans_num, name) == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "{trans_num} holds no lock on {name}"
            )));
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        table.release_lock(trans_num, name);
        Ok(())
    }

    /// Promote `transaction`'s lock on `name` to `new_lock_type`, which must strictly
    /// substitute the held type.
    ///
    /// The promoted lock keeps its acquisition order. A conflicting promotion goes to the
    /// front of the queue.
    pub fn promote(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
        new_lock_type: LockType,
    ) -> LockResult<()> {
        let trans_num = transaction.trans_num();
        let should_block = {
            let mut table = self.table.lock();
            let held = table.lock_type(trans_num, name);
            if held == new_lock_type {
                return Err(LockError::DuplicateLock(format!(
                    "{trans_num} already holds {held}({name})"
                )));
            }
            if held == LockType::NL {
                return Err(LockError::NoLockHeld(format!(
                    "{trans_num} holds no lock on {name}"
                )));
            }
            if !new_lock_type.substitutes(held) {
                return Err(LockError::InvalidLock(format!(
                    "{trans_num} cannot promote {held}({name}) to {new_lock_type}"
                )));
            }
            self.mutations.fetch_add(1, Ordering::Relaxed);

            let lock = Lock::new(name.clone(), new_lock_type, trans_num);
            if table.check_compatible(name, new_lock_type, trans_num) {
                table.grant_or_update(lock);
                false
            } else {
                table.enqueue(LockRequest::new(transaction.clone(), lock), true);
                true
            }
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Release every lock held by `transaction`, most recently acquired first.
    pub fn release_all(&self, transaction: &Arc<TransactionContext>) {
        let trans_num = transaction.trans_num();
        let mut table = self.table.lock();
        let held: Vec<ResourceName> = table
            .transaction_locks
            .get(&trans_num)
            .map(|locks| locks.iter().rev().map(|lock| lock.name.clone()).collect())
            .unwrap_or_default();
        if held.is_empty() {
            return;
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        for name in held {
            table.release_lock(trans_num, &name);
        }
    }

    /// The type of lock `trans_num` holds on `name`, or NL.
    pub fn lock_type(&self, trans_num: TransNum, name: &ResourceName) -> LockType {
        self.table.lock().lock_type(trans_num, name)
    }

    /// Locks granted on `name`, in acquisition order.
    pub fn resource_locks(&self, name: &ResourceName) -> Vec<Lock> {
        self.table
            .lock()
            .resource_entries
            .get(name)
            .map(|entry| entry.locks.clone())
            .unwrap_or_default()
    }

    /// Locks held by `trans_num`, in acquisition order.
    pub fn transaction_locks(&self, trans_num: TransNum) -> Vec<Lock> {
        self.table
            .lock()
            .transaction_locks
            .get(&trans_num)
            .cloned()
            .unwrap_or_default()
    }

    /// Requests waiting on `name`, front first.
    pub fn queued_requests(&self, name: &ResourceName) -> Vec<Lock> {
        self.table
            .lock()
            .resource_entries
            .get(name)
            .map(|entry| {
                entry
                    .waiting_queue
                    .iter()
                    .map(|request| request.lock.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current wait-for graph as `(waiter, holder)` pairs: a queued request waits for
    /// every other transaction holding an incompatible lock on the same resource.
    pub fn wait_for_edges(&self) -> Vec<(TransNum, TransNum)> {
        let table = self.table.lock();
        let mut edges = Vec::new();
        for entry in table.resource_entries.values() {
            for request in &entry.waiting_queue {
                let waiter = request.lock.trans_num;
                for lock in &entry.locks {
                    if lock.trans_num != waiter
                        && !request.lock.lock_type.is_compatible_with(lock.lock_type)
                    {
                        edges.push((waiter, lock.trans_num));
                    }
                }
            }
        }
        edges.sort();
        edges.dedup();
        edges
    }

    /// Number of accepted mutating requests (acquire, release, promote,
    /// acquire-and-release) so far. Rejected requests are not counted.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Lock context of the top-level resource `id`, created on first use.
    pub fn context(self: &Arc<Self>, label: &str, id: u64) -> LockContext {
        let context_id = self.contexts.lock().root(label, id);
        LockContext::new(self.clone(), context_id)
    }

    /// Lock context of the whole database.
    pub fn database_context(self: &Arc<Self>) -> LockContext {
        self.context("database", DATABASE_RESOURCE_ID)
    }
}
