//! Hierarchical lock contexts.
//!
//! Every lockable resource has a [`LockContext`] whose parent is the context of the
//! enclosing resource. Contexts enforce the multigranularity rules on top of the flat
//! [`LockManager`]: a transaction must hold a suitable intent lock on the parent before
//! locking a child, and must release children before their parent.
//!
//! Contexts are nodes in an arena owned by the lock manager. A [`LockContext`] is a cheap
//! handle (manager + node index); children are created the first time they are asked for
//! and live as long as the manager.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use minirel_transaction::{TransNum, TransactionContext};
use smol_str::SmolStr;

use crate::error::{LockError, LockResult};
use crate::lock_type::LockType;
use crate::manager::LockManager;
use crate::resource::ResourceName;

/// Stable index of a context node in the arena.
pub type ContextId = usize;

#[derive(Debug)]
struct ContextNode {
    name: ResourceName,
    parent: Option<ContextId>,
    /// Children in creation order.
    children: Vec<ContextId>,
    child_index: HashMap<u64, ContextId>,
    readonly: bool,
    child_locks_disabled: bool,
    capacity: Option<usize>,
    /// Number of locks each transaction holds on descendants of this node.
    num_child_locks: HashMap<TransNum, usize>,
}

impl ContextNode {
    fn new(name: ResourceName, parent: Option<ContextId>, readonly: bool) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
            readonly,
            child_locks_disabled: false,
            capacity: None,
            num_child_locks: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ContextArena {
    nodes: Vec<ContextNode>,
    roots: HashMap<u64, ContextId>,
}

impl ContextArena {
    /// Get or insert the top-level context for resource `id`.
    pub(crate) fn root(&mut self, label: &str, id: u64) -> ContextId {
        if let Some(&root) = self.roots.get(&id) {
            return root;
        }
        let root = self.nodes.len();
        self.nodes
            .push(ContextNode::new(ResourceName::new(label, id), None, false));
        self.roots.insert(id, root);
        root
    }

    /// Get or insert the child `id` of `parent`. A new child is read-only if its parent
    /// is read-only or has child locks disabled.
    fn child(&mut self, parent: ContextId, label: &str, id: u64) -> ContextId {
        if let Some(&child) = self.nodes[parent].child_index.get(&id) {
            return child;
        }
        let node = &self.nodes[parent];
        let name = node.name.child(label, id);
        let readonly = node.readonly || node.child_locks_disabled;
        let child = self.nodes.len();
        self.nodes
            .push(ContextNode::new(name, Some(parent), readonly));
        let node = &mut self.nodes[parent];
        node.children.push(child);
        node.child_index.insert(id, child);
        child
    }

    /// Ancestors of `id`, nearest first.
    fn ancestors(&self, id: ContextId) -> Vec<ContextId> {
        let mut ancestors = Vec::new();
        let mut current = self.nodes[id].parent;
        while let Some(parent) = current {
            ancestors.push(parent);
            current = self.nodes[parent].parent;
        }
        ancestors
    }

    /// Descendants of `id` in depth-first pre-order, excluding `id` itself.
    fn descendants(&self, id: ContextId) -> Vec<ContextId> {
        let mut descendants = Vec::new();
        let mut stack: Vec<ContextId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            descendants.push(node);
            stack.extend(self.nodes[node].children.iter().rev().copied());
        }
        descendants
    }

    fn add_child_locks(&mut self, nodes: &[ContextId], trans_num: TransNum, delta: isize) {
        for &node in nodes {
            let count = self.nodes[node]
                .num_child_locks
                .entry(trans_num)
                .or_default();
            *count = count.saturating_add_signed(delta);
            if *count == 0 {
                self.nodes[node].num_child_locks.remove(&trans_num);
            }
        }
    }
}

/// Handle to the lock context of one resource.
#[derive(Clone)]
pub struct LockContext {
    manager: Arc<LockManager>,
    id: ContextId,
}

impl LockContext {
    pub(crate) fn new(manager: Arc<LockManager>, id: ContextId) -> Self {
        Self { manager, id }
    }

    /// Context of the resource `name`, creating every missing level along the way.
    pub fn from_resource_name(manager: &Arc<LockManager>, name: &ResourceName) -> Self {
        let mut arena = manager.contexts.lock();
        let (label, root_id) = name.root();
        let mut id = arena.root(label, root_id);
        for (label, child_id) in name.levels().skip(1) {
            id = arena.child(id, label, child_id);
        }
        Self::new(manager.clone(), id)
    }

    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    pub fn resource_name(&self) -> ResourceName {
        self.manager.contexts.lock().nodes[self.id].name.clone()
    }

    pub fn is_readonly(&self) -> bool {
        self.manager.contexts.lock().nodes[self.id].readonly
    }

    pub fn parent_context(&self) -> Option<LockContext> {
        let parent = self.manager.contexts.lock().nodes[self.id].parent?;
        Some(Self::new(self.manager.clone(), parent))
    }

    /// Context of the child resource `id`, created on first use.
    pub fn child_context(&self, label: impl Into<SmolStr>, id: u64) -> LockContext {
        let label = label.into();
        let child = self.manager.contexts.lock().child(self.id, &label, id);
        Self::new(self.manager.clone(), child)
    }

    /// Same as [`Self::child_context`], labelled by the id itself.
    pub fn child(&self, id: u64) -> LockContext {
        self.child_context(id.to_string(), id)
    }

    /// Make every child created from now on read-only.
    pub fn disable_child_locks(&self) {
        self.manager.contexts.lock().nodes[self.id].child_locks_disabled = true;
    }

    /// Override the number of children used to compute saturation.
    pub fn set_capacity(&self, capacity: usize) {
        self.manager.contexts.lock().nodes[self.id].capacity = Some(capacity);
    }

    /// Number of children of this context; the materialized children unless overridden.
    pub fn capacity(&self) -> usize {
        let arena = self.manager.contexts.lock();
        let node = &arena.nodes[self.id];
        node.capacity.unwrap_or(node.children.len())
    }

    /// Number of locks `trans_num` holds on descendants of this context.
    pub fn num_child_locks(&self, trans_num: TransNum) -> usize {
        self.manager.contexts.lock().nodes[self.id]
            .num_child_locks
            .get(&trans_num)
            .copied()
            .unwrap_or(0)
    }

    /// Fraction of this context's capacity locked by `trans_num` at finer granularity.
    pub fn saturation(&self, trans_num: TransNum) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.num_child_locks(trans_num) as f64 / capacity as f64
    }

    /// The lock `trans_num` holds on this resource itself.
    pub fn explicit_lock_type(&self, trans_num: TransNum) -> LockType {
        self.manager.lock_type(trans_num, &self.resource_name())
    }

    /// The lock `trans_num` effectively holds on this resource, taking locks on
    /// ancestors into account.
    ///
    /// An X ancestor grants X; an S or SIX ancestor grants S. SIX is never reported: it
    /// only gives shared access to this resource, so it reads as S.
    pub fn effective_lock_type(&self, trans_num: TransNum) -> LockType {
        use LockType::*;
        let explicit = self.explicit_lock_type(trans_num);
        let inherited = self
            .ancestor_lock_types(trans_num)
            .into_iter()
            .fold(NL, |inherited, held| match held {
                X => X,
                S | SIX if inherited != X => S,
                _ => inherited,
            });
        match (inherited, explicit) {
            (X, _) | (_, X) => X,
            (S, _) | (_, SIX) => S,
            (_, explicit) => explicit,
        }
    }

    /// Acquire a `lock_type` lock on this resource.
    ///
    /// The transaction's lock on the parent must allow `lock_type` below it, and S or IS
    /// cannot be taken underneath a SIX ancestor. Blocks until the lock is granted.
    pub fn acquire(
        &self,
        transaction: &Arc<TransactionContext>,
        lock_type: LockType,
    ) -> LockResult<()> {
        let trans_num = transaction.trans_num();
        let (name, ancestors) = self.check_writable()?;
        if let Some(parent) = self.parent_context() {
            let parent_type = parent.explicit_lock_type(trans_num);
            if !parent_type.can_be_parent_of(lock_type) {
                return Err(LockError::InvalidLock(format!(
                    "{trans_num} holds {parent_type} on the parent of {name}, which does not \
                     allow {lock_type}"
                )));
            }
        }
        if lock_type.is_shared_or_intent_shared() && self.has_six_ancestor(trans_num) {
            return Err(LockError::InvalidLock(format!(
                "{trans_num} holds SIX on an ancestor of {name}; {lock_type} is redundant"
            )));
        }

        self.manager.acquire(transaction, &name, lock_type)?;
        self.manager
            .contexts
            .lock()
            .add_child_locks(&ancestors, trans_num, 1);
        Ok(())
    }

    /// Release the transaction's lock on this resource. Locks on children must be
    /// released first.
    pub fn release(&self, transaction: &Arc<TransactionContext>) -> LockResult<()> {
        let trans_num = transaction.trans_num();
        let (name, ancestors) = self.check_writable()?;
        if self.manager.lock_type(trans_num, &name) == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "{trans_num} holds no lock on {name}"
            )));
        }
        if let Some(child) = self
            .children()
            .into_iter()
            .find(|child| self.manager.lock_type(trans_num, child) != LockType::NL)
        {
            return Err(LockError::InvalidLock(format!(
                "{trans_num} cannot release {name} while holding a lock on {child}"
            )));
        }

        self.manager.release(transaction, &name)?;
        self.manager
            .contexts
            .lock()
            .add_child_locks(&ancestors, trans_num, -1);
        Ok(())
    }

    /// Promote the transaction's lock on this resource to `new_lock_type`.
    ///
    /// Promoting to SIX also releases every S and IS lock the transaction holds on
    /// descendants, in the same atomic step. Blocks until the promotion is granted.
    pub fn promote(
        &self,
        transaction: &Arc<TransactionContext>,
        new_lock_type: LockType,
    ) -> LockResult<()> {
        use LockType::*;
        let trans_num = transaction.trans_num();
        let (name, _) = self.check_writable()?;
        let held = self.manager.lock_type(trans_num, &name);
        if held == new_lock_type {
            return Err(LockError::DuplicateLock(format!(
                "{trans_num} already holds {held}({name})"
            )));
        }
        if held == NL {
            return Err(LockError::NoLockHeld(format!(
                "{trans_num} holds no lock on {name}"
            )));
        }
        if let Some(parent) = self.parent_context() {
            let parent_type = parent.explicit_lock_type(trans_num);
            if !parent_type.can_be_parent_of(new_lock_type) {
                return Err(LockError::InvalidLock(format!(
                    "{trans_num} holds {parent_type} on the parent of {name}, which does not \
                     allow {new_lock_type}"
                )));
            }
        }
        if new_lock_type != SIX {
            return self.manager.promote(transaction, &name, new_lock_type);
        }

        if self.has_six_ancestor(trans_num) {
            return Err(LockError::InvalidLock(format!(
                "{trans_num} holds SIX on an ancestor of {name}"
            )));
        }
        if !matches!(held, S | IS | IX) {
            return Err(LockError::InvalidLock(format!(
                "{trans_num} cannot promote {held}({name}) to SIX"
            )));
        }

        let released: Vec<(ContextId, ResourceName)> = self
            .descendant_locks(trans_num)
            .into_iter()
            .filter(|(_, _, lock_type)| lock_type.is_shared_or_intent_shared())
            .map(|(id, name, _)| (id, name))
            .collect();
        let mut release_names: Vec<ResourceName> =
            released.iter().map(|(_, name)| name.clone()).collect();
        release_names.push(name.clone());

        self.manager
            .acquire_and_release(transaction, &name, SIX, &release_names)?;

        let mut arena = self.manager.contexts.lock();
        for (id, _) in released {
            let ancestors = arena.ancestors(id);
            arena.add_child_locks(&ancestors, trans_num, -1);
        }
        Ok(())
    }

    /// Replace the transaction's locks on this resource and all its descendants with a
    /// single S or X lock on this resource.
    ///
    /// The result is X if any of the replaced locks is X, IX or SIX, and S otherwise.
    /// Does nothing if the transaction already holds that lock here.
    pub fn escalate(&self, transaction: &Arc<TransactionContext>) -> LockResult<()> {
        use LockType::*;
        let trans_num = transaction.trans_num();
        let (name, ancestors) = self.check_writable()?;
        let held = self.manager.lock_type(trans_num, &name);
        if held == NL {
            return Err(LockError::NoLockHeld(format!(
                "{trans_num} holds no lock on {name}"
            )));
        }

        let descendants = self.descendant_locks(trans_num);
        let escalated = if held.is_write_capable()
            || descendants
                .iter()
                .any(|(_, _, lock_type)| lock_type.is_write_capable())
        {
            X
        } else {
            S
        };
        if escalated == held {
            return Ok(());
        }

        let mut release_names = vec![name.clone()];
        release_names.extend(descendants.iter().map(|(_, name, _)| name.clone()));
        self.manager
            .acquire_and_release(transaction, &name, escalated, &release_names)?;

        let mut arena = self.manager.contexts.lock();
        let mut subtree = arena.descendants(self.id);
        subtree.push(self.id);
        for id in subtree {
            arena.nodes[id].num_child_locks.remove(&trans_num);
        }
        arena.add_child_locks(&ancestors, trans_num, -(descendants.len() as isize));
        Ok(())
    }

    /// Name and ancestors of this context, or an error if it is read-only.
    fn check_writable(&self) -> LockResult<(ResourceName, Vec<ContextId>)> {
        let arena = self.manager.contexts.lock();
        let node = &arena.nodes[self.id];
        if node.readonly {
            return Err(LockError::ReadOnly(format!(
                "locks on {} are disabled",
                node.name
            )));
        }
        Ok((node.name.clone(), arena.ancestors(self.id)))
    }

    fn children(&self) -> Vec<ResourceName> {
        let arena = self.manager.contexts.lock();
        arena.nodes[self.id]
            .children
            .iter()
            .map(|&child| arena.nodes[child].name.clone())
            .collect()
    }

    /// Locks held by `trans_num` on ancestors, nearest first.
    fn ancestor_lock_types(&self, trans_num: TransNum) -> Vec<LockType> {
        let names: Vec<ResourceName> = {
            let arena = self.manager.contexts.lock();
            arena
                .ancestors(self.id)
                .into_iter()
                .map(|id| arena.nodes[id].name.clone())
                .collect()
        };
        names
            .iter()
            .map(|name| self.manager.lock_type(trans_num, name))
            .collect()
    }

    fn has_six_ancestor(&self, trans_num: TransNum) -> bool {
        self.ancestor_lock_types(trans_num).contains(&LockType::SIX)
    }

    /// Locks held by `trans_num` on materialized descendants, depth-first.
    fn descendant_locks(&self, trans_num: TransNum) -> Vec<(ContextId, ResourceName, LockType)> {
        let descendants: Vec<(ContextId, ResourceName)> = {
            let arena = self.manager.contexts.lock();
            arena
                .descendants(self.id)
                .into_iter()
                .map(|id| (id, arena.nodes[id].name.clone()))
                .collect()
        };
        descendants
            .into_iter()
            .filter_map(|(id, name)| {
                let lock_type = self.manager.lock_type(trans_num, &name);
                (lock_type != LockType::NL).then_some((id, name, lock_type))
            })
            .collect()
    }
}

impl fmt::Debug for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("id", &self.id)
            .field("name", &self.resource_name().to_string())
            .finish()
    }
}
