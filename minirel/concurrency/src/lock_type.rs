//! The multigranularity lock lattice.
//!
//! ```text
//!          X
//!          |
//!         SIX
//!        /   \
//!       S     IX
//!        \   /
//!         IS
//!          |
//!         NL
//! ```

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
pub enum LockType {
    /// No lock held.
    NL,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    S,
    /// Shared with intention exclusive.
    SIX,
    /// Exclusive.
    X,
}

impl LockType {
    /// Returns true if a lock of this type and a lock of type `other` can be held on the
    /// same resource by two different transactions. Symmetric.
    pub fn is_compatible_with(self, other: LockType) -> bool {
        use LockType::*;
        match (self, other) {
            (NL, _) | (_, NL) => true,
            (X, _) | (_, X) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) => true,
            (S, S) => true,
            _ => false,
        }
    }

    /// The least permissive lock a transaction must hold on the parent resource in order
    /// to hold a lock of this type on a child.
    pub fn parent_lock(self) -> LockType {
        use LockType::*;
        match self {
            NL => NL,
            IS | S => IS,
            IX | SIX | X => IX,
        }
    }

    /// Returns true if holding this lock on a parent allows a `child` lock on a child
    /// resource.
    pub fn can_be_parent_of(self, child: LockType) -> bool {
        use LockType::*;
        if child == NL {
            return true;
        }
        match self {
            NL | S | X => false,
            IS => matches!(child, IS | S),
            IX => true,
            SIX => matches!(child, IX | X),
        }
    }

    /// Returns true if a lock of this type can be used wherever a lock of type `required`
    /// is needed. Reflexive; X substitutes everything and NL substitutes only NL.
    pub fn substitutes(self, required: LockType) -> bool {
        use LockType::*;
        if self == required || required == NL {
            return true;
        }
        match self {
            NL | IS => false,
            IX => required == IS,
            S => required == IS,
            SIX => matches!(required, IS | IX | S),
            X => true,
        }
    }

    /// Shared-flavoured locks: the ones released when an ancestor is promoted to SIX.
    pub fn is_shared_or_intent_shared(self) -> bool {
        matches!(self, LockType::S | LockType::IS)
    }

    /// Locks that grant (or intend) write access somewhere in the subtree.
    pub fn is_write_capable(self) -> bool {
        matches!(self, LockType::X | LockType::IX | LockType::SIX)
    }
}
