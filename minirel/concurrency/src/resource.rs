use std::fmt;
use std::hash::{Hash, Hasher};

use smol_str::SmolStr;

/// Hierarchical name of a lockable resource, e.g. `database/table1/5`.
///
/// Each level carries a readable label and a numeric id. Identity is determined by the
/// ids alone; labels only affect display.
#[derive(Debug, Clone)]
pub struct ResourceName {
    root: (SmolStr, u64),
    path: Vec<(SmolStr, u64)>,
}

impl ResourceName {
    /// Name of a top-level resource.
    pub fn new(label: impl Into<SmolStr>, id: u64) -> Self {
        Self {
            root: (label.into(), id),
            path: Vec::new(),
        }
    }

    /// Name of the child `id` of this resource.
    pub fn child(&self, label: impl Into<SmolStr>, id: u64) -> Self {
        let mut path = self.path.clone();
        path.push((label.into(), id));
        Self {
            root: self.root.clone(),
            path,
        }
    }

    pub fn parent(&self) -> Option<ResourceName> {
        let (_, ancestors) = self.path.split_last()?;
        Some(Self {
            root: self.root.clone(),
            path: ancestors.to_vec(),
        })
    }

    /// Readable label and id of the top level.
    pub fn root(&self) -> (&str, u64) {
        (self.root.0.as_str(), self.root.1)
    }

    /// Readable label and id of the last level.
    pub fn current(&self) -> (&str, u64) {
        let (label, id) = self.path.last().unwrap_or(&self.root);
        (label.as_str(), *id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.levels().map(|(_, id)| id)
    }

    pub fn levels(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        std::iter::once(&self.root)
            .chain(&self.path)
            .map(|(label, id)| (label.as_str(), *id))
    }

    pub fn depth(&self) -> usize {
        self.path.len() + 1
    }

    /// Returns true if `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &ResourceName) -> bool {
        self.depth() > other.depth() && self.ids().zip(other.ids()).all(|(a, b)| a == b)
    }
}

impl PartialEq for ResourceName {
    fn eq(&self, other: &Self) -> bool {
        self.depth() == other.depth() && self.ids().eq(other.ids())
    }
}

impl Eq for ResourceName {}

impl Hash for ResourceName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth().hash(state);
        for id in self.ids() {
            id.hash(state);
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (label, _)) in self.levels().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(label)?;
        }
        Ok(())
    }
}
