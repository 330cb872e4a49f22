//! Referential-integrity planning over the object graph.
//!
//! # Responsibility
//! - Compute deletion sets and the references that deleting them clears.
//! - Compute clone sets and remap reference targets onto copies.
//!
//! # Invariants
//! - A deletion set is complete before any reference is cleared, so
//!   references between co-deleted objects are dropped, never repaired.
//! - Clone remapping only redirects targets inside the copied set.
//!
//! Plans are computed against an immutable graph; `Session` executes them
//! through logged primitives.

use crate::graph::ObjectGraph;
use crate::model::id::Handle;
use crate::model::meta::{Cardinality, FieldId};
use crate::model::value::FieldValue;
use crate::session::SessionResult;
use std::collections::{BTreeSet, HashMap};

/// One reference slot that must drop deleted targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceClear {
    /// Reset a reference-atomic field.
    Atomic { object: Handle, field: FieldId },
    /// Remove entries at these positions, highest first.
    Entries {
        object: Handle,
        field: FieldId,
        positions: Vec<(usize, Handle)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionPlan {
    pub root: Handle,
    /// Root first, then owned descendants in preorder.
    pub members: Vec<Handle>,
    pub clears: Vec<ReferenceClear>,
}

impl DeletionPlan {
    pub fn contains(&self, handle: Handle) -> bool {
        self.members.contains(&handle)
    }
}

/// Deletion set of `root` plus every surviving reference into it.
pub fn plan_deletion(graph: &ObjectGraph, root: Handle) -> SessionResult<DeletionPlan> {
    let members = graph.owned_closure(root)?;
    let member_set: BTreeSet<Handle> = members.iter().copied().collect();

    let mut clears = Vec::new();
    for (object, field) in graph.referrers_of(&member_set, &member_set)? {
        let cardinality = graph
            .catalog()
            .field(field)
            .and_then(|descriptor| descriptor.kind.cardinality());
        match (cardinality, graph.field(object, field)?) {
            (Some(Cardinality::Atomic), _) => clears.push(ReferenceClear::Atomic { object, field }),
            (_, Some(FieldValue::Vector(targets))) => {
                let positions = targets
                    .iter()
                    .enumerate()
                    .rev()
                    .filter(|(_, target)| member_set.contains(target))
                    .map(|(index, target)| (index, *target))
                    .collect();
                clears.push(ReferenceClear::Entries {
                    object,
                    field,
                    positions,
                });
            }
            _ => {}
        }
    }

    Ok(DeletionPlan {
        root,
        members,
        clears,
    })
}

/// Originals to copy, in creation order, for a set of clone roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonePlan {
    pub roots: Vec<Handle>,
    /// Every original, parents before children.
    pub originals: Vec<Handle>,
}

pub fn plan_clone(graph: &ObjectGraph, roots: &[Handle]) -> SessionResult<ClonePlan> {
    let mut originals = Vec::new();
    let mut seen = BTreeSet::new();
    for root in roots {
        for handle in graph.owned_closure(*root)? {
            if seen.insert(handle) {
                originals.push(handle);
            }
        }
    }
    Ok(ClonePlan {
        roots: roots.to_vec(),
        originals,
    })
}

/// Original-to-copy mapping built while a clone executes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneMap {
    copies: HashMap<Handle, Handle>,
}

impl CloneMap {
    pub fn insert(&mut self, original: Handle, copy: Handle) {
        self.copies.insert(original, copy);
    }

    pub fn copy_of(&self, original: Handle) -> Option<Handle> {
        self.copies.get(&original).copied()
    }

    /// Copy when the target was cloned, otherwise the original target.
    pub fn remap(&self, target: Handle) -> Handle {
        self.copy_of(target).unwrap_or(target)
    }
}

#[cfg(test)]
mod tests {
    use super::CloneMap;
    use crate::model::id::Handle;

    #[test]
    fn remap_keeps_targets_outside_the_copied_set() {
        let mut map = CloneMap::default();
        map.insert(Handle(1), Handle(10));
        assert_eq!(map.remap(Handle(1)), Handle(10));
        assert_eq!(map.remap(Handle(2)), Handle(2));
    }
}
