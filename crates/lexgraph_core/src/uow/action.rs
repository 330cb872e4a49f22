//! Reversible primitive mutations.
//!
//! Each `Action` carries the state needed to apply it in either direction,
//! so undo replays a task's actions backward and redo replays them forward.

use super::PropChanged;
use crate::graph::ObjectGraph;
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{ClassId, FieldId};
use crate::model::object::{DomainObject, OwnerLink};
use crate::model::value::{FieldValue, ScalarValue};
use crate::session::{SessionError, SessionResult};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create {
        handle: Handle,
        class: ClassId,
        id: ObjectId,
    },
    /// Full object state at the moment it was tombstoned.
    Delete {
        snapshot: DomainObject,
    },
    SetScalar {
        handle: Handle,
        field: FieldId,
        old: Option<ScalarValue>,
        new: Option<ScalarValue>,
    },
    SetMulti {
        handle: Handle,
        field: FieldId,
        ws: String,
        old: Option<String>,
        new: Option<String>,
    },
    SetAtomic {
        handle: Handle,
        field: FieldId,
        old: Option<Handle>,
        new: Option<Handle>,
    },
    Insert {
        handle: Handle,
        field: FieldId,
        index: usize,
        target: Handle,
    },
    Remove {
        handle: Handle,
        field: FieldId,
        index: usize,
        target: Handle,
    },
    SetOwner {
        handle: Handle,
        old: Option<OwnerLink>,
        new: Option<OwnerLink>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Observable outcome of applying one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    Created(Handle),
    Deleted(Handle),
    Changed(PropChanged),
    OwnerChanged(Handle),
}

impl Action {
    /// Object the action mutates.
    pub fn handle(&self) -> Handle {
        match self {
            Self::Create { handle, .. }
            | Self::SetScalar { handle, .. }
            | Self::SetMulti { handle, .. }
            | Self::SetAtomic { handle, .. }
            | Self::Insert { handle, .. }
            | Self::Remove { handle, .. }
            | Self::SetOwner { handle, .. } => *handle,
            Self::Delete { snapshot } => snapshot.handle,
        }
    }

    pub(crate) fn apply(
        &self,
        graph: &mut ObjectGraph,
        direction: Direction,
    ) -> SessionResult<Effect> {
        let forward = direction == Direction::Forward;
        match self {
            Self::Create { handle, class, id } => {
                if forward {
                    graph.revive(DomainObject::new(*class, *id, *handle))?;
                    Ok(Effect::Created(*handle))
                } else {
                    graph.tombstone(*handle)?;
                    Ok(Effect::Deleted(*handle))
                }
            }
            Self::Delete { snapshot } => {
                if forward {
                    graph.tombstone(snapshot.handle)?;
                    Ok(Effect::Deleted(snapshot.handle))
                } else {
                    graph.revive(snapshot.clone())?;
                    Ok(Effect::Created(snapshot.handle))
                }
            }
            Self::SetScalar {
                handle,
                field,
                old,
                new,
            } => {
                let value = if forward { new } else { old };
                graph.set_field_raw(*handle, *field, value.clone().map(FieldValue::Scalar))?;
                Ok(Effect::Changed(PropChanged::replaced(*handle, *field)))
            }
            Self::SetMulti {
                handle,
                field,
                ws,
                old,
                new,
            } => {
                let value = if forward { new } else { old };
                let mut alternatives = match graph.field(*handle, *field)? {
                    Some(FieldValue::Multi(map)) => map,
                    _ => BTreeMap::new(),
                };
                match value {
                    Some(text) => alternatives.insert(ws.clone(), text.clone()),
                    None => alternatives.remove(ws),
                };
                graph.set_field_raw(*handle, *field, Some(FieldValue::Multi(alternatives)))?;
                Ok(Effect::Changed(PropChanged::replaced(*handle, *field)))
            }
            Self::SetAtomic {
                handle,
                field,
                old,
                new,
            } => {
                let value = if forward { new } else { old };
                graph.set_field_raw(*handle, *field, value.map(FieldValue::Atomic))?;
                Ok(Effect::Changed(PropChanged::replaced(*handle, *field)))
            }
            Self::Insert {
                handle,
                field,
                index,
                target,
            } => {
                if forward {
                    insert_at(graph, *handle, *field, *index, *target)
                } else {
                    remove_at(graph, *handle, *field, *index, *target)
                }
            }
            Self::Remove {
                handle,
                field,
                index,
                target,
            } => {
                if forward {
                    remove_at(graph, *handle, *field, *index, *target)
                } else {
                    insert_at(graph, *handle, *field, *index, *target)
                }
            }
            Self::SetOwner { handle, old, new } => {
                let link = if forward { new } else { old };
                graph.set_owner_raw(*handle, *link)?;
                Ok(Effect::OwnerChanged(*handle))
            }
        }
    }
}

fn vector_of(graph: &ObjectGraph, handle: Handle, field: FieldId) -> SessionResult<Vec<Handle>> {
    Ok(match graph.field(handle, field)? {
        Some(FieldValue::Vector(handles)) => handles,
        _ => Vec::new(),
    })
}

fn insert_at(
    graph: &mut ObjectGraph,
    handle: Handle,
    field: FieldId,
    index: usize,
    target: Handle,
) -> SessionResult<Effect> {
    let mut handles = vector_of(graph, handle, field)?;
    if index > handles.len() {
        return Err(SessionError::IndexOutOfRange {
            index,
            len: handles.len(),
        });
    }
    handles.insert(index, target);
    graph.set_field_raw(handle, field, Some(FieldValue::Vector(handles)))?;
    Ok(Effect::Changed(PropChanged {
        object: handle,
        field,
        index,
        inserted: 1,
        deleted: 0,
    }))
}

fn remove_at(
    graph: &mut ObjectGraph,
    handle: Handle,
    field: FieldId,
    index: usize,
    target: Handle,
) -> SessionResult<Effect> {
    let mut handles = vector_of(graph, handle, field)?;
    if handles.get(index) != Some(&target) {
        return Err(SessionError::IndexOutOfRange {
            index,
            len: handles.len(),
        });
    }
    handles.remove(index);
    graph.set_field_raw(handle, field, Some(FieldValue::Vector(handles)))?;
    Ok(Effect::Changed(PropChanged {
        object: handle,
        field,
        index,
        inserted: 0,
        deleted: 1,
    }))
}
