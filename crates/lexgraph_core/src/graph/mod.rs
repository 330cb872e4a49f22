//! Session-scoped object arena and identity map.
//!
//! # Responsibility
//! - Map every registered `ObjectId` to exactly one `Handle` slot.
//! - Hold objects as unloaded surrogates, live objects or tombstones.
//! - Provide raw, unlogged read and write primitives for higher layers.
//!
//! # Invariants
//! - Slots are never reused; a tombstoned handle keeps its identity.
//! - Reads of a surrogate decode it on the fly; writes materialize it first.
//! - Raw writes here never touch the action log or listeners.

use crate::backend::BackendRecord;
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{CatalogError, ClassId, FieldId, MetaCatalog};
use crate::model::object::{DomainObject, OwnerLink};
use crate::model::value::FieldValue;
use crate::serial::record::{decode_record, encode_record, DecodedRecord};
use crate::serial::write_element;
use crate::session::{SessionError, SessionResult};
use log::warn;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
enum Slot {
    Unloaded(BackendRecord),
    Live(DomainObject),
    Deleted { class: ClassId, id: ObjectId },
}

#[derive(Debug, Clone)]
pub struct ObjectGraph {
    catalog: MetaCatalog,
    slots: Vec<Slot>,
    by_id: HashMap<ObjectId, Handle>,
}

impl ObjectGraph {
    pub fn new(catalog: MetaCatalog) -> Self {
        Self {
            catalog,
            slots: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &MetaCatalog {
        &self.catalog
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut MetaCatalog {
        &mut self.catalog
    }

    /// Handle registered for `id`, whatever state its slot is in.
    pub fn handle_of(&self, id: ObjectId) -> Option<Handle> {
        self.by_id.get(&id).copied()
    }

    pub fn id_of(&self, handle: Handle) -> Option<ObjectId> {
        match self.slots.get(handle.index())? {
            Slot::Unloaded(record) => Some(record.id),
            Slot::Live(object) => Some(object.id),
            Slot::Deleted { id, .. } => Some(*id),
        }
    }

    /// True for surrogates and live objects.
    pub fn exists(&self, handle: Handle) -> bool {
        matches!(
            self.slots.get(handle.index()),
            Some(Slot::Unloaded(_) | Slot::Live(_))
        )
    }

    pub fn is_materialized(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.index()), Some(Slot::Live(_)))
    }

    /// Number of existing (non-deleted) objects.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Deleted { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Existing handles in registration order.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !matches!(slot, Slot::Deleted { .. }))
            .map(|(index, _)| Handle(index as u32))
    }

    pub fn class_of(&self, handle: Handle) -> SessionResult<ClassId> {
        match self.slot(handle)? {
            Slot::Live(object) => Ok(object.class),
            Slot::Deleted { class, .. } => Ok(*class),
            Slot::Unloaded(record) => self
                .catalog
                .class_id(&record.class)
                .ok_or_else(|| CatalogError::UnknownClass(record.class.clone()).into()),
        }
    }

    /// Registers a surrogate; an already-registered id keeps its handle.
    pub(crate) fn register_record(&mut self, record: BackendRecord) -> Handle {
        if let Some(handle) = self.by_id.get(&record.id) {
            return *handle;
        }
        let handle = Handle(self.slots.len() as u32);
        self.by_id.insert(record.id, handle);
        self.slots.push(Slot::Unloaded(record));
        handle
    }

    /// Allocates a slot for a brand-new object.
    pub(crate) fn insert_new(&mut self, class: ClassId, id: ObjectId) -> Handle {
        let handle = Handle(self.slots.len() as u32);
        self.by_id.insert(id, handle);
        self.slots
            .push(Slot::Live(DomainObject::new(class, id, handle)));
        handle
    }

    fn slot(&self, handle: Handle) -> SessionResult<&Slot> {
        self.slots
            .get(handle.index())
            .ok_or(SessionError::UnknownHandle(handle))
    }

    /// Reads an object, decoding a surrogate without materializing it.
    pub fn object(&self, handle: Handle) -> SessionResult<Cow<'_, DomainObject>> {
        match self.slot(handle)? {
            Slot::Live(object) => Ok(Cow::Borrowed(object)),
            Slot::Unloaded(record) => Ok(Cow::Owned(self.decode(handle, record)?)),
            Slot::Deleted { id, .. } => Err(SessionError::ObjectDeleted(*id)),
        }
    }

    pub fn field(&self, handle: Handle, field: FieldId) -> SessionResult<Option<FieldValue>> {
        Ok(self.object(handle)?.field(field).cloned())
    }

    pub(crate) fn materialize(&mut self, handle: Handle) -> SessionResult<()> {
        let object = match self.slot(handle)? {
            Slot::Unloaded(record) => self.decode(handle, record)?,
            Slot::Live(_) => return Ok(()),
            Slot::Deleted { id, .. } => return Err(SessionError::ObjectDeleted(*id)),
        };
        self.slots[handle.index()] = Slot::Live(object);
        Ok(())
    }

    pub(crate) fn object_mut(&mut self, handle: Handle) -> SessionResult<&mut DomainObject> {
        self.materialize(handle)?;
        match &mut self.slots[handle.index()] {
            Slot::Live(object) => Ok(object),
            _ => Err(SessionError::UnknownHandle(handle)),
        }
    }

    /// Replaces a field value; `None` resets it to the default.
    pub(crate) fn set_field_raw(
        &mut self,
        handle: Handle,
        field: FieldId,
        value: Option<FieldValue>,
    ) -> SessionResult<Option<FieldValue>> {
        let object = self.object_mut(handle)?;
        let value = value.filter(|value| !value.is_empty());
        Ok(match value {
            Some(value) => object.fields.insert(field, value),
            None => object.fields.remove(&field),
        })
    }

    pub(crate) fn set_owner_raw(
        &mut self,
        handle: Handle,
        owner: Option<OwnerLink>,
    ) -> SessionResult<Option<OwnerLink>> {
        let object = self.object_mut(handle)?;
        Ok(std::mem::replace(&mut object.owner, owner))
    }

    /// Tombstones a slot and returns the object as it was.
    pub(crate) fn tombstone(&mut self, handle: Handle) -> SessionResult<DomainObject> {
        self.materialize(handle)?;
        let (class, id) = match &self.slots[handle.index()] {
            Slot::Live(object) => (object.class, object.id),
            _ => return Err(SessionError::UnknownHandle(handle)),
        };
        match std::mem::replace(&mut self.slots[handle.index()], Slot::Deleted { class, id }) {
            Slot::Live(object) => Ok(object),
            _ => Err(SessionError::UnknownHandle(handle)),
        }
    }

    /// Puts a tombstoned object back into its own slot.
    pub(crate) fn revive(&mut self, object: DomainObject) -> SessionResult<()> {
        let handle = object.handle;
        match self.slots.get(handle.index()) {
            Some(Slot::Deleted { id, .. }) if *id == object.id => {
                self.slots[handle.index()] = Slot::Live(object);
                Ok(())
            }
            Some(_) => Err(SessionError::UnknownHandle(handle)),
            None => Err(SessionError::UnknownHandle(handle)),
        }
    }

    pub fn owner_of(&self, handle: Handle) -> SessionResult<Option<OwnerLink>> {
        Ok(self.object(handle)?.owner)
    }

    /// Direct owned children in schema field order, then stored order.
    pub fn owned_children(&self, handle: Handle) -> SessionResult<Vec<Handle>> {
        let object = self.object(handle)?;
        let mut children = Vec::new();
        for descriptor in self.catalog.fields_of(object.class) {
            if !descriptor.kind.is_owning() {
                continue;
            }
            if let Some(value) = object.field(descriptor.id) {
                children.extend(value.targets());
            }
        }
        Ok(children)
    }

    /// `handle` followed by its transitive owned closure, preorder.
    pub fn owned_closure(&self, handle: Handle) -> SessionResult<Vec<Handle>> {
        let mut closure = Vec::new();
        let mut stack = vec![handle];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            closure.push(current);
            let children = self.owned_children(current)?;
            stack.extend(children.into_iter().rev());
        }
        Ok(closure)
    }

    /// True when `ancestor` is `handle` or one of its owners.
    pub fn is_self_or_ancestor(&self, ancestor: Handle, handle: Handle) -> SessionResult<bool> {
        let mut current = Some(handle);
        let mut steps = 0usize;
        while let Some(node) = current {
            if node == ancestor {
                return Ok(true);
            }
            steps += 1;
            if steps > self.slots.len() {
                break;
            }
            current = self.owner_of(node)?.map(|link| link.owner);
        }
        Ok(false)
    }

    /// Direct targets of every reference-kind field.
    pub fn referenced_targets(&self, handle: Handle) -> SessionResult<BTreeSet<Handle>> {
        let object = self.object(handle)?;
        let mut targets = BTreeSet::new();
        for descriptor in self.catalog.fields_of(object.class) {
            if !descriptor.kind.is_reference() {
                continue;
            }
            if let Some(value) = object.field(descriptor.id) {
                targets.extend(value.targets());
            }
        }
        Ok(targets)
    }

    /// Every (object, reference field) pair outside `excluded` that targets
    /// a member of `targets`. Surrogates whose text cannot mention a target
    /// are skipped without decoding.
    pub(crate) fn referrers_of(
        &self,
        targets: &BTreeSet<Handle>,
        excluded: &BTreeSet<Handle>,
    ) -> SessionResult<Vec<(Handle, FieldId)>> {
        let target_ids: Vec<String> = targets
            .iter()
            .filter_map(|handle| self.id_of(*handle))
            .map(|id| id.to_canonical_string())
            .collect();
        let mut referrers = Vec::new();
        for handle in self.handles() {
            if excluded.contains(&handle) {
                continue;
            }
            if let Slot::Unloaded(record) = &self.slots[handle.index()] {
                if !target_ids.iter().any(|id| record.xml.contains(id.as_str())) {
                    continue;
                }
            }
            let object = self.object(handle)?;
            for descriptor in self.catalog.fields_of(object.class) {
                if !descriptor.kind.is_reference() {
                    continue;
                }
                let hits = object
                    .field(descriptor.id)
                    .map(|value| value.targets().iter().any(|target| targets.contains(target)))
                    .unwrap_or(false);
                if hits {
                    referrers.push((handle, descriptor.id));
                }
            }
        }
        Ok(referrers)
    }

    /// Canonical record for one existing object; surrogates are reused
    /// verbatim.
    pub fn encode(&self, handle: Handle) -> SessionResult<BackendRecord> {
        match self.slot(handle)? {
            Slot::Unloaded(record) => Ok(record.clone()),
            Slot::Deleted { id, .. } => Err(SessionError::ObjectDeleted(*id)),
            Slot::Live(object) => {
                let owner = object
                    .owner
                    .and_then(|link| self.id_of(link.owner));
                let element = encode_record(
                    &self.catalog,
                    object.class,
                    object.id,
                    owner,
                    |field| object.fields.get(&field),
                    |target| self.id_of(target),
                )?;
                let class = self
                    .catalog
                    .class_name(object.class)
                    .unwrap_or_default()
                    .to_string();
                Ok(BackendRecord {
                    id: object.id,
                    class,
                    owner,
                    xml: write_element(&element)?,
                })
            }
        }
    }

    fn decode_fields(&self, record: &BackendRecord) -> SessionResult<DecodedRecord> {
        let element = record.element()?;
        Ok(decode_record(&self.catalog, &element, |id| self.handle_of(id))?)
    }

    fn decode(&self, handle: Handle, record: &BackendRecord) -> SessionResult<DomainObject> {
        let decoded = self.decode_fields(record)?;
        let mut object = DomainObject::new(decoded.class, decoded.id, handle);
        object.fields = decoded.fields;
        object.owner = match decoded.owner {
            Some(owner_id) => self.owner_link(handle, owner_id)?,
            None => None,
        };
        Ok(object)
    }

    /// Locates the owning field of `owner_id` that holds `child`.
    fn owner_link(&self, child: Handle, owner_id: ObjectId) -> SessionResult<Option<OwnerLink>> {
        let Some(owner) = self.handle_of(owner_id) else {
            warn!(
                "event=owner_resolve module=graph status=missing child={} owner={}",
                child, owner_id
            );
            return Ok(None);
        };
        let fields = match self.slot(owner)? {
            Slot::Live(object) => Cow::Borrowed(&object.fields),
            Slot::Unloaded(record) => Cow::Owned(self.decode_fields(record)?.fields),
            Slot::Deleted { .. } => return Ok(None),
        };
        let class = self.class_of(owner)?;
        for descriptor in self.catalog.fields_of(class) {
            if !descriptor.kind.is_owning() {
                continue;
            }
            if fields
                .get(&descriptor.id)
                .is_some_and(|value| value.targets().contains(&child))
            {
                return Ok(Some(OwnerLink {
                    owner,
                    field: descriptor.id,
                }));
            }
        }
        warn!(
            "event=owner_resolve module=graph status=unlinked child={} owner={}",
            child, owner_id
        );
        Ok(None)
    }
}
