//! Logged mutations: creation, field writes, ownership moves, deletion,
//! cloning and constraint recording.
//!
//! Every public entry point validates before the first primitive runs, so
//! a rejected call leaves the graph and the open frame untouched.

use super::{Session, SessionError, SessionResult};
use crate::integrity::{plan_clone, plan_deletion, CloneMap, DeletionPlan, ReferenceClear};
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{Cardinality, ClassId, FieldDescriptor, FieldId, FieldKind};
use crate::model::object::OwnerLink;
use crate::model::value::{FieldValue, ScalarValue};
use crate::uow::action::{Action, Effect};
use crate::validation::{self, ConstraintFailure};
use log::{debug, warn};

impl Session {
    /// Creates an unowned object of `class`.
    pub fn create(&mut self, class: &str) -> SessionResult<Handle> {
        self.require_task()?;
        let class = self.class_id(class)?;
        let id = ObjectId::new();
        let handle = self.graph.insert_new(class, id);
        self.log_applied(Action::Create { handle, class, id }, Effect::Created(handle))?;
        Ok(handle)
    }

    /// Creates an object directly inside an owning slot.
    pub fn create_owned(
        &mut self,
        class: &str,
        owner: Handle,
        field: FieldId,
        index: Option<usize>,
    ) -> SessionResult<Handle> {
        self.require_task()?;
        let class_id = self.class_id(class)?;
        let descriptor = self.owning_slot(owner, field, index)?;
        self.check_class(&descriptor, class_id)?;
        let len = self.vector_of(owner, field)?.len();
        if let Some(index) = index.filter(|index| *index > len) {
            return Err(SessionError::IndexOutOfRange { index, len });
        }
        let handle = self.create(class)?;
        self.set_owner(handle, owner, field, index)?;
        Ok(handle)
    }

    /// Sets or clears a scalar field. Writing the current value is a no-op.
    pub fn set_scalar(
        &mut self,
        handle: Handle,
        field: FieldId,
        value: Option<ScalarValue>,
    ) -> SessionResult<()> {
        self.require_task()?;
        let descriptor = self.descriptor_on(handle, field)?;
        let FieldKind::Scalar(expected) = descriptor.kind else {
            return Err(kind_mismatch(&descriptor, "a scalar field"));
        };
        if let Some(value) = &value {
            if value.scalar_type() != expected {
                return Err(kind_mismatch(&descriptor, descriptor.kind.type_name()));
            }
        }
        let old = self.scalar(handle, field)?;
        if old == value {
            return Ok(());
        }
        self.run_action(Action::SetScalar {
            handle,
            field,
            old,
            new: value,
        })
    }

    /// Sets or clears one writing-system alternative of a multi-string
    /// field. Empty text clears the alternative.
    pub fn set_multi(
        &mut self,
        handle: Handle,
        field: FieldId,
        ws: &str,
        text: Option<&str>,
    ) -> SessionResult<()> {
        self.require_task()?;
        let descriptor = self.descriptor_on(handle, field)?;
        if descriptor.kind != FieldKind::MultiString {
            return Err(kind_mismatch(&descriptor, "a multi-string field"));
        }
        let new = text.filter(|text| !text.is_empty()).map(str::to_string);
        let old = self.multi(handle, field, ws)?;
        if old == new {
            return Ok(());
        }
        self.run_action(Action::SetMulti {
            handle,
            field,
            ws: ws.to_string(),
            old,
            new,
        })
    }

    /// Points a reference-atomic field at `target`, or clears it.
    pub fn set_reference(
        &mut self,
        handle: Handle,
        field: FieldId,
        target: Option<Handle>,
    ) -> SessionResult<()> {
        self.require_task()?;
        let descriptor = self.descriptor_on(handle, field)?;
        if descriptor.kind != FieldKind::ReferenceAtomic {
            return Err(kind_mismatch(&descriptor, "a reference-atomic field"));
        }
        if let Some(target) = target {
            self.check_target(&descriptor, target)?;
        }
        let old = self.atomic_of(handle, field)?;
        if old == target {
            return Ok(());
        }
        self.run_action(Action::SetAtomic {
            handle,
            field,
            old,
            new: target,
        })
    }

    /// Adds `target` to a reference vector. Sequences insert at `index`
    /// (default: append); collections ignore targets already present and
    /// take no index.
    pub fn insert_reference(
        &mut self,
        handle: Handle,
        field: FieldId,
        index: Option<usize>,
        target: Handle,
    ) -> SessionResult<()> {
        self.require_task()?;
        let descriptor = self.descriptor_on(handle, field)?;
        let current = self.vector_of(handle, field)?;
        let at = match descriptor.kind {
            FieldKind::ReferenceSequence => match index {
                Some(index) if index > current.len() => {
                    return Err(SessionError::IndexOutOfRange {
                        index,
                        len: current.len(),
                    })
                }
                Some(index) => index,
                None => current.len(),
            },
            FieldKind::ReferenceCollection => {
                if index.is_some() {
                    return Err(kind_mismatch(&descriptor, "a reference-sequence field"));
                }
                current.len()
            }
            _ => return Err(kind_mismatch(&descriptor, "a reference vector field")),
        };
        self.check_target(&descriptor, target)?;
        if descriptor.kind == FieldKind::ReferenceCollection && current.contains(&target) {
            return Ok(());
        }
        self.run_action(Action::Insert {
            handle,
            field,
            index: at,
            target,
        })
    }

    /// Removes the first occurrence of `target` from a reference field.
    /// Returns whether anything was removed.
    pub fn remove_reference(
        &mut self,
        handle: Handle,
        field: FieldId,
        target: Handle,
    ) -> SessionResult<bool> {
        self.require_task()?;
        let descriptor = self.descriptor_on(handle, field)?;
        match descriptor.kind {
            FieldKind::ReferenceAtomic => {
                if self.atomic_of(handle, field)? != Some(target) {
                    return Ok(false);
                }
                self.run_action(Action::SetAtomic {
                    handle,
                    field,
                    old: Some(target),
                    new: None,
                })?;
                Ok(true)
            }
            FieldKind::ReferenceCollection | FieldKind::ReferenceSequence => {
                let Some(index) = self
                    .vector_of(handle, field)?
                    .iter()
                    .position(|entry| *entry == target)
                else {
                    return Ok(false);
                };
                self.run_action(Action::Remove {
                    handle,
                    field,
                    index,
                    target,
                })?;
                Ok(true)
            }
            _ => Err(kind_mismatch(&descriptor, "a reference field")),
        }
    }

    /// Removes the entry at `index` of a reference sequence.
    pub fn remove_reference_at(
        &mut self,
        handle: Handle,
        field: FieldId,
        index: usize,
    ) -> SessionResult<Handle> {
        self.require_task()?;
        let descriptor = self.descriptor_on(handle, field)?;
        if descriptor.kind != FieldKind::ReferenceSequence {
            return Err(kind_mismatch(&descriptor, "a reference-sequence field"));
        }
        let current = self.vector_of(handle, field)?;
        let Some(target) = current.get(index).copied() else {
            return Err(SessionError::IndexOutOfRange {
                index,
                len: current.len(),
            });
        };
        self.run_action(Action::Remove {
            handle,
            field,
            index,
            target,
        })?;
        Ok(target)
    }

    /// Moves `handle` into an owning slot of `owner`.
    ///
    /// The object leaves its previous slot first. `index` positions it in an
    /// owning sequence, counted after that removal; an owning-atomic slot
    /// that already holds another object deletes the occupant.
    pub fn set_owner(
        &mut self,
        handle: Handle,
        owner: Handle,
        field: FieldId,
        index: Option<usize>,
    ) -> SessionResult<()> {
        self.require_task()?;
        self.ensure_exists(handle)?;
        let descriptor = self.owning_slot(owner, field, index)?;
        self.check_class(&descriptor, self.graph.class_of(handle)?)?;
        if self.graph.is_self_or_ancestor(handle, owner)? {
            return Err(SessionError::OwnershipCycle {
                object: self.id_of(handle)?,
                owner: self.id_of(owner)?,
            });
        }

        let current = self.graph.owner_of(handle)?;
        let same_slot = current == Some(OwnerLink { owner, field });
        let mut slot = self.vector_of(owner, field)?;
        if same_slot {
            match descriptor.kind.cardinality() {
                Some(Cardinality::Sequence) => {
                    let position = slot.iter().position(|entry| *entry == handle);
                    let last = slot.len().saturating_sub(1);
                    if position == index.or(Some(last)) {
                        return Ok(());
                    }
                    slot.retain(|entry| *entry != handle);
                }
                _ => return Ok(()),
            }
        }
        if let Some(index) = index {
            if index > slot.len() {
                return Err(SessionError::IndexOutOfRange {
                    index,
                    len: slot.len(),
                });
            }
        }

        self.detach(handle)?;
        match descriptor.kind.cardinality() {
            Some(Cardinality::Atomic) => {
                if let Some(occupant) = self.atomic_of(owner, field)? {
                    debug!(
                        "event=owner_slot_replaced module=session status=ok owner={} occupant={}",
                        owner, occupant
                    );
                    self.delete(occupant)?;
                }
                self.run_action(Action::SetAtomic {
                    handle: owner,
                    field,
                    old: None,
                    new: Some(handle),
                })?;
            }
            _ => {
                let len = self.vector_of(owner, field)?.len();
                self.run_action(Action::Insert {
                    handle: owner,
                    field,
                    index: index.unwrap_or(len),
                    target: handle,
                })?;
            }
        }
        self.run_action(Action::SetOwner {
            handle,
            old: None,
            new: Some(OwnerLink { owner, field }),
        })
    }

    /// Deletes `handle` and everything it owns, clearing every surviving
    /// reference into the deleted set first.
    pub fn delete(&mut self, handle: Handle) -> SessionResult<()> {
        self.require_task()?;
        self.ensure_exists(handle)?;
        let plan = plan_deletion(&self.graph, handle)?;

        // Listeners notified by the clears must already see every member as gone.
        self.doomed.extend(plan.members.iter().copied());
        let result = self.execute_deletion(&plan);
        for member in &plan.members {
            self.doomed.remove(member);
        }
        result?;
        debug!(
            "event=delete module=session status=ok root={} members={}",
            handle,
            plan.members.len()
        );
        Ok(())
    }

    fn execute_deletion(&mut self, plan: &DeletionPlan) -> SessionResult<()> {
        for clear in &plan.clears {
            match *clear {
                ReferenceClear::Atomic { object, field } => {
                    let old = self.atomic_of(object, field)?;
                    self.run_action(Action::SetAtomic {
                        handle: object,
                        field,
                        old,
                        new: None,
                    })?;
                }
                ReferenceClear::Entries {
                    object,
                    field,
                    ref positions,
                } => {
                    for &(index, target) in positions {
                        self.run_action(Action::Remove {
                            handle: object,
                            field,
                            index,
                            target,
                        })?;
                    }
                }
            }
        }

        self.detach(plan.root)?;
        for member in &plan.members {
            let snapshot = self.graph.tombstone(*member)?;
            self.log_applied(Action::Delete { snapshot }, Effect::Deleted(*member))?;
        }
        Ok(())
    }

    /// Deep-copies each root with its owned closure. References between
    /// copied objects point at the copies; references leaving the copied
    /// set keep their original targets. Copies of roots are unowned.
    pub fn clone_objects(&mut self, roots: &[Handle]) -> SessionResult<Vec<Handle>> {
        self.require_task()?;
        for root in roots {
            self.ensure_exists(*root)?;
        }
        let plan = plan_clone(&self.graph, roots)?;

        let mut map = CloneMap::default();
        for original in &plan.originals {
            let class = self.graph.class_of(*original)?;
            let class_name = self
                .graph
                .catalog()
                .class_name(class)
                .unwrap_or_default()
                .to_string();
            let copy = self.create(&class_name)?;
            map.insert(*original, copy);
        }

        for original in &plan.originals {
            let copy = map.remap(*original);
            let object = self.graph.object(*original)?.into_owned();
            let descriptors: Vec<FieldDescriptor> = self
                .graph
                .catalog()
                .fields_of(object.class)
                .into_iter()
                .cloned()
                .collect();
            for descriptor in descriptors {
                let Some(value) = object.field(descriptor.id) else {
                    continue;
                };
                match value {
                    FieldValue::Scalar(scalar) => {
                        self.set_scalar(copy, descriptor.id, Some(scalar.clone()))?;
                    }
                    FieldValue::Multi(alternatives) => {
                        for (ws, text) in alternatives {
                            self.set_multi(copy, descriptor.id, ws, Some(text.as_str()))?;
                        }
                    }
                    FieldValue::Atomic(_) | FieldValue::Vector(_) => {
                        for target in value.targets() {
                            let mapped = map.remap(target);
                            if descriptor.kind.is_owning() {
                                self.set_owner(mapped, copy, descriptor.id, None)?;
                            } else if descriptor.kind == FieldKind::ReferenceAtomic {
                                self.set_reference(copy, descriptor.id, Some(mapped))?;
                            } else {
                                self.insert_reference(copy, descriptor.id, None, mapped)?;
                            }
                        }
                    }
                }
            }
        }
        debug!(
            "event=clone module=session status=ok roots={} copies={}",
            roots.len(),
            plan.originals.len()
        );
        Ok(plan.roots.iter().map(|root| map.remap(*root)).collect())
    }

    /// Clones `root` and places the copy into an owning slot.
    pub fn clone_into(
        &mut self,
        root: Handle,
        owner: Handle,
        field: FieldId,
        index: Option<usize>,
    ) -> SessionResult<Handle> {
        self.require_task()?;
        self.ensure_exists(root)?;
        let descriptor = self.owning_slot(owner, field, index)?;
        self.check_class(&descriptor, self.graph.class_of(root)?)?;
        let copies = self.clone_objects(&[root])?;
        let Some(copy) = copies.first().copied() else {
            return Err(SessionError::UnknownHandle(root));
        };
        self.set_owner(copy, owner, field, index)?;
        Ok(copy)
    }

    /// Runs the constraints of the object's class and records the first
    /// failure, or its absence, on the object. Recording is non-undoable
    /// and only happens when the stored message changes. While a task is
    /// open the recording waits until the outermost task ends, so it never
    /// lands in the task's undo entry.
    pub fn check_constraints(&mut self, handle: Handle) -> SessionResult<Vec<ConstraintFailure>> {
        self.ensure_exists(handle)?;
        let failures = validation::check_constraints(&self.graph, handle)?;
        if self.uow.is_active() {
            if !self.deferred_checks.contains(&handle) {
                self.deferred_checks.push(handle);
            }
        } else {
            self.record_constraint_result(handle, &failures)?;
        }
        Ok(failures)
    }

    /// Records the results of checks run while a task was open. Objects
    /// deleted since are skipped; the others are checked again.
    pub(super) fn record_deferred_constraints(&mut self) {
        for handle in std::mem::take(&mut self.deferred_checks) {
            if !self.exists(handle) {
                continue;
            }
            let recorded = validation::check_constraints(&self.graph, handle)
                .and_then(|failures| self.record_constraint_result(handle, &failures));
            if let Err(err) = recorded {
                warn!(
                    "event=constraint_record module=session status=error handle={} error={}",
                    handle, err
                );
            }
        }
    }

    fn record_constraint_result(
        &mut self,
        handle: Handle,
        failures: &[ConstraintFailure],
    ) -> SessionResult<()> {
        let class = self.graph.class_of(handle)?;
        let message_field = self
            .graph
            .catalog()
            .class_name(class)
            .and_then(|name| self.graph.catalog().resolve(name, "ValidationMessage").ok());
        if let Some(field) = message_field {
            let desired = failures
                .first()
                .map(|failure| ScalarValue::Unicode(failure.summary()));
            if self.scalar(handle, field)? != desired {
                self.do_somehow_non_undoable(|session| session.set_scalar(handle, field, desired))?;
            }
        }
        Ok(())
    }

    // ---- validation helpers ----

    fn ensure_exists(&self, handle: Handle) -> SessionResult<()> {
        if self.exists(handle) {
            return Ok(());
        }
        match self.graph.id_of(handle) {
            Some(id) => Err(SessionError::ObjectDeleted(id)),
            None => Err(SessionError::UnknownHandle(handle)),
        }
    }

    /// Descriptor of `field`, which must be declared on the object's class.
    fn descriptor_on(&self, handle: Handle, field: FieldId) -> SessionResult<FieldDescriptor> {
        self.ensure_exists(handle)?;
        let class = self.graph.class_of(handle)?;
        match self.graph.catalog().field(field) {
            Some(descriptor) if descriptor.class == class => Ok(descriptor.clone()),
            _ => Err(SessionError::FieldNotOnClass {
                field,
                class: self
                    .graph
                    .catalog()
                    .class_name(class)
                    .unwrap_or_default()
                    .to_string(),
            }),
        }
    }

    /// Validates an owning slot and its index rule.
    fn owning_slot(
        &self,
        owner: Handle,
        field: FieldId,
        index: Option<usize>,
    ) -> SessionResult<FieldDescriptor> {
        let descriptor = self.descriptor_on(owner, field)?;
        if !descriptor.kind.is_owning() {
            return Err(kind_mismatch(&descriptor, "an owning field"));
        }
        if index.is_some() && descriptor.kind != FieldKind::OwningSequence {
            return Err(kind_mismatch(&descriptor, "an owning-sequence field"));
        }
        Ok(descriptor)
    }

    fn check_target(&self, descriptor: &FieldDescriptor, target: Handle) -> SessionResult<()> {
        self.ensure_exists(target)?;
        self.check_class(descriptor, self.graph.class_of(target)?)
    }

    fn check_class(
        &self,
        descriptor: &FieldDescriptor,
        class: ClassId,
    ) -> SessionResult<()> {
        match descriptor.target_class {
            Some(expected) if expected != class => {
                let catalog = self.graph.catalog();
                Err(SessionError::ClassMismatch {
                    field: field_label(self, descriptor),
                    expected: catalog.class_name(expected).unwrap_or_default().to_string(),
                    found: catalog.class_name(class).unwrap_or_default().to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn atomic_of(&self, handle: Handle, field: FieldId) -> SessionResult<Option<Handle>> {
        Ok(match self.graph.field(handle, field)? {
            Some(FieldValue::Atomic(target)) => Some(target),
            _ => None,
        })
    }

    fn vector_of(&self, handle: Handle, field: FieldId) -> SessionResult<Vec<Handle>> {
        Ok(match self.graph.field(handle, field)? {
            Some(FieldValue::Vector(targets)) => targets,
            _ => Vec::new(),
        })
    }

    /// Removes `handle` from its owning slot and clears its owner link.
    fn detach(&mut self, handle: Handle) -> SessionResult<()> {
        let Some(link) = self.graph.owner_of(handle)? else {
            return Ok(());
        };
        if self.atomic_of(link.owner, link.field)? == Some(handle) {
            self.run_action(Action::SetAtomic {
                handle: link.owner,
                field: link.field,
                old: Some(handle),
                new: None,
            })?;
        } else if let Some(index) = self
            .vector_of(link.owner, link.field)?
            .iter()
            .position(|entry| *entry == handle)
        {
            self.run_action(Action::Remove {
                handle: link.owner,
                field: link.field,
                index,
                target: handle,
            })?;
        }
        self.run_action(Action::SetOwner {
            handle,
            old: Some(link),
            new: None,
        })
    }
}

fn field_label(session: &Session, descriptor: &FieldDescriptor) -> String {
    let class = session
        .graph
        .catalog()
        .class_name(descriptor.class)
        .unwrap_or_default();
    format!("{}.{}", class, descriptor.name)
}

fn kind_mismatch(descriptor: &FieldDescriptor, expected: &'static str) -> SessionError {
    SessionError::FieldKindMismatch {
        field: descriptor.name.clone(),
        expected,
    }
}
