//! Public session façade over graph, unit of work and backend.
//!
//! # Responsibility
//! - Open a backend, register its records and materialize the startup
//!   domain.
//! - Drive task frames, undo/redo, change notification and commits.
//! - Expose read access to the graph; mutations live in `mutation`.
//!
//! # Invariants
//! - Every mutation happens inside an open frame and is logged there.
//! - A commit happens only when the outermost frame closes, or on explicit
//!   retry, and applies the whole pending change set or none of it.
//! - A `Session` is single-threaded: listeners are `Rc`.
//! - Undo and redo replay exactly the logged actions; listeners are
//!   notified but cannot write while a replay runs.
//! - Members of a deletion in progress are invalid for every mutator.

mod error;
mod mutation;

pub use error::{SessionError, SessionResult};

use crate::backend::{open_backend, Backend, BackendDescriptor, ChangeSet, LoadDomain};
use crate::config::EngineConfig;
use crate::graph::ObjectGraph;
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{ClassId, CustomFieldDef, FieldId, FieldRename, MetaCatalog};
use crate::model::object::DomainObject;
use crate::model::value::{FieldValue, ScalarValue};
use crate::serial::document::DocumentWriter;
use crate::uow::action::{Action, Direction, Effect};
use crate::uow::{ChangeListener, ChangeTracker, CompletedTask, PropChanged, UnitOfWork};
use log::{debug, error, info, warn};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

/// Identities changed since the previous `gather_changes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatheredChanges {
    pub new_objects: BTreeSet<ObjectId>,
    pub dirty_objects: BTreeSet<ObjectId>,
    pub deleted_objects: BTreeSet<ObjectId>,
}

pub struct Session {
    graph: ObjectGraph,
    uow: UnitOfWork,
    backend: Box<dyn Backend>,
    config: EngineConfig,
    listeners: Vec<Rc<dyn ChangeListener>>,
    commit_tracker: ChangeTracker,
    gather_tracker: ChangeTracker,
    custom_fields_dirty: bool,
    replaying: bool,
    /// Members of the deletion currently executing.
    doomed: BTreeSet<Handle>,
    /// Objects checked while a task was open, recorded once it closes.
    deferred_checks: Vec<Handle>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("replaying", &self.replaying)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens the backend a descriptor names with the built-in schema.
    pub fn open(descriptor: &BackendDescriptor, config: EngineConfig) -> SessionResult<Self> {
        let backend = open_backend(descriptor)?;
        Self::with_backend(backend, MetaCatalog::builtin(), config)
    }

    /// Opens a session over an already-constructed backend.
    pub fn with_backend(
        backend: Box<dyn Backend>,
        mut catalog: MetaCatalog,
        config: EngineConfig,
    ) -> SessionResult<Self> {
        config.validate()?;
        let started_at = Instant::now();
        catalog.merge_custom_fields(&backend.load_custom_fields()?)?;
        let records = backend.load_domain(&LoadDomain::Everything)?;

        let mut graph = ObjectGraph::new(catalog);
        for record in records {
            graph.register_record(record);
        }
        let mut session = Self {
            graph,
            uow: UnitOfWork::new(config.undo_depth),
            backend,
            config,
            listeners: Vec::new(),
            commit_tracker: ChangeTracker::default(),
            gather_tracker: ChangeTracker::default(),
            custom_fields_dirty: false,
            replaying: false,
            doomed: BTreeSet::new(),
            deferred_checks: Vec::new(),
        };
        let startup = session.config.startup_domain.clone();
        let materialized = session.load_domain(&startup)?;
        info!(
            "event=session_open module=session status=ok backend={} objects={} materialized={} duration_ms={}",
            session.backend.descriptor().kind(),
            session.graph.len(),
            materialized,
            started_at.elapsed().as_millis()
        );
        Ok(session)
    }

    /// Materializes a domain, registering records the store gained since
    /// open. Returns how many objects were newly materialized.
    pub fn load_domain(&mut self, domain: &LoadDomain) -> SessionResult<usize> {
        let records = self.backend.load_domain(domain)?;
        let handles: Vec<Handle> = records
            .into_iter()
            .map(|record| self.graph.register_record(record))
            .collect();
        let mut materialized = 0;
        for handle in handles {
            if self.graph.exists(handle) && !self.graph.is_materialized(handle) {
                self.graph.materialize(handle)?;
                materialized += 1;
            }
        }
        debug!(
            "event=load_domain module=session status=ok domain={:?} materialized={}",
            domain, materialized
        );
        Ok(materialized)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &MetaCatalog {
        self.graph.catalog()
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        self.backend.descriptor()
    }

    /// Objects currently existing in this session.
    pub fn object_count(&self) -> usize {
        self.graph.len()
    }

    /// Objects durably stored by the backend.
    pub fn stored_object_count(&self) -> SessionResult<usize> {
        Ok(self.backend.object_count()?)
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.graph.handles().collect()
    }

    pub fn objects_of_class(&self, class: &str) -> SessionResult<Vec<Handle>> {
        let class_id = self.class_id(class)?;
        let mut handles = Vec::new();
        for handle in self.graph.handles() {
            if self.graph.class_of(handle)? == class_id {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    pub fn handle_of(&self, id: ObjectId) -> Option<Handle> {
        self.graph.handle_of(id).filter(|handle| self.exists(*handle))
    }

    pub fn id_of(&self, handle: Handle) -> SessionResult<ObjectId> {
        self.graph
            .id_of(handle)
            .ok_or(SessionError::UnknownHandle(handle))
    }

    /// False for deleted handles and for members of a deletion in progress.
    pub fn exists(&self, handle: Handle) -> bool {
        self.graph.exists(handle) && !self.doomed.contains(&handle)
    }

    pub fn is_materialized(&self, handle: Handle) -> bool {
        self.graph.is_materialized(handle)
    }

    pub fn object(&self, handle: Handle) -> SessionResult<Cow<'_, DomainObject>> {
        self.graph.object(handle)
    }

    pub fn class_name(&self, handle: Handle) -> SessionResult<&str> {
        let class = self.graph.class_of(handle)?;
        Ok(self.graph.catalog().class_name(class).unwrap_or_default())
    }

    /// Resolves `Class.Field` against the session catalog.
    pub fn field_id(&self, class: &str, field: &str) -> SessionResult<FieldId> {
        Ok(self.graph.catalog().resolve(class, field)?)
    }

    fn class_id(&self, class: &str) -> SessionResult<ClassId> {
        self.graph
            .catalog()
            .class_id(class)
            .ok_or_else(|| crate::model::meta::CatalogError::UnknownClass(class.to_string()).into())
    }

    pub fn field(&self, handle: Handle, field: FieldId) -> SessionResult<Option<FieldValue>> {
        self.graph.field(handle, field)
    }

    pub fn scalar(&self, handle: Handle, field: FieldId) -> SessionResult<Option<ScalarValue>> {
        Ok(match self.graph.field(handle, field)? {
            Some(FieldValue::Scalar(value)) => Some(value),
            _ => None,
        })
    }

    pub fn multi(&self, handle: Handle, field: FieldId, ws: &str) -> SessionResult<Option<String>> {
        Ok(match self.graph.field(handle, field)? {
            Some(FieldValue::Multi(alternatives)) => alternatives.get(ws).cloned(),
            _ => None,
        })
    }

    /// Targets of an object-valued field in stored order.
    pub fn targets(&self, handle: Handle, field: FieldId) -> SessionResult<Vec<Handle>> {
        Ok(self
            .graph
            .field(handle, field)?
            .map(|value| value.targets())
            .unwrap_or_default())
    }

    pub fn owner_of(&self, handle: Handle) -> SessionResult<Option<Handle>> {
        Ok(self.graph.owner_of(handle)?.map(|link| link.owner))
    }

    pub fn owning_field(&self, handle: Handle) -> SessionResult<Option<FieldId>> {
        Ok(self.graph.owner_of(handle)?.map(|link| link.field))
    }

    /// Position inside the owner's vector field; `None` for roots and
    /// atomic slots.
    pub fn ordinal(&self, handle: Handle) -> SessionResult<Option<usize>> {
        let Some(link) = self.graph.owner_of(handle)? else {
            return Ok(None);
        };
        Ok(match self.graph.field(link.owner, link.field)? {
            Some(FieldValue::Vector(handles)) => handles.iter().position(|h| *h == handle),
            _ => None,
        })
    }

    pub fn owned_objects(&self, handle: Handle) -> SessionResult<Vec<Handle>> {
        self.graph.owned_children(handle)
    }

    /// Transitive owned descendants, excluding `handle`.
    pub fn all_owned_objects(&self, handle: Handle) -> SessionResult<Vec<Handle>> {
        let mut closure = self.graph.owned_closure(handle)?;
        closure.remove(0);
        Ok(closure)
    }

    pub fn all_referenced_objects(&self, handle: Handle) -> SessionResult<BTreeSet<Handle>> {
        self.graph.referenced_targets(handle)
    }

    // ---- unit of work ----

    pub fn depth(&self) -> usize {
        self.uow.depth()
    }

    pub fn is_task_active(&self) -> bool {
        self.uow.is_active()
    }

    /// True while undo, redo or an unwind replays logged actions.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Opens a top-level task.
    pub fn begin_task(&mut self, undo_label: &str, redo_label: &str) -> SessionResult<()> {
        self.require_not_replaying()?;
        if self.uow.is_active() {
            return Err(SessionError::TaskAlreadyActive);
        }
        self.uow.push_frame(undo_label, redo_label, true);
        Ok(())
    }

    /// Opens a frame at any depth; at depth 0 this is `begin_task`.
    pub fn begin_nested_task(&mut self, undo_label: &str, redo_label: &str) -> SessionResult<()> {
        self.require_not_replaying()?;
        self.uow.push_frame(undo_label, redo_label, true);
        Ok(())
    }

    /// Closes the innermost frame; closing the outermost records the task
    /// for undo and commits.
    pub fn end_task(&mut self) -> SessionResult<()> {
        self.require_not_replaying()?;
        let frame = self.uow.pop_frame().ok_or(SessionError::NoActiveTask)?;
        if self.uow.is_active() {
            self.uow.fold_into_innermost(frame.actions);
            return Ok(());
        }
        let actions = frame.actions.len();
        if frame.undoable && !frame.actions.is_empty() {
            self.uow.push_undo(CompletedTask {
                undo_label: frame.undo_label,
                redo_label: frame.redo_label,
                actions: frame.actions,
            });
        }
        debug!(
            "event=task_end module=session status=ok undoable={} actions={}",
            frame.undoable, actions
        );
        self.commit_and_record()
    }

    /// Reverts and discards every frame deeper than `depth`.
    pub fn unwind_to(&mut self, depth: usize) -> SessionResult<()> {
        self.require_not_replaying()?;
        while self.uow.depth() > depth {
            let Some(frame) = self.uow.pop_frame() else {
                break;
            };
            warn!(
                "event=task_unwind module=session status=ok depth={} actions={}",
                self.uow.depth() + 1,
                frame.actions.len()
            );
            self.replay(&frame.actions, Direction::Backward)?;
        }
        Ok(())
    }

    /// Runs `work` inline in the open task, or in a task of its own that
    /// is rolled back if `work` fails.
    pub fn do_somehow<T>(
        &mut self,
        undo_label: &str,
        redo_label: &str,
        work: impl FnOnce(&mut Session) -> SessionResult<T>,
    ) -> SessionResult<T> {
        self.require_not_replaying()?;
        if self.uow.is_active() {
            return work(self);
        }
        self.uow.push_frame(undo_label, redo_label, true);
        self.finish_own_frame(work)
    }

    /// Like `do_somehow`, but a task it opens never reaches the undo stack.
    pub fn do_somehow_non_undoable<T>(
        &mut self,
        work: impl FnOnce(&mut Session) -> SessionResult<T>,
    ) -> SessionResult<T> {
        self.require_not_replaying()?;
        if self.uow.is_active() {
            return work(self);
        }
        self.uow.push_frame("", "", false);
        self.finish_own_frame(work)
    }

    fn finish_own_frame<T>(
        &mut self,
        work: impl FnOnce(&mut Session) -> SessionResult<T>,
    ) -> SessionResult<T> {
        match work(self) {
            Ok(value) => {
                self.end_task()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(unwind_err) = self.unwind_to(0) {
                    error!(
                        "event=task_unwind module=session status=error error={}",
                        unwind_err
                    );
                }
                Err(err)
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.uow.is_active() && self.uow.undo_len() > 0
    }

    pub fn can_redo(&self) -> bool {
        !self.uow.is_active() && self.uow.redo_len() > 0
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.uow.undo_label()
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.uow.redo_label()
    }

    pub fn undo_count(&self) -> usize {
        self.uow.undo_len()
    }

    pub fn redo_count(&self) -> usize {
        self.uow.redo_len()
    }

    pub fn undo(&mut self) -> SessionResult<()> {
        if self.uow.is_active() {
            return Err(SessionError::TaskInProgress);
        }
        let task = self.uow.take_undo().ok_or(SessionError::NothingToUndo)?;
        match self.replay_task(&task, Direction::Backward) {
            Ok(()) => {
                info!(
                    "event=undo module=session status=ok label={} actions={}",
                    task.undo_label,
                    task.actions.len()
                );
                self.uow.push_redo(task);
                self.commit_and_record()
            }
            Err(err) => {
                self.uow.restore_undo(task);
                Err(err)
            }
        }
    }

    pub fn redo(&mut self) -> SessionResult<()> {
        if self.uow.is_active() {
            return Err(SessionError::TaskInProgress);
        }
        let task = self.uow.take_redo().ok_or(SessionError::NothingToRedo)?;
        match self.replay_task(&task, Direction::Forward) {
            Ok(()) => {
                info!(
                    "event=redo module=session status=ok label={} actions={}",
                    task.redo_label,
                    task.actions.len()
                );
                self.uow.restore_undo(task);
                self.commit_and_record()
            }
            Err(err) => {
                self.uow.push_redo(task);
                Err(err)
            }
        }
    }

    /// Replays a completed task inside a non-undoable frame. The task's log
    /// already holds every listener side effect, so listeners only observe;
    /// constraint checks they run are recorded once the replay finishes.
    fn replay_task(&mut self, task: &CompletedTask, direction: Direction) -> SessionResult<()> {
        self.uow
            .push_frame(&task.undo_label, &task.redo_label, false);
        let result = self.replay(&task.actions, direction);
        self.uow.pop_frame();
        result
    }

    /// Applies actions without logging them. On failure the actions already
    /// applied are reverted and the error is returned.
    fn replay(&mut self, actions: &[Action], direction: Direction) -> SessionResult<()> {
        let was_replaying = std::mem::replace(&mut self.replaying, true);
        let result = self.replay_actions(actions, direction);
        self.replaying = was_replaying;
        result
    }

    fn replay_actions(&mut self, actions: &[Action], direction: Direction) -> SessionResult<()> {
        let ordered: Vec<&Action> = match direction {
            Direction::Forward => actions.iter().collect(),
            Direction::Backward => actions.iter().rev().collect(),
        };
        let opposite = match direction {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        };
        for (done, action) in ordered.iter().enumerate() {
            if let Err(err) = self.replay_one(action, direction) {
                for applied in ordered[..done].iter().rev() {
                    if let Err(rollback_err) = self.replay_one(applied, opposite) {
                        error!(
                            "event=replay_rollback module=session status=error object={} error={}",
                            applied.handle(),
                            rollback_err
                        );
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn replay_one(&mut self, action: &Action, direction: Direction) -> SessionResult<()> {
        let effect = action.apply(&mut self.graph, direction)?;
        if let Err(err) = self.after_effect(effect) {
            warn!(
                "event=listener_failed module=session status=error during=replay error={}",
                err
            );
        }
        Ok(())
    }

    /// Applies a forward action and logs it in the innermost frame.
    fn run_action(&mut self, action: Action) -> SessionResult<()> {
        self.require_task()?;
        let effect = action.apply(&mut self.graph, Direction::Forward)?;
        self.uow.log(action);
        self.after_effect(effect)
    }

    /// Logs an action whose effect the caller already applied.
    fn log_applied(&mut self, action: Action, effect: Effect) -> SessionResult<()> {
        self.uow.log(action);
        self.after_effect(effect)
    }

    fn after_effect(&mut self, effect: Effect) -> SessionResult<()> {
        match effect {
            Effect::Created(handle) => {
                self.commit_tracker.created(handle);
                self.gather_tracker.created(handle);
                Ok(())
            }
            Effect::Deleted(handle) => {
                self.commit_tracker.deleted(handle);
                self.gather_tracker.deleted(handle);
                Ok(())
            }
            Effect::OwnerChanged(handle) => {
                self.commit_tracker.modified(handle);
                self.gather_tracker.modified(handle);
                Ok(())
            }
            Effect::Changed(change) => {
                self.commit_tracker.modified(change.object);
                self.gather_tracker.modified(change.object);
                self.notify(&change)
            }
        }
    }

    fn notify(&mut self, change: &PropChanged) -> SessionResult<()> {
        let listeners = self.listeners.clone();
        for listener in listeners {
            listener.prop_changed(self, change)?;
        }
        Ok(())
    }

    fn require_task(&self) -> SessionResult<()> {
        self.require_not_replaying()?;
        if self.uow.is_active() {
            Ok(())
        } else {
            Err(SessionError::NoActiveTask)
        }
    }

    fn require_not_replaying(&self) -> SessionResult<()> {
        if self.replaying {
            Err(SessionError::ReplayInProgress)
        } else {
            Ok(())
        }
    }

    fn require_idle(&self) -> SessionResult<()> {
        if self.uow.is_active() {
            Err(SessionError::TaskInProgress)
        } else {
            Ok(())
        }
    }

    // ---- notification and change tracking ----

    pub fn add_listener(&mut self, listener: Rc<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Rc<dyn ChangeListener>) {
        self.listeners
            .retain(|registered| !Rc::ptr_eq(registered, listener));
    }

    /// Drains the gather window: new, dirty and deleted identities since
    /// the previous call.
    pub fn gather_changes(&mut self) -> GatheredChanges {
        let tracker = self.gather_tracker.take();
        let ids = |handles: &BTreeSet<Handle>| -> BTreeSet<ObjectId> {
            handles
                .iter()
                .filter_map(|handle| self.graph.id_of(*handle))
                .collect()
        };
        GatheredChanges {
            new_objects: ids(tracker.new_objects()),
            dirty_objects: ids(tracker.dirty_objects()),
            deleted_objects: ids(tracker.deleted_objects()),
        }
    }

    /// True while changes await a successful commit.
    pub fn has_pending_changes(&self) -> bool {
        !self.commit_tracker.is_empty() || self.custom_fields_dirty
    }

    /// Commits everything pending; used after a failed commit to retry.
    pub fn commit_pending(&mut self) -> SessionResult<()> {
        self.require_idle()?;
        if !self.has_pending_changes() {
            return Ok(());
        }
        let started_at = Instant::now();
        let changes = self.pending_change_set()?;
        match self.backend.commit(&changes) {
            Ok(()) => {
                self.commit_tracker = ChangeTracker::default();
                self.custom_fields_dirty = false;
                info!(
                    "event=commit module=session status=ok upserts={} deletes={} duration_ms={}",
                    changes.upserts.len(),
                    changes.deletes.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=commit module=session status=error upserts={} deletes={} error={}",
                    changes.upserts.len(),
                    changes.deletes.len(),
                    err
                );
                Err(err.into())
            }
        }
    }

    fn commit_and_record(&mut self) -> SessionResult<()> {
        let committed = self.commit_pending();
        self.record_deferred_constraints();
        committed
    }

    fn pending_change_set(&self) -> SessionResult<ChangeSet> {
        let mut upserts = Vec::new();
        for handle in self
            .commit_tracker
            .new_objects()
            .iter()
            .chain(self.commit_tracker.dirty_objects())
        {
            upserts.push(self.graph.encode(*handle)?);
        }
        upserts.sort_by_key(|record| record.id);
        let mut deletes: Vec<ObjectId> = self
            .commit_tracker
            .deleted_objects()
            .iter()
            .filter_map(|handle| self.graph.id_of(*handle))
            .collect();
        deletes.sort();
        Ok(ChangeSet {
            upserts,
            deletes,
            custom_fields: self
                .custom_fields_dirty
                .then(|| self.graph.catalog().custom_fields()),
        })
    }

    // ---- custom fields ----

    /// Declares a custom field and commits the declaration.
    pub fn add_custom_field(&mut self, def: &CustomFieldDef) -> SessionResult<FieldId> {
        self.require_idle()?;
        let field = self.graph.catalog_mut().add_custom_field(def)?;
        self.custom_fields_dirty = true;
        self.commit_pending()?;
        Ok(field)
    }

    /// Merges incoming declarations with the collision rename rule. Objects
    /// carrying a renamed field are re-recorded under the new name.
    pub fn merge_custom_fields(
        &mut self,
        incoming: &[CustomFieldDef],
    ) -> SessionResult<Vec<FieldRename>> {
        self.require_idle()?;
        let mut affected_classes = BTreeSet::new();
        for def in incoming {
            let catalog = self.graph.catalog();
            let existing = catalog.class_id(&def.class).and_then(|class| {
                catalog
                    .field_by_name(class, def.name.trim())
                    .map(|field| (class, field.kind))
            });
            if let Some((class, kind)) = existing {
                if kind != def.kind {
                    affected_classes.insert(class);
                }
            }
        }
        // Surrogates must decode under the old names before the rename.
        let handles: Vec<Handle> = self.graph.handles().collect();
        for handle in &handles {
            if affected_classes.contains(&self.graph.class_of(*handle)?) {
                self.graph.materialize(*handle)?;
            }
        }

        let before = self.graph.catalog().custom_fields();
        let renames = self.graph.catalog_mut().merge_custom_fields(incoming)?;
        for rename in &renames {
            for handle in &handles {
                if self.graph.field(*handle, rename.field)?.is_some() {
                    self.commit_tracker.modified(*handle);
                    self.gather_tracker.modified(*handle);
                }
            }
        }
        if self.graph.catalog().custom_fields() != before {
            self.custom_fields_dirty = true;
        }
        self.commit_pending()?;
        Ok(renames)
    }

    // ---- export ----

    /// Writes the whole repository as one canonical document.
    pub fn export_document<W: Write>(&self, out: W) -> SessionResult<W> {
        let mut writer = DocumentWriter::new(out, &self.config.repository_version, self.config.sorter())
            .with_custom_fields(self.graph.catalog().custom_fields());
        for handle in self.graph.handles() {
            let record = self.graph.encode(handle)?;
            writer.push_record(record.id, record.xml)?;
        }
        Ok(writer.finish()?)
    }

    pub fn export_document_string(&self) -> SessionResult<String> {
        let bytes = self.export_document(Vec::new())?;
        String::from_utf8(bytes).map_err(|err| {
            SessionError::Serial(crate::serial::SerialError::Malformed(format!(
                "document is not valid utf-8: {err}"
            )))
        })
    }

    pub(crate) fn graph(&self) -> &ObjectGraph {
        &self.graph
    }
}
