//! Unit-of-work frames, undo/redo stacks and change tracking.
//!
//! # Responsibility
//! - Track the stack of open task frames and their logged actions.
//! - Keep completed tasks for undo and redo.
//! - Accumulate new/dirty/deleted sets for commits and for gathers.
//!
//! # Invariants
//! - Actions are logged only while at least one frame is open.
//! - Ending an inner frame folds its actions into the parent, in order.
//! - The three tracked sets stay pairwise disjoint.

pub mod action;

use crate::model::id::Handle;
use crate::model::meta::FieldId;
use crate::session::{Session, SessionResult};
use action::Action;
use std::collections::{BTreeSet, VecDeque};

/// One field mutation as reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropChanged {
    pub object: Handle,
    pub field: FieldId,
    /// First affected position; 0 for non-vector fields.
    pub index: usize,
    pub inserted: usize,
    pub deleted: usize,
}

impl PropChanged {
    /// Whole-value replacement of a non-vector field.
    pub fn replaced(object: Handle, field: FieldId) -> Self {
        Self {
            object,
            field,
            index: 0,
            inserted: 1,
            deleted: 1,
        }
    }
}

/// Synchronous observer of field mutations.
///
/// Runs on the mutating call stack with the active frame still open, so
/// it may mutate the session itself; `Session::do_somehow` keeps such
/// writes inline.
pub trait ChangeListener {
    fn prop_changed(&self, session: &mut Session, change: &PropChanged) -> SessionResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub undo_label: String,
    pub redo_label: String,
    pub undoable: bool,
    pub actions: Vec<Action>,
}

/// A finished top-level task on the undo or redo stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTask {
    pub undo_label: String,
    pub redo_label: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone)]
pub(crate) struct UnitOfWork {
    frames: Vec<Frame>,
    undo_stack: VecDeque<CompletedTask>,
    redo_stack: Vec<CompletedTask>,
    undo_limit: usize,
}

impl UnitOfWork {
    pub fn new(undo_limit: usize) -> Self {
        Self {
            frames: Vec::new(),
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            undo_limit: undo_limit.max(1),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn push_frame(&mut self, undo_label: &str, redo_label: &str, undoable: bool) {
        self.frames.push(Frame {
            undo_label: undo_label.to_string(),
            redo_label: redo_label.to_string(),
            undoable,
            actions: Vec::new(),
        });
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Appends the actions of an ended inner frame to the innermost frame.
    pub fn fold_into_innermost(&mut self, actions: Vec<Action>) {
        if let Some(parent) = self.frames.last_mut() {
            parent.actions.extend(actions);
        }
    }

    pub fn log(&mut self, action: Action) {
        if let Some(frame) = self.frames.last_mut() {
            frame.actions.push(action);
        }
    }

    /// Records a finished top-level task, clearing redo and trimming the
    /// oldest entries past the limit.
    pub fn push_undo(&mut self, task: CompletedTask) {
        self.redo_stack.clear();
        self.undo_stack.push_back(task);
        while self.undo_stack.len() > self.undo_limit {
            self.undo_stack.pop_front();
        }
    }

    pub fn take_undo(&mut self) -> Option<CompletedTask> {
        self.undo_stack.pop_back()
    }

    pub fn take_redo(&mut self) -> Option<CompletedTask> {
        self.redo_stack.pop()
    }

    /// Returns an undone task to the redo stack without touching undo.
    pub fn push_redo(&mut self, task: CompletedTask) {
        self.redo_stack.push(task);
    }

    /// Returns a redone task to the undo stack without clearing redo.
    pub fn restore_undo(&mut self, task: CompletedTask) {
        self.undo_stack.push_back(task);
        while self.undo_stack.len() > self.undo_limit {
            self.undo_stack.pop_front();
        }
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.back().map(|task| task.undo_label.as_str())
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.redo_stack.last().map(|task| task.redo_label.as_str())
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }
}

/// Disjoint new/dirty/deleted sets since the tracker was last drained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeTracker {
    new: BTreeSet<Handle>,
    dirty: BTreeSet<Handle>,
    deleted: BTreeSet<Handle>,
}

impl ChangeTracker {
    pub fn created(&mut self, handle: Handle) {
        // A handle deleted earlier in this window came back by undo: the
        // store still has it, so it is an update.
        if self.deleted.remove(&handle) {
            self.dirty.insert(handle);
        } else {
            self.new.insert(handle);
        }
    }

    pub fn modified(&mut self, handle: Handle) {
        if !self.new.contains(&handle) && !self.deleted.contains(&handle) {
            self.dirty.insert(handle);
        }
    }

    pub fn deleted(&mut self, handle: Handle) {
        if self.new.remove(&handle) {
            return;
        }
        self.dirty.remove(&handle);
        self.deleted.insert(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }

    pub fn new_objects(&self) -> &BTreeSet<Handle> {
        &self.new
    }

    pub fn dirty_objects(&self) -> &BTreeSet<Handle> {
        &self.dirty
    }

    pub fn deleted_objects(&self) -> &BTreeSet<Handle> {
        &self.deleted
    }

    pub fn take(&mut self) -> ChangeTracker {
        std::mem::take(self)
    }
}
