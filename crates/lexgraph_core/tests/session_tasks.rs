use lexgraph_core::backend::{Backend, BackendRecord, ChangeSet, MemoryBackend};
use lexgraph_core::{
    BackendDescriptor, BackendError, BackendResult, ChangeListener, CustomFieldDef, EngineConfig,
    FieldId, Handle, LoadDomain, MetaCatalog, PropChanged, ScalarValue, Session, SessionError,
    SessionResult,
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

fn open_memory() -> Session {
    Session::open(&BackendDescriptor::Memory, EngineConfig::default()).unwrap()
}

fn field(session: &Session, class: &str, name: &str) -> FieldId {
    session.field_id(class, name).unwrap()
}

#[test]
fn mutations_and_end_require_an_active_task() {
    let mut session = open_memory();
    assert!(matches!(
        session.create("LexEntry"),
        Err(SessionError::NoActiveTask)
    ));
    assert!(matches!(session.end_task(), Err(SessionError::NoActiveTask)));
    assert!(matches!(session.undo(), Err(SessionError::NothingToUndo)));
    assert!(matches!(session.redo(), Err(SessionError::NothingToRedo)));
}

#[test]
fn nested_frames_fold_into_one_undoable_task() {
    let mut session = open_memory();
    let homograph = field(&session, "LexEntry", "HomographNumber");

    session.begin_task("Undo add entry", "Redo add entry").unwrap();
    let entry = session.create("LexEntry").unwrap();
    assert!(matches!(
        session.begin_task("again", "again"),
        Err(SessionError::TaskAlreadyActive)
    ));
    session.begin_nested_task("inner", "inner").unwrap();
    session
        .set_scalar(entry, homograph, Some(ScalarValue::Integer(2)))
        .unwrap();
    assert_eq!(session.depth(), 2);
    session.end_task().unwrap();
    assert_eq!(session.undo_count(), 0);
    assert_eq!(session.stored_object_count().unwrap(), 0);
    session.end_task().unwrap();

    assert_eq!(session.undo_count(), 1);
    assert_eq!(session.undo_label(), Some("Undo add entry"));
    assert_eq!(session.stored_object_count().unwrap(), 1);

    session.undo().unwrap();
    assert!(!session.exists(entry));
    assert_eq!(session.stored_object_count().unwrap(), 0);
    assert_eq!(session.redo_label(), Some("Redo add entry"));

    session.redo().unwrap();
    assert!(session.exists(entry));
    assert_eq!(
        session.scalar(entry, homograph).unwrap(),
        Some(ScalarValue::Integer(2))
    );
    assert_eq!(session.stored_object_count().unwrap(), 1);
    assert!(session.can_undo());
    assert!(!session.can_redo());
}

#[test]
fn new_task_clears_redo() {
    let mut session = open_memory();
    session.begin_task("u1", "r1").unwrap();
    session.create("LexEntry").unwrap();
    session.end_task().unwrap();
    session.undo().unwrap();
    assert_eq!(session.redo_count(), 1);

    session.begin_task("u2", "r2").unwrap();
    session.create("LexEntry").unwrap();
    session.end_task().unwrap();
    assert_eq!(session.redo_count(), 0);
    assert_eq!(session.undo_label(), Some("u2"));
}

#[test]
fn undo_history_is_bounded_by_configured_depth() {
    let config = EngineConfig {
        undo_depth: 2,
        ..EngineConfig::default()
    };
    let mut session = Session::open(&BackendDescriptor::Memory, config).unwrap();
    for label in ["one", "two", "three"] {
        session.begin_task(label, label).unwrap();
        session.create("LexEntry").unwrap();
        session.end_task().unwrap();
    }
    assert_eq!(session.undo_count(), 2);
    session.undo().unwrap();
    session.undo().unwrap();
    assert!(!session.can_undo());
    assert_eq!(session.object_count(), 1);
}

#[test]
fn unwind_reverts_only_the_inner_frames() {
    let mut session = open_memory();
    let homograph = field(&session, "LexEntry", "HomographNumber");

    session.begin_task("u", "r").unwrap();
    let entry = session.create("LexEntry").unwrap();
    session.begin_nested_task("inner", "inner").unwrap();
    session
        .set_scalar(entry, homograph, Some(ScalarValue::Integer(7)))
        .unwrap();
    let doomed = session.create("LexEntry").unwrap();
    session.unwind_to(1).unwrap();

    assert_eq!(session.depth(), 1);
    assert_eq!(session.scalar(entry, homograph).unwrap(), None);
    assert!(!session.exists(doomed));
    assert!(session.exists(entry));
    session.end_task().unwrap();
    assert_eq!(session.stored_object_count().unwrap(), 1);
}

#[test]
fn do_somehow_rolls_back_its_own_task_on_error() {
    let mut session = open_memory();
    let result: SessionResult<()> = session.do_somehow("u", "r", |session| {
        session.create("LexEntry")?;
        Err(SessionError::NothingToUndo)
    });

    assert!(result.is_err());
    assert_eq!(session.depth(), 0);
    assert_eq!(session.object_count(), 0);
    assert_eq!(session.undo_count(), 0);
    assert_eq!(session.stored_object_count().unwrap(), 0);
}

#[test]
fn do_somehow_joins_an_open_task() {
    let mut session = open_memory();
    session.begin_task("outer", "outer").unwrap();
    session
        .do_somehow("inner", "inner", |session| session.create("LexEntry"))
        .unwrap();
    assert_eq!(session.depth(), 1);
    session.end_task().unwrap();
    assert_eq!(session.undo_count(), 1);
    assert_eq!(session.undo_label(), Some("outer"));
}

#[test]
fn non_undoable_work_commits_without_history() {
    let mut session = open_memory();
    session
        .do_somehow_non_undoable(|session| session.create("LexEntry"))
        .unwrap();
    assert_eq!(session.undo_count(), 0);
    assert_eq!(session.stored_object_count().unwrap(), 1);
}

struct Recorder {
    changes: RefCell<Vec<PropChanged>>,
}

impl ChangeListener for Recorder {
    fn prop_changed(&self, _session: &mut Session, change: &PropChanged) -> SessionResult<()> {
        self.changes.borrow_mut().push(*change);
        Ok(())
    }
}

#[test]
fn listeners_see_vector_positions() {
    let mut session = open_memory();
    let components = field(&session, "LexEntry", "ComplexFormComponents");
    let recorder = Rc::new(Recorder {
        changes: RefCell::new(Vec::new()),
    });
    session.add_listener(recorder.clone());

    session.begin_task("u", "r").unwrap();
    let entry = session.create("LexEntry").unwrap();
    let a = session.create("LexEntry").unwrap();
    let b = session.create("LexEntry").unwrap();
    session.insert_reference(entry, components, None, a).unwrap();
    session.insert_reference(entry, components, Some(0), b).unwrap();
    session.end_task().unwrap();

    let changes = recorder.changes.borrow().clone();
    assert_eq!(changes.len(), 2);
    assert_eq!((changes[1].index, changes[1].inserted, changes[1].deleted), (0, 1, 0));
    assert_eq!(session.targets(entry, components).unwrap(), vec![b, a]);

    recorder.changes.borrow_mut().clear();
    session.undo().unwrap();
    let undone = recorder.changes.borrow().clone();
    assert_eq!((undone[0].index, undone[0].inserted, undone[0].deleted), (0, 0, 1));
}

/// Hides entries with a homograph number above one.
struct HidesHomographs {
    homograph: FieldId,
    hidden: FieldId,
}

impl ChangeListener for HidesHomographs {
    fn prop_changed(&self, session: &mut Session, change: &PropChanged) -> SessionResult<()> {
        if change.field != self.homograph {
            return Ok(());
        }
        let hide = matches!(
            session.scalar(change.object, self.homograph)?,
            Some(ScalarValue::Integer(n)) if n > 1
        );
        let value = hide.then_some(ScalarValue::Boolean(true));
        session.do_somehow("u", "r", |session| {
            session.set_scalar(change.object, self.hidden, value)
        })
    }
}

#[test]
fn listener_writes_join_the_task_and_replays_stay_off_the_stacks() {
    let mut session = open_memory();
    let homograph = field(&session, "LexEntry", "HomographNumber");
    let hidden = field(&session, "LexEntry", "DoNotPublish");
    session.add_listener(Rc::new(HidesHomographs { homograph, hidden }));

    session.begin_task("u", "r").unwrap();
    let entry = session.create("LexEntry").unwrap();
    session
        .set_scalar(entry, homograph, Some(ScalarValue::Integer(2)))
        .unwrap();
    session.end_task().unwrap();
    assert_eq!(
        session.scalar(entry, hidden).unwrap(),
        Some(ScalarValue::Boolean(true))
    );
    assert_eq!(session.undo_count(), 1);

    session.begin_task("u", "r").unwrap();
    session
        .set_scalar(entry, homograph, Some(ScalarValue::Integer(1)))
        .unwrap();
    session.end_task().unwrap();
    assert_eq!(session.scalar(entry, hidden).unwrap(), None);

    session.undo().unwrap();
    assert_eq!(
        session.scalar(entry, hidden).unwrap(),
        Some(ScalarValue::Boolean(true))
    );
    assert_eq!((session.undo_count(), session.redo_count()), (1, 1));
    assert!(!session.has_pending_changes());
}

/// Tags an entry with a dialect whenever it gains a homograph number.
struct TagsHomographs {
    homograph: FieldId,
    dialects: FieldId,
    dialect: Handle,
    rejected: Cell<usize>,
}

impl ChangeListener for TagsHomographs {
    fn prop_changed(&self, session: &mut Session, change: &PropChanged) -> SessionResult<()> {
        if change.field != self.homograph {
            return Ok(());
        }
        if session.scalar(change.object, self.homograph)?.is_none() {
            return Ok(());
        }
        match session.insert_reference(change.object, self.dialects, None, self.dialect) {
            Err(SessionError::ReplayInProgress) => {
                self.rejected.set(self.rejected.get() + 1);
                Ok(())
            }
            other => other,
        }
    }
}

#[test]
fn listener_side_effects_replay_exactly_once() {
    let mut session = open_memory();
    let homograph = field(&session, "LexEntry", "HomographNumber");
    let dialects = field(&session, "LexEntry", "DialectLabels");

    session.begin_task("u", "r").unwrap();
    let entry = session.create("LexEntry").unwrap();
    let dialect = session.create("CmPossibility").unwrap();
    session.end_task().unwrap();

    let listener = Rc::new(TagsHomographs {
        homograph,
        dialects,
        dialect,
        rejected: Cell::new(0),
    });
    session.add_listener(listener.clone());

    session.begin_task("Undo number", "Redo number").unwrap();
    session
        .set_scalar(entry, homograph, Some(ScalarValue::Integer(1)))
        .unwrap();
    session.end_task().unwrap();
    assert_eq!(session.targets(entry, dialects).unwrap(), vec![dialect]);
    assert_eq!(session.undo_count(), 2);

    for round in 1..=2 {
        session.undo().unwrap();
        assert_eq!(session.scalar(entry, homograph).unwrap(), None);
        assert!(session.targets(entry, dialects).unwrap().is_empty());
        assert_eq!((session.undo_count(), session.redo_count()), (1, 1));

        session.redo().unwrap();
        assert_eq!(
            session.scalar(entry, homograph).unwrap(),
            Some(ScalarValue::Integer(1))
        );
        assert_eq!(session.targets(entry, dialects).unwrap(), vec![dialect]);
        assert_eq!((session.undo_count(), session.redo_count()), (2, 0));
        assert_eq!(listener.rejected.get(), round);
        assert!(!session.has_pending_changes());
        assert!(!session.is_replaying());
    }
}

#[test]
fn gathered_sets_are_disjoint_and_drained() {
    let mut session = open_memory();
    let homograph = field(&session, "LexEntry", "HomographNumber");

    session.begin_task("u", "r").unwrap();
    let a = session.create("LexEntry").unwrap();
    let b = session.create("LexEntry").unwrap();
    session.end_task().unwrap();
    let first = session.gather_changes();
    let a_id = session.id_of(a).unwrap();
    let b_id = session.id_of(b).unwrap();
    assert_eq!(first.new_objects, BTreeSet::from([a_id, b_id]));
    assert!(first.dirty_objects.is_empty());

    session.begin_task("u", "r").unwrap();
    session
        .set_scalar(a, homograph, Some(ScalarValue::Integer(3)))
        .unwrap();
    let c = session.create("LexEntry").unwrap();
    session
        .set_scalar(c, homograph, Some(ScalarValue::Integer(4)))
        .unwrap();
    session.delete(b).unwrap();
    let d = session.create("LexEntry").unwrap();
    session.delete(d).unwrap();
    session.end_task().unwrap();

    let second = session.gather_changes();
    assert_eq!(second.new_objects, BTreeSet::from([session.id_of(c).unwrap()]));
    assert_eq!(second.dirty_objects, BTreeSet::from([a_id]));
    assert_eq!(second.deleted_objects, BTreeSet::from([b_id]));
    assert!(second.new_objects.is_disjoint(&second.dirty_objects));
    assert!(second.dirty_objects.is_disjoint(&second.deleted_objects));
    assert!(second.new_objects.is_disjoint(&second.deleted_objects));

    assert_eq!(session.gather_changes(), Default::default());
}

struct FlakyBackend {
    inner: MemoryBackend,
    failing: Rc<Cell<bool>>,
}

impl Backend for FlakyBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::Memory
    }

    fn load_domain(&self, domain: &LoadDomain) -> BackendResult<Vec<BackendRecord>> {
        self.inner.load_domain(domain)
    }

    fn load_custom_fields(&self) -> BackendResult<Vec<CustomFieldDef>> {
        self.inner.load_custom_fields()
    }

    fn commit(&mut self, changes: &ChangeSet) -> BackendResult<()> {
        if self.failing.get() {
            return Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unplugged",
            )));
        }
        self.inner.commit(changes)
    }

    fn object_count(&self) -> BackendResult<usize> {
        self.inner.object_count()
    }
}

#[test]
fn failed_commit_keeps_changes_pending_until_retry() {
    let failing = Rc::new(Cell::new(true));
    let backend = FlakyBackend {
        inner: MemoryBackend::new(),
        failing: failing.clone(),
    };
    let mut session = Session::with_backend(
        Box::new(backend),
        MetaCatalog::builtin(),
        EngineConfig::default(),
    )
    .unwrap();

    session.begin_task("u", "r").unwrap();
    let entry = session.create("LexEntry").unwrap();
    let err = session.end_task().unwrap_err();
    assert!(matches!(err, SessionError::Backend(BackendError::Io(_))));
    assert!(session.has_pending_changes());
    assert!(session.exists(entry));
    assert_eq!(session.stored_object_count().unwrap(), 0);

    failing.set(false);
    session.commit_pending().unwrap();
    assert!(!session.has_pending_changes());
    assert_eq!(session.stored_object_count().unwrap(), 1);
}
