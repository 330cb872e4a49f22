use lexgraph_core::{
    BackendDescriptor, BackendError, ClientInfo, CustomFieldDef, EngineConfig, FieldKind,
    LoadDomain, ScalarType, ScalarValue, Session, SessionError, StoreServer,
};
use std::path::PathBuf;
use std::sync::Arc;

fn single_file(path: PathBuf) -> BackendDescriptor {
    BackendDescriptor::SingleFile { path }
}

fn multi_user(server: &Arc<StoreServer>, project: &str, client: &str) -> BackendDescriptor {
    BackendDescriptor::MultiUser {
        server: Arc::clone(server),
        project: project.to_string(),
        client: ClientInfo::local(client),
    }
}

/// Memory session holding a small lexicon with one custom field.
fn populated_memory_session() -> Session {
    let mut session = Session::open(&BackendDescriptor::Memory, EngineConfig::default()).unwrap();
    let register = session
        .add_custom_field(&CustomFieldDef::new(
            "LexEntry",
            "Register",
            FieldKind::Scalar(ScalarType::Unicode),
        ))
        .unwrap();
    let lexdb_field = session.field_id("LangProject", "LexDb").unwrap();
    let entries = session.field_id("LexDb", "Entries").unwrap();
    let citation = session.field_id("LexEntry", "CitationForm").unwrap();
    let senses = session.field_id("LexEntry", "Senses").unwrap();
    let gloss = session.field_id("LexSense", "Gloss").unwrap();
    let components = session.field_id("LexEntry", "ComplexFormComponents").unwrap();

    session.begin_task("Undo build", "Redo build").unwrap();
    let project = session.create("LangProject").unwrap();
    let lexdb = session.create_owned("LexDb", project, lexdb_field, None).unwrap();
    let cat = session.create_owned("LexEntry", lexdb, entries, None).unwrap();
    let catnip = session.create_owned("LexEntry", lexdb, entries, None).unwrap();
    session.set_multi(cat, citation, "en", Some("cat")).unwrap();
    session.set_multi(cat, citation, "fr", Some("chat & co")).unwrap();
    session.set_multi(catnip, citation, "en", Some("catnip")).unwrap();
    session
        .set_scalar(cat, register, Some(ScalarValue::Unicode("informal".to_string())))
        .unwrap();
    session.insert_reference(catnip, components, None, cat).unwrap();
    let sense = session.create_owned("LexSense", cat, senses, None).unwrap();
    session.set_multi(sense, gloss, "en", Some("feline")).unwrap();
    session.end_task().unwrap();
    session
}

#[test]
fn migration_between_backends_preserves_the_export_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lexicon.lexgraph");
    let memory = populated_memory_session();
    let expected = memory.export_document_string().unwrap();

    let file_session = memory.migrate_to(&single_file(path.clone())).unwrap();
    assert_eq!(file_session.export_document_string().unwrap(), expected);
    drop(file_session);

    let reopened = Session::open(&single_file(path.clone()), EngineConfig::default()).unwrap();
    assert_eq!(reopened.object_count(), memory.object_count());
    assert_eq!(reopened.export_document_string().unwrap(), expected);

    let server = Arc::new(StoreServer::in_memory());
    server.create_project("lexicon").unwrap();
    assert!(server.start_project("lexicon").unwrap());
    let shared = reopened
        .migrate_to(&multi_user(&server, "lexicon", "migrator"))
        .unwrap();
    assert_eq!(shared.export_document_string().unwrap(), expected);

    let back = shared.migrate_to(&BackendDescriptor::Memory).unwrap();
    assert_eq!(back.export_document_string().unwrap(), expected);
}

#[test]
fn cold_migration_copies_stored_records_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.lexgraph");
    let target = dir.path().join("target.lexgraph");
    let expected = {
        let memory = populated_memory_session();
        let file_session = memory.migrate_to(&single_file(source.clone())).unwrap();
        file_session.export_document_string().unwrap()
    };

    let migrated = lexgraph_core::migrate(
        &single_file(source),
        &single_file(target.clone()),
        &EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(migrated.export_document_string().unwrap(), expected);
    assert!(migrated.field_id("LexEntry", "Register").is_ok());
    assert!(!migrated.has_pending_changes());
}

#[test]
fn migration_refuses_a_non_empty_target() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taken.lexgraph");
    let memory = populated_memory_session();
    drop(memory.migrate_to(&single_file(path.clone())).unwrap());

    let err = memory.migrate_to(&single_file(path)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Backend(BackendError::TargetNotEmpty { objects: 5 })
    ));
}

#[test]
fn startup_domain_limits_what_is_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("domain.lexgraph");
    drop(
        populated_memory_session()
            .migrate_to(&single_file(path.clone()))
            .unwrap(),
    );

    let config = EngineConfig {
        startup_domain: LoadDomain::Classes(vec!["LexSense".to_string()]),
        ..EngineConfig::default()
    };
    let mut session = Session::open(&single_file(path), config).unwrap();
    let senses = session.objects_of_class("LexSense").unwrap();
    let entries = session.objects_of_class("LexEntry").unwrap();
    assert_eq!((senses.len(), entries.len()), (1, 2));
    assert!(session.is_materialized(senses[0]));
    assert!(!session.is_materialized(entries[0]));

    let loaded = session.load_domain(&LoadDomain::Lexicon).unwrap();
    assert_eq!(loaded, 4);
    assert!(entries.iter().all(|entry| session.is_materialized(*entry)));
}

#[test]
fn custom_field_collision_renames_the_older_field_and_keeps_its_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("collide.lexgraph");
    let mut session = Session::open(&single_file(path.clone()), EngineConfig::default()).unwrap();
    let usage = session
        .add_custom_field(&CustomFieldDef::new(
            "LexSense",
            "UsageNote",
            FieldKind::Scalar(ScalarType::Unicode),
        ))
        .unwrap();
    for (name, kind) in [
        ("UsageNote0", FieldKind::Scalar(ScalarType::Integer)),
        ("UsageNote3", FieldKind::Scalar(ScalarType::Boolean)),
    ] {
        session
            .add_custom_field(&CustomFieldDef::new("LexSense", name, kind))
            .unwrap();
    }
    session.begin_task("u", "r").unwrap();
    let sense = session.create("LexSense").unwrap();
    session
        .set_scalar(sense, usage, Some(ScalarValue::Unicode("formal".to_string())))
        .unwrap();
    session.end_task().unwrap();
    let sense_id = session.id_of(sense).unwrap();
    drop(session);

    let mut session = Session::open(&single_file(path.clone()), EngineConfig::default()).unwrap();
    let renames = session
        .merge_custom_fields(&[CustomFieldDef::new(
            "LexSense",
            "UsageNote",
            FieldKind::MultiString,
        )])
        .unwrap();
    assert_eq!(renames.len(), 1);
    assert_eq!(renames[0].old_name, "UsageNote");
    assert_eq!(renames[0].new_name, "UsageNote1");
    drop(session);

    let session = Session::open(&single_file(path), EngineConfig::default()).unwrap();
    let sense = session.handle_of(sense_id).unwrap();
    let renamed = session.field_id("LexSense", "UsageNote1").unwrap();
    assert_eq!(
        session.scalar(sense, renamed).unwrap(),
        Some(ScalarValue::Unicode("formal".to_string()))
    );
    let incoming = session.field_id("LexSense", "UsageNote").unwrap();
    assert_eq!(
        session.catalog().field(incoming).unwrap().kind,
        FieldKind::MultiString
    );
    assert_eq!(session.multi(sense, incoming, "en").unwrap(), None);
}

#[test]
fn merging_an_identical_declaration_is_a_no_op() {
    let mut session = Session::open(&BackendDescriptor::Memory, EngineConfig::default()).unwrap();
    let def = CustomFieldDef::new("LexEntry", "Register", FieldKind::MultiString);
    session.add_custom_field(&def).unwrap();
    assert!(session.merge_custom_fields(&[def]).unwrap().is_empty());
    assert!(!session.has_pending_changes());
    assert!(matches!(
        session.add_custom_field(&CustomFieldDef::new(
            "LexEntry",
            "Register",
            FieldKind::MultiString
        )),
        Err(SessionError::Catalog(_))
    ));
}

#[test]
fn shared_project_clients_see_each_others_commits() {
    let server = Arc::new(StoreServer::in_memory());
    server.create_project("shared").unwrap();
    server.start_project("shared").unwrap();

    let mut alice = Session::open(&multi_user(&server, "shared", "alice"), EngineConfig::default())
        .unwrap();
    let mut bob =
        Session::open(&multi_user(&server, "shared", "bob"), EngineConfig::default()).unwrap();
    assert_eq!(server.connected_clients(Some("shared")).unwrap().len(), 2);

    alice.begin_task("u", "r").unwrap();
    let entry = alice.create("LexEntry").unwrap();
    alice.end_task().unwrap();
    let id = alice.id_of(entry).unwrap();

    assert_eq!(bob.handle_of(id), None);
    bob.load_domain(&LoadDomain::Everything).unwrap();
    assert!(bob.handle_of(id).is_some());

    assert!(matches!(
        server.stop_project("shared"),
        Err(BackendError::StoreBusy { clients: 2, .. })
    ));
    drop(alice);
    drop(bob);
    assert!(server.connected_clients(None).unwrap().is_empty());
    assert!(server.stop_project("shared").unwrap());
    assert!(matches!(
        Session::open(&multi_user(&server, "shared", "carol"), EngineConfig::default()),
        Err(SessionError::Backend(BackendError::StoreNotRunning(_)))
    ));
}

#[test]
fn remote_clients_need_sharing_enabled() {
    let server = Arc::new(StoreServer::in_memory());
    server.create_project("shared").unwrap();
    server.start_project("shared").unwrap();
    let remote = BackendDescriptor::MultiUser {
        server: Arc::clone(&server),
        project: "shared".to_string(),
        client: ClientInfo::remote("field-laptop"),
    };

    assert!(matches!(
        Session::open(&remote, EngineConfig::default()),
        Err(SessionError::Backend(BackendError::SharingDisabled))
    ));
    server.set_sharing_enabled(true).unwrap();
    let session = Session::open(&remote, EngineConfig::default()).unwrap();
    assert!(server.set_sharing_enabled(false).is_err());
    drop(session);
    server.set_sharing_enabled(false).unwrap();
}

#[test]
fn directory_server_reopens_existing_projects() {
    let dir = tempfile::tempdir().unwrap();
    let expected = {
        let server = Arc::new(StoreServer::open_dir(dir.path()).unwrap());
        server.create_project("kept").unwrap();
        server.start_project("kept").unwrap();
        let session = populated_memory_session()
            .migrate_to(&multi_user(&server, "kept", "loader"))
            .unwrap();
        session.export_document_string().unwrap()
    };

    let server = Arc::new(StoreServer::open_dir(dir.path()).unwrap());
    assert_eq!(server.list_projects().unwrap(), vec!["kept".to_string()]);
    assert!(!server.is_running("kept").unwrap());
    server.start_project("kept").unwrap();
    let session = Session::open(&multi_user(&server, "kept", "reader"), EngineConfig::default())
        .unwrap();
    assert_eq!(session.export_document_string().unwrap(), expected);
}
