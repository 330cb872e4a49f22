//! SQLite-backed record store and the single-file backend over it.
//!
//! # Responsibility
//! - Keep one row per object (`objects`) plus custom-field declarations.
//! - Apply change sets inside one SQLite transaction.
//!
//! # Invariants
//! - Connections are migrated and checked ready before use.
//! - Loads return records ascending by guid.

use super::{Backend, BackendDescriptor, BackendError, BackendRecord, BackendResult, ChangeSet, LoadDomain};
use crate::db::{ensure_store_connection_ready, open_db, open_db_in_memory};
use crate::model::id::ObjectId;
use crate::model::meta::CustomFieldDef;
use crate::serial::custom_fields::{custom_fields_element, parse_custom_fields, BLOCK_ELEMENT};
use crate::serial::{parse_element, write_element, Element};
use log::{error, info};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// `repository_meta` key holding the crate version of the last committer.
pub const LAST_WRITER_KEY: &str = "last_writer_version";

/// Record rows over one migrated SQLite connection.
#[derive(Debug)]
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        Self::from_connection(open_db(path)?)
    }

    pub fn in_memory() -> BackendResult<Self> {
        Self::from_connection(open_db_in_memory()?)
    }

    fn from_connection(conn: Connection) -> BackendResult<Self> {
        ensure_store_connection_ready(&conn)?;
        Ok(Self { conn })
    }

    pub fn load(&self, domain: &LoadDomain) -> BackendResult<Vec<BackendRecord>> {
        let mut records = Vec::new();
        match domain.class_names() {
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT guid, class, owner_guid, xml
                     FROM objects
                     ORDER BY guid ASC;",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    records.push(record_from_row(row)?);
                }
            }
            Some(classes) if classes.is_empty() => {}
            Some(classes) => {
                let placeholders = vec!["?"; classes.len()].join(", ");
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT guid, class, owner_guid, xml
                     FROM objects
                     WHERE class IN ({placeholders})
                     ORDER BY guid ASC;"
                ))?;
                let mut rows = stmt.query(params_from_iter(classes.iter()))?;
                while let Some(row) = rows.next()? {
                    records.push(record_from_row(row)?);
                }
            }
        }
        Ok(records)
    }

    pub fn load_custom_fields(&self) -> BackendResult<Vec<CustomFieldDef>> {
        let mut stmt = self.conn.prepare(
            "SELECT xml
             FROM custom_fields
             ORDER BY class ASC, name ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut block = Element::new(BLOCK_ELEMENT);
        while let Some(row) = rows.next()? {
            let xml: String = row.get(0)?;
            block.children.push(parse_element(&xml)?);
        }
        Ok(parse_custom_fields(&block)?)
    }

    pub fn commit(&mut self, changes: &ChangeSet) -> BackendResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for id in &changes.deletes {
            tx.execute("DELETE FROM objects WHERE guid = ?1;", [id.to_canonical_string()])?;
        }
        for record in &changes.upserts {
            tx.execute(
                "INSERT INTO objects (guid, class, owner_guid, xml)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(guid) DO UPDATE SET
                    class = excluded.class,
                    owner_guid = excluded.owner_guid,
                    xml = excluded.xml;",
                params![
                    record.id.to_canonical_string(),
                    record.class,
                    record.owner.map(|owner| owner.to_canonical_string()),
                    record.xml
                ],
            )?;
        }
        if let Some(defs) = &changes.custom_fields {
            tx.execute("DELETE FROM custom_fields;", [])?;
            for def in defs {
                let Some(block) = custom_fields_element(std::slice::from_ref(def)) else {
                    continue;
                };
                for entry in &block.children {
                    tx.execute(
                        "INSERT INTO custom_fields (class, name, xml) VALUES (?1, ?2, ?3);",
                        params![def.class, def.name, write_element(entry)?],
                    )?;
                }
            }
        }
        tx.execute(
            "INSERT INTO repository_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![LAST_WRITER_KEY, crate::core_version()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn object_count(&self) -> BackendResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects;", [], |row| row.get(0))?;
        usize::try_from(count)
            .map_err(|_| BackendError::InvalidData(format!("negative object count {count}")))
    }

    pub fn meta_value(&self, key: &str) -> BackendResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM repository_meta WHERE key = ?1;",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn record_from_row(row: &Row<'_>) -> BackendResult<BackendRecord> {
    let guid: String = row.get(0)?;
    let class: String = row.get(1)?;
    let owner: Option<String> = row.get(2)?;
    let xml: String = row.get(3)?;
    Ok(BackendRecord {
        id: parse_guid(&guid, "objects.guid")?,
        class,
        owner: owner
            .map(|value| parse_guid(&value, "objects.owner_guid"))
            .transpose()?,
        xml,
    })
}

fn parse_guid(value: &str, column: &str) -> BackendResult<ObjectId> {
    ObjectId::parse(value)
        .map_err(|_| BackendError::InvalidData(format!("invalid guid `{value}` in {column}")))
}

/// Single-file backend: one SQLite database per repository.
#[derive(Debug)]
pub struct SingleFileBackend {
    path: PathBuf,
    store: SqliteRecordStore,
}

impl SingleFileBackend {
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store = SqliteRecordStore::open(&path)?;
        Ok(Self { path, store })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for SingleFileBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::SingleFile {
            path: self.path.clone(),
        }
    }

    fn load_domain(&self, domain: &LoadDomain) -> BackendResult<Vec<BackendRecord>> {
        self.store.load(domain)
    }

    fn load_custom_fields(&self) -> BackendResult<Vec<CustomFieldDef>> {
        self.store.load_custom_fields()
    }

    fn commit(&mut self, changes: &ChangeSet) -> BackendResult<()> {
        let started_at = Instant::now();
        match self.store.commit(changes) {
            Ok(()) => {
                info!(
                    "event=backend_commit module=backend status=ok kind=single_file upserts={} deletes={} duration_ms={}",
                    changes.upserts.len(),
                    changes.deletes.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=backend_commit module=backend status=error kind=single_file duration_ms={} error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn object_count(&self) -> BackendResult<usize> {
        self.store.object_count()
    }
}

#[cfg(test)]
mod tests {
    use super::{SqliteRecordStore, LAST_WRITER_KEY};
    use crate::backend::{BackendRecord, ChangeSet, LoadDomain};
    use crate::model::id::ObjectId;
    use crate::model::meta::{CustomFieldDef, FieldKind};

    fn record(class: &str) -> BackendRecord {
        let id = ObjectId::new();
        BackendRecord {
            id,
            class: class.to_string(),
            owner: None,
            xml: format!(r#"<rt class="{class}" guid="{id}"/>"#),
        }
    }

    #[test]
    fn commit_then_load_by_domain() {
        let mut store = SqliteRecordStore::in_memory().unwrap();
        let entry = record("LexEntry");
        let text = record("Text");
        store
            .commit(&ChangeSet {
                upserts: vec![entry.clone(), text.clone()],
                ..ChangeSet::default()
            })
            .unwrap();

        assert_eq!(store.object_count().unwrap(), 2);
        assert_eq!(store.load(&LoadDomain::Lexicon).unwrap(), vec![entry.clone()]);

        store
            .commit(&ChangeSet {
                deletes: vec![entry.id],
                ..ChangeSet::default()
            })
            .unwrap();
        assert_eq!(store.load(&LoadDomain::Everything).unwrap(), vec![text]);
    }

    #[test]
    fn custom_fields_round_trip_through_rows() {
        let mut store = SqliteRecordStore::in_memory().unwrap();
        let mut reference = CustomFieldDef::new("LexSense", "Register", FieldKind::ReferenceAtomic);
        reference.dest_class = Some("CmPossibility".to_string());
        let note = CustomFieldDef::new("LexEntry", "Note", FieldKind::MultiString);
        store
            .commit(&ChangeSet {
                custom_fields: Some(vec![reference.clone(), note.clone()]),
                ..ChangeSet::default()
            })
            .unwrap();

        assert_eq!(store.load_custom_fields().unwrap(), vec![note, reference]);
    }

    #[test]
    fn commit_records_last_writer_version() {
        let mut store = SqliteRecordStore::in_memory().unwrap();
        assert_eq!(store.meta_value(LAST_WRITER_KEY).unwrap(), None);
        store.commit(&ChangeSet::default()).unwrap();
        assert_eq!(
            store.meta_value(LAST_WRITER_KEY).unwrap().as_deref(),
            Some(crate::core_version())
        );
    }
}
