//! Pluggable record stores behind one capability trait.
//!
//! # Responsibility
//! - Define the `Backend` contract sessions persist through.
//! - Select a concrete store from a `BackendDescriptor` value.
//!
//! # Invariants
//! - `commit` applies a whole change set or none of it.
//! - Stores hold canonical record text and never interpret it beyond the
//!   record header.

pub mod memory;
pub mod multi_user;
pub mod record;
pub mod sqlite_file;

pub use memory::MemoryBackend;
pub use multi_user::{ClientInfo, ClientLocation, ConnectedClient, MultiUserBackend, StoreServer};
pub use record::BackendRecord;
pub use sqlite_file::{SingleFileBackend, SqliteRecordStore};

use crate::db::DbError;
use crate::model::id::ObjectId;
use crate::model::meta::CustomFieldDef;
use crate::serial::SerialError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

pub type BackendResult<T> = Result<T, BackendError>;

/// Store selection, resolved once when a session opens.
#[derive(Debug, Clone)]
pub enum BackendDescriptor {
    SingleFile {
        path: PathBuf,
    },
    Memory,
    MultiUser {
        server: Arc<StoreServer>,
        project: String,
        client: ClientInfo,
    },
}

impl BackendDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SingleFile { .. } => "single_file",
            Self::Memory => "memory",
            Self::MultiUser { .. } => "multi_user",
        }
    }
}

/// Subset of the repository a load should materialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadDomain {
    #[default]
    Everything,
    Lexicon,
    Lists,
    Texts,
    Phonology,
    Classes(Vec<String>),
}

const LEXICON_CLASSES: &[&str] = &["LangProject", "LexDb", "LexEntry", "LexSense", "LexExampleSentence"];
const LIST_CLASSES: &[&str] = &["LangProject", "CmPossibilityList", "CmPossibility"];
const TEXT_CLASSES: &[&str] = &["LangProject", "Text"];
const PHONOLOGY_CLASSES: &[&str] = &["LangProject", "PhEnvironment"];

impl LoadDomain {
    /// Class names in the domain; `None` means every class. Named domains
    /// always include the project root.
    pub fn class_names(&self) -> Option<Vec<String>> {
        let names: &[&str] = match self {
            Self::Everything => return None,
            Self::Classes(classes) => return Some(classes.clone()),
            Self::Lexicon => LEXICON_CLASSES,
            Self::Lists => LIST_CLASSES,
            Self::Texts => TEXT_CLASSES,
            Self::Phonology => PHONOLOGY_CLASSES,
        };
        Some(names.iter().map(|name| (*name).to_string()).collect())
    }

    pub fn includes(&self, class: &str) -> bool {
        match self.class_names() {
            None => true,
            Some(names) => names.iter().any(|name| name == class),
        }
    }
}

/// Everything one outermost task changed, in store terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// New and modified objects, as canonical records.
    pub upserts: Vec<BackendRecord>,
    pub deletes: Vec<ObjectId>,
    /// Full replacement of the custom-field declarations, when changed.
    pub custom_fields: Option<Vec<CustomFieldDef>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.custom_fields.is_none()
    }
}

/// Capability set every store variant provides.
pub trait Backend {
    fn descriptor(&self) -> BackendDescriptor;

    /// Records of the requested domain, ascending by guid.
    fn load_domain(&self, domain: &LoadDomain) -> BackendResult<Vec<BackendRecord>>;

    fn load_custom_fields(&self) -> BackendResult<Vec<CustomFieldDef>>;

    /// Applies the change set atomically.
    fn commit(&mut self, changes: &ChangeSet) -> BackendResult<()>;

    fn object_count(&self) -> BackendResult<usize>;
}

/// Opens the store a descriptor names.
pub fn open_backend(descriptor: &BackendDescriptor) -> BackendResult<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match descriptor {
        BackendDescriptor::SingleFile { path } => Box::new(SingleFileBackend::open(path)?),
        BackendDescriptor::Memory => Box::new(MemoryBackend::new()),
        BackendDescriptor::MultiUser {
            server,
            project,
            client,
        } => Box::new(StoreServer::connect(server, project, client.clone())?),
    };
    Ok(backend)
}

#[derive(Debug)]
pub enum BackendError {
    StoreNotFound(String),
    StoreBusy {
        project: String,
        clients: usize,
    },
    StoreNotRunning(String),
    ProjectExists(String),
    /// Remote connections are refused while sharing is off.
    SharingDisabled,
    TargetNotEmpty {
        objects: usize,
    },
    Db(DbError),
    Io(std::io::Error),
    Serial(SerialError),
    InvalidData(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreNotFound(project) => write!(f, "project store `{project}` not found"),
            Self::StoreBusy { project, clients } => write!(
                f,
                "project store `{project}` has {clients} connected client(s)"
            ),
            Self::StoreNotRunning(project) => {
                write!(f, "project store `{project}` is not running")
            }
            Self::ProjectExists(project) => {
                write!(f, "project store `{project}` already exists")
            }
            Self::SharingDisabled => write!(f, "project sharing is disabled"),
            Self::TargetNotEmpty { objects } => {
                write!(f, "migration target already holds {objects} object(s)")
            }
            Self::Db(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Serial(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid store data: {message}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Serial(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for BackendError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<SerialError> for BackendError {
    fn from(value: SerialError) -> Self {
        Self::Serial(value)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
