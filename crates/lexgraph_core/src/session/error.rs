use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{CatalogError, FieldId};
use crate::serial::SerialError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors from session operations.
///
/// Sequencing and integrity errors are raised before any mutation, so the
/// graph is unchanged when they are returned.
#[derive(Debug)]
pub enum SessionError {
    /// Mutation or `end_task` without an open frame.
    NoActiveTask,
    /// Top-level `begin_task` while a task is open.
    TaskAlreadyActive,
    /// Undo, redo or migration requested while a task is open.
    TaskInProgress,
    /// Mutation attempted while undo, redo or an unwind replays actions.
    ReplayInProgress,
    NothingToUndo,
    NothingToRedo,
    UnknownHandle(Handle),
    UnknownObject(ObjectId),
    ObjectDeleted(ObjectId),
    OwnershipCycle {
        object: ObjectId,
        owner: ObjectId,
    },
    FieldKindMismatch {
        field: String,
        expected: &'static str,
    },
    ClassMismatch {
        field: String,
        expected: String,
        found: String,
    },
    FieldNotOnClass {
        field: FieldId,
        class: String,
    },
    IndexOutOfRange {
        index: usize,
        len: usize,
    },
    Catalog(CatalogError),
    Serial(SerialError),
    Backend(BackendError),
    Config(ConfigError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoActiveTask => write!(f, "no unit of work is active"),
            Self::TaskAlreadyActive => write!(f, "a top-level unit of work is already active"),
            Self::TaskInProgress => write!(f, "operation not allowed while a unit of work is active"),
            Self::ReplayInProgress => {
                write!(f, "objects cannot be changed while logged actions are replayed")
            }
            Self::NothingToUndo => write!(f, "nothing to undo"),
            Self::NothingToRedo => write!(f, "nothing to redo"),
            Self::UnknownHandle(handle) => write!(f, "unknown object handle {handle}"),
            Self::UnknownObject(id) => write!(f, "object {id} is not registered in this session"),
            Self::ObjectDeleted(id) => write!(f, "object {id} has been deleted"),
            Self::OwnershipCycle { object, owner } => write!(
                f,
                "making {owner} the owner of {object} would create an ownership cycle"
            ),
            Self::FieldKindMismatch { field, expected } => {
                write!(f, "field `{field}` is not {expected}")
            }
            Self::ClassMismatch {
                field,
                expected,
                found,
            } => write!(f, "field `{field}` expects `{expected}`, got `{found}`"),
            Self::FieldNotOnClass { field, class } => {
                write!(f, "field {field} does not belong to class `{class}`")
            }
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} is out of range for length {len}")
            }
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Serial(err) => write!(f, "{err}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Catalog(err) => Some(err),
            Self::Serial(err) => Some(err),
            Self::Backend(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CatalogError> for SessionError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<SerialError> for SessionError {
    fn from(value: SerialError) -> Self {
        Self::Serial(value)
    }
}

impl From<BackendError> for SessionError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}
