//! Transactional object-graph persistence for linguistic repositories.
//!
//! A `Session` owns an identity-mapped graph of domain objects loaded from a
//! pluggable `Backend`. Mutations run inside task frames that support
//! undo/redo, change notification and referential-integrity maintenance,
//! and every finished task commits atomically.

pub mod backend;
pub mod config;
pub mod db;
pub mod graph;
pub mod integrity;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod serial;
pub mod session;
pub mod uow;
pub mod validation;

pub use backend::{
    Backend, BackendDescriptor, BackendError, BackendResult, ClientInfo, ClientLocation,
    LoadDomain, StoreServer,
};
pub use config::{ConfigError, EngineConfig};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use migrate::migrate;
pub use model::id::{Handle, ObjectId};
pub use model::meta::{CustomFieldDef, FieldId, FieldKind, FieldRename, MetaCatalog, ScalarType};
pub use model::value::{FieldValue, FormattedText, ScalarValue};
pub use serial::canonical::{canonicalize_document, canonicalize_record};
pub use serial::sort::ExternalSorter;
pub use serial::SerialError;
pub use session::{GatheredChanges, Session, SessionError, SessionResult};
pub use uow::{ChangeListener, PropChanged};
pub use validation::ConstraintFailure;

/// Minimal health-check API for embedders.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
