//! Copying a whole repository between backends.
//!
//! Migration writes every existing object and the custom-field block to an
//! empty target in one commit, then opens a session on the target. Records
//! that were never materialized are copied as stored text.

use crate::backend::{open_backend, BackendDescriptor, BackendError, ChangeSet, LoadDomain};
use crate::config::EngineConfig;
use crate::model::meta::MetaCatalog;
use crate::session::{Session, SessionError, SessionResult};
use log::info;
use std::time::Instant;

impl Session {
    /// Copies this session's current state to an empty target store and
    /// returns a session over the target. The source is left untouched.
    pub fn migrate_to(&self, target: &BackendDescriptor) -> SessionResult<Session> {
        if self.is_task_active() {
            return Err(SessionError::TaskInProgress);
        }
        let started_at = Instant::now();
        let mut backend = open_backend(target)?;
        let existing = backend.object_count()?;
        if existing > 0 {
            return Err(BackendError::TargetNotEmpty { objects: existing }.into());
        }

        let graph = self.graph();
        let mut upserts = Vec::with_capacity(graph.len());
        for handle in graph.handles() {
            upserts.push(graph.encode(handle)?);
        }
        upserts.sort_by_key(|record| record.id);
        let objects = upserts.len();
        backend.commit(&ChangeSet {
            upserts,
            deletes: Vec::new(),
            custom_fields: Some(self.catalog().custom_fields()),
        })?;
        info!(
            "event=migrate module=migrate status=ok from={} to={} objects={} duration_ms={}",
            self.descriptor().kind(),
            target.kind(),
            objects,
            started_at.elapsed().as_millis()
        );

        Session::with_backend(backend, self.catalog().clone(), self.config().clone())
    }
}

/// Opens `source` without materializing anything and migrates it to
/// `target`.
pub fn migrate(
    source: &BackendDescriptor,
    target: &BackendDescriptor,
    config: &EngineConfig,
) -> SessionResult<Session> {
    let mut cold = config.clone();
    cold.startup_domain = LoadDomain::Classes(Vec::new());
    let source_session = Session::with_backend(open_backend(source)?, MetaCatalog::builtin(), cold)?;
    source_session.migrate_to(target)
}
