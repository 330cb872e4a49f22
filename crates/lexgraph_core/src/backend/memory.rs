//! Memory-only store; contents live as long as the backend value.

use super::{Backend, BackendDescriptor, BackendRecord, BackendResult, ChangeSet, LoadDomain};
use crate::model::id::ObjectId;
use crate::model::meta::CustomFieldDef;
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: BTreeMap<ObjectId, BackendRecord>,
    custom_fields: Vec<CustomFieldDef>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::Memory
    }

    fn load_domain(&self, domain: &LoadDomain) -> BackendResult<Vec<BackendRecord>> {
        Ok(self
            .records
            .values()
            .filter(|record| domain.includes(&record.class))
            .cloned()
            .collect())
    }

    fn load_custom_fields(&self) -> BackendResult<Vec<CustomFieldDef>> {
        Ok(self.custom_fields.clone())
    }

    fn commit(&mut self, changes: &ChangeSet) -> BackendResult<()> {
        // Build the next state aside and swap it in whole.
        let mut next = self.records.clone();
        for id in &changes.deletes {
            next.remove(id);
        }
        for record in &changes.upserts {
            next.insert(record.id, record.clone());
        }
        self.records = next;
        if let Some(defs) = &changes.custom_fields {
            self.custom_fields = defs.clone();
        }
        debug!(
            "event=backend_commit module=backend status=ok kind=memory upserts={} deletes={}",
            changes.upserts.len(),
            changes.deletes.len()
        );
        Ok(())
    }

    fn object_count(&self) -> BackendResult<usize> {
        Ok(self.records.len())
    }
}
