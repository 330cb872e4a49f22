//! In-process shared store server and the multi-user backend.
//!
//! # Responsibility
//! - Hold named project stores that several sessions connect to at once.
//! - Expose the administrative surface: list, start, stop, sharing flag and
//!   connected clients.
//!
//! # Invariants
//! - A project cannot be stopped while any client is connected.
//! - Remote clients connect only while sharing is enabled.
//! - Dropping a `MultiUserBackend` disconnects its client.

use super::{
    Backend, BackendDescriptor, BackendError, BackendRecord, BackendResult, ChangeSet, LoadDomain,
    SqliteRecordStore,
};
use crate::model::meta::CustomFieldDef;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const PROJECT_FILE_EXTENSION: &str = "lexgraph";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientLocation {
    Local,
    Remote,
}

/// Identity a client presents when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientInfo {
    pub name: String,
    pub location: ClientLocation,
}

impl ClientInfo {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: ClientLocation::Local,
        }
    }

    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: ClientLocation::Remote,
        }
    }
}

/// One live connection as reported by `connected_clients`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedClient {
    pub project: String,
    pub client: ClientInfo,
}

#[derive(Debug)]
struct ProjectStore {
    running: bool,
    store: Arc<Mutex<SqliteRecordStore>>,
    clients: BTreeMap<u64, ClientInfo>,
}

#[derive(Debug)]
struct ServerState {
    sharing_enabled: bool,
    projects: BTreeMap<String, ProjectStore>,
}

/// Shared store server; wrap in `Arc` and hand clones to descriptors.
#[derive(Debug)]
pub struct StoreServer {
    root: Option<PathBuf>,
    state: Mutex<ServerState>,
    next_connection: AtomicU64,
}

impl StoreServer {
    /// Server keeping every project in memory.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            state: Mutex::new(ServerState {
                sharing_enabled: false,
                projects: BTreeMap::new(),
            }),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Server over a directory of `<project>.lexgraph` files; existing files
    /// are registered as stopped projects.
    pub fn open_dir(root: impl AsRef<Path>) -> BackendResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let server = Self {
            root: Some(root.clone()),
            ..Self::in_memory()
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PROJECT_FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        {
            let mut state = server.lock_state()?;
            for name in names {
                let store = SqliteRecordStore::open(root.join(format!("{name}.{PROJECT_FILE_EXTENSION}")))?;
                state.projects.insert(name, ProjectStore::new(store));
            }
        }
        info!(
            "event=store_server_open module=backend status=ok root={}",
            root.display()
        );
        Ok(server)
    }

    /// Creates an empty, stopped project store.
    pub fn create_project(&self, project: &str) -> BackendResult<()> {
        let mut state = self.lock_state()?;
        if state.projects.contains_key(project) {
            return Err(BackendError::ProjectExists(project.to_string()));
        }
        let store = match &self.root {
            Some(root) => SqliteRecordStore::open(root.join(format!("{project}.{PROJECT_FILE_EXTENSION}")))?,
            None => SqliteRecordStore::in_memory()?,
        };
        state
            .projects
            .insert(project.to_string(), ProjectStore::new(store));
        info!("event=project_create module=backend status=ok project={project}");
        Ok(())
    }

    pub fn list_projects(&self) -> BackendResult<Vec<String>> {
        Ok(self.lock_state()?.projects.keys().cloned().collect())
    }

    pub fn is_running(&self, project: &str) -> BackendResult<bool> {
        let state = self.lock_state()?;
        Ok(project_ref(&state, project)?.running)
    }

    /// Starts a project; `Ok(false)` when it was already running.
    pub fn start_project(&self, project: &str) -> BackendResult<bool> {
        let mut state = self.lock_state()?;
        let store = project_mut(&mut state, project)?;
        if store.running {
            return Ok(false);
        }
        store.running = true;
        info!("event=project_start module=backend status=ok project={project}");
        Ok(true)
    }

    /// Stops a project; `Ok(false)` when it was not running. Refused while
    /// any client remains connected.
    pub fn stop_project(&self, project: &str) -> BackendResult<bool> {
        let mut state = self.lock_state()?;
        let store = project_mut(&mut state, project)?;
        if !store.running {
            return Ok(false);
        }
        if !store.clients.is_empty() {
            warn!(
                "event=project_stop module=backend status=refused project={} clients={}",
                project,
                store.clients.len()
            );
            return Err(BackendError::StoreBusy {
                project: project.to_string(),
                clients: store.clients.len(),
            });
        }
        store.running = false;
        info!("event=project_stop module=backend status=ok project={project}");
        Ok(true)
    }

    pub fn is_sharing_enabled(&self) -> BackendResult<bool> {
        Ok(self.lock_state()?.sharing_enabled)
    }

    /// Toggles sharing; disabling is refused while remote clients are
    /// connected anywhere.
    pub fn set_sharing_enabled(&self, enabled: bool) -> BackendResult<()> {
        let mut state = self.lock_state()?;
        if !enabled {
            let remote = state
                .projects
                .iter()
                .flat_map(|(name, store)| store.clients.values().map(move |client| (name, client)))
                .find(|(_, client)| client.location == ClientLocation::Remote);
            if let Some((project, _)) = remote {
                let clients = state.projects[project].clients.len();
                return Err(BackendError::StoreBusy {
                    project: project.clone(),
                    clients,
                });
            }
        }
        state.sharing_enabled = enabled;
        info!("event=sharing_set module=backend status=ok enabled={enabled}");
        Ok(())
    }

    /// Clients of one project, or of every project when `project` is `None`.
    pub fn connected_clients(&self, project: Option<&str>) -> BackendResult<Vec<ConnectedClient>> {
        let state = self.lock_state()?;
        let selected: Vec<(&String, &ProjectStore)> = match project {
            Some(name) => {
                let (key, store) = state
                    .projects
                    .get_key_value(name)
                    .ok_or_else(|| BackendError::StoreNotFound(name.to_string()))?;
                vec![(key, store)]
            }
            None => state.projects.iter().collect(),
        };
        Ok(selected
            .into_iter()
            .flat_map(|(name, store)| {
                store.clients.values().map(move |client| ConnectedClient {
                    project: name.clone(),
                    client: client.clone(),
                })
            })
            .collect())
    }

    /// Opens a backend on a running project for `client`.
    pub fn connect(
        server: &Arc<StoreServer>,
        project: &str,
        client: ClientInfo,
    ) -> BackendResult<MultiUserBackend> {
        let mut state = server.lock_state()?;
        if client.location == ClientLocation::Remote && !state.sharing_enabled {
            return Err(BackendError::SharingDisabled);
        }
        let entry = project_mut(&mut state, project)?;
        if !entry.running {
            return Err(BackendError::StoreNotRunning(project.to_string()));
        }
        let connection = server.next_connection.fetch_add(1, Ordering::Relaxed);
        entry.clients.insert(connection, client.clone());
        info!(
            "event=client_connect module=backend status=ok project={} client={} connection={}",
            project, client.name, connection
        );
        Ok(MultiUserBackend {
            server: Arc::clone(server),
            project: project.to_string(),
            client,
            connection,
            store: Arc::clone(&entry.store),
        })
    }

    fn disconnect(&self, project: &str, connection: u64) {
        match self.state.lock() {
            Ok(mut state) => {
                if let Some(store) = state.projects.get_mut(project) {
                    store.clients.remove(&connection);
                }
                info!(
                    "event=client_disconnect module=backend status=ok project={project} connection={connection}"
                );
            }
            Err(_) => warn!(
                "event=client_disconnect module=backend status=error project={project} error=state_poisoned"
            ),
        }
    }

    fn lock_state(&self) -> BackendResult<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| BackendError::InvalidData("store server state poisoned".to_string()))
    }
}

impl ProjectStore {
    fn new(store: SqliteRecordStore) -> Self {
        Self {
            running: false,
            store: Arc::new(Mutex::new(store)),
            clients: BTreeMap::new(),
        }
    }
}

fn project_ref<'a>(state: &'a ServerState, project: &str) -> BackendResult<&'a ProjectStore> {
    state
        .projects
        .get(project)
        .ok_or_else(|| BackendError::StoreNotFound(project.to_string()))
}

fn project_mut<'a>(state: &'a mut ServerState, project: &str) -> BackendResult<&'a mut ProjectStore> {
    state
        .projects
        .get_mut(project)
        .ok_or_else(|| BackendError::StoreNotFound(project.to_string()))
}

/// One client's connection to a shared project store.
#[derive(Debug)]
pub struct MultiUserBackend {
    server: Arc<StoreServer>,
    project: String,
    client: ClientInfo,
    connection: u64,
    store: Arc<Mutex<SqliteRecordStore>>,
}

impl MultiUserBackend {
    fn lock_store(&self) -> BackendResult<MutexGuard<'_, SqliteRecordStore>> {
        self.store
            .lock()
            .map_err(|_| BackendError::InvalidData(format!("project `{}` store poisoned", self.project)))
    }
}

impl Backend for MultiUserBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::MultiUser {
            server: Arc::clone(&self.server),
            project: self.project.clone(),
            client: self.client.clone(),
        }
    }

    fn load_domain(&self, domain: &LoadDomain) -> BackendResult<Vec<BackendRecord>> {
        self.lock_store()?.load(domain)
    }

    fn load_custom_fields(&self) -> BackendResult<Vec<CustomFieldDef>> {
        self.lock_store()?.load_custom_fields()
    }

    fn commit(&mut self, changes: &ChangeSet) -> BackendResult<()> {
        self.lock_store()?.commit(changes)?;
        info!(
            "event=backend_commit module=backend status=ok kind=multi_user project={} connection={} upserts={} deletes={}",
            self.project,
            self.connection,
            changes.upserts.len(),
            changes.deletes.len()
        );
        Ok(())
    }

    fn object_count(&self) -> BackendResult<usize> {
        self.lock_store()?.object_count()
    }
}

impl Drop for MultiUserBackend {
    fn drop(&mut self) {
        self.server.disconnect(&self.project, self.connection);
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientInfo, StoreServer};
    use crate::backend::BackendError;
    use std::sync::Arc;

    #[test]
    fn remote_clients_need_sharing() {
        let server = Arc::new(StoreServer::in_memory());
        server.create_project("demo").unwrap();
        server.start_project("demo").unwrap();

        let err = StoreServer::connect(&server, "demo", ClientInfo::remote("far")).unwrap_err();
        assert!(matches!(err, BackendError::SharingDisabled));

        server.set_sharing_enabled(true).unwrap();
        let backend = StoreServer::connect(&server, "demo", ClientInfo::remote("far")).unwrap();
        assert!(matches!(
            server.set_sharing_enabled(false),
            Err(BackendError::StoreBusy { .. })
        ));
        drop(backend);
        server.set_sharing_enabled(false).unwrap();
    }

    #[test]
    fn start_and_stop_report_transitions() {
        let server = StoreServer::in_memory();
        server.create_project("demo").unwrap();
        assert!(server.start_project("demo").unwrap());
        assert!(!server.start_project("demo").unwrap());
        assert!(server.stop_project("demo").unwrap());
        assert!(!server.stop_project("demo").unwrap());
        assert!(matches!(
            server.stop_project("missing"),
            Err(BackendError::StoreNotFound(_))
        ));
    }
}
