//! In-memory record store with optional JSON snapshots.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    ClusterPatch, NodeFilter, NodePatch, RecordFilter, RecordPatch, RecordStore, StoreError,
};
use crate::model::{
    Cluster, ClusterDraft, ClusterId, ClusterStatus, NewRecord, Node, NodeId, NodeRole, NodeSpec,
    OperationRecord, OperationStatus, ProjectId, RecordId,
};

#[derive(Debug, Default)]
struct State {
    clusters: BTreeMap<ClusterId, Cluster>,
    nodes: BTreeMap<NodeId, Node>,
    records: BTreeMap<RecordId, OperationRecord>,
    next_id: u64,
}

impl State {
    const fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn name_taken(&self, cluster_id: ClusterId, name: &str) -> bool {
        self.nodes
            .values()
            .any(|node| node.cluster_id == cluster_id && node.spec.name == name)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Snapshot {
    clusters: Vec<Cluster>,
    nodes: Vec<Node>,
    records: Vec<OperationRecord>,
}

/// Record store held in process memory. Clones share the same rows.
#[derive(Clone, Debug, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<State>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot written by [`MemoryRecordStore::save`]. A missing
    /// file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be read and
    /// [`StoreError::Corrupt`] when it cannot be decoded.
    pub fn load(path: &Utf8Path) -> Result<Self, StoreError> {
        let read = open_parent(path, false).and_then(|(dir, name)| dir.read_to_string(name));
        let raw = match read {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(io_error(path, &err)),
        };
        let snapshot: Snapshot = serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let next_id = snapshot
            .clusters
            .iter()
            .map(|cluster| cluster.id)
            .chain(snapshot.nodes.iter().map(|node| node.id))
            .chain(snapshot.records.iter().map(|record| record.id))
            .max()
            .unwrap_or(0);
        let state = State {
            clusters: snapshot
                .clusters
                .into_iter()
                .map(|cluster| (cluster.id, cluster))
                .collect(),
            nodes: snapshot
                .nodes
                .into_iter()
                .map(|node| (node.id, node))
                .collect(),
            records: snapshot
                .records
                .into_iter()
                .map(|record| (record.id, record))
                .collect(),
            next_id,
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Writes every row to `path` as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be written.
    pub fn save(&self, path: &Utf8Path) -> Result<(), StoreError> {
        let snapshot = {
            let state = self.state.lock();
            Snapshot {
                clusters: state.clusters.values().cloned().collect(),
                nodes: state.nodes.values().cloned().collect(),
                records: state.records.values().cloned().collect(),
            }
        };
        let rendered =
            serde_json::to_string_pretty(&snapshot).map_err(|err| StoreError::Corrupt {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        open_parent(path, true)
            .and_then(|(dir, name)| dir.write(name, rendered))
            .map_err(|err| io_error(path, &err))
    }
}

fn open_parent(path: &Utf8Path, create: bool) -> io::Result<(Dir, &str)> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "snapshot path is missing a filename",
        )
    })?;
    if create {
        Dir::create_ambient_dir_all(parent, ambient_authority())?;
    }
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: Utf8PathBuf::from(path),
        message: err.to_string(),
    }
}

const fn not_found(entity: &'static str, id: u64) -> StoreError {
    StoreError::NotFound { entity, id }
}

impl RecordStore for MemoryRecordStore {
    fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>, StoreError> {
        Ok(self.state.lock().clusters.get(&id).cloned())
    }

    fn insert_cluster(
        &self,
        project_id: ProjectId,
        draft: &ClusterDraft,
        status: ClusterStatus,
    ) -> Result<Cluster, StoreError> {
        let mut state = self.state.lock();
        if state
            .clusters
            .values()
            .any(|cluster| cluster.project_id == project_id && cluster.code == draft.code)
        {
            return Err(StoreError::NotStored {
                entity: "cluster",
                message: format!("code {} already exists in project {project_id}", draft.code),
            });
        }
        let cluster = Cluster {
            id: state.allocate(),
            project_id,
            code: draft.code.clone(),
            name: draft.name.clone(),
            status,
        };
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    fn update_cluster(&self, id: ClusterId, patch: &ClusterPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let cluster = state
            .clusters
            .get_mut(&id)
            .ok_or_else(|| not_found("cluster", id))?;
        if let Some(status) = patch.status {
            cluster.status = status;
        }
        Ok(())
    }

    fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.state.lock().nodes.get(&id).cloned())
    }

    fn insert_node(
        &self,
        project_id: ProjectId,
        cluster_id: ClusterId,
        spec: NodeSpec,
    ) -> Result<Node, StoreError> {
        let mut nodes = self.insert_nodes(project_id, cluster_id, vec![spec])?;
        nodes.pop().ok_or_else(|| StoreError::NotStored {
            entity: "node",
            message: String::from("insert returned no rows"),
        })
    }

    fn insert_nodes(
        &self,
        project_id: ProjectId,
        cluster_id: ClusterId,
        specs: Vec<NodeSpec>,
    ) -> Result<Vec<Node>, StoreError> {
        let mut state = self.state.lock();
        let mut seen = Vec::with_capacity(specs.len());
        for spec in &specs {
            if state.name_taken(cluster_id, &spec.name) || seen.contains(&spec.name.as_str()) {
                return Err(StoreError::NotStored {
                    entity: "node",
                    message: format!("name {} already exists in cluster {cluster_id}", spec.name),
                });
            }
            seen.push(spec.name.as_str());
        }
        let mut inserted = Vec::with_capacity(specs.len());
        for spec in specs {
            let node = Node {
                id: state.allocate(),
                project_id,
                cluster_id,
                spec,
                operating_status: None,
                error_msg: None,
            };
            state.nodes.insert(node.id, node.clone());
            inserted.push(node);
        }
        Ok(inserted)
    }

    fn update_node(&self, id: NodeId, patch: &NodePatch) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(&id).ok_or_else(|| not_found("node", id))?;
        if let Some(role) = patch.role {
            node.spec.role = role;
        }
        if let Some(status) = patch.operating_status {
            node.operating_status = Some(status);
        }
        if let Some(error) = &patch.error_msg {
            node.error_msg = (!error.is_empty()).then(|| error.clone());
        }
        Ok(())
    }

    fn delete_node(&self, id: NodeId) -> Result<bool, StoreError> {
        Ok(self.state.lock().nodes.remove(&id).is_some())
    }

    fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|node| filter.matches(node))
            .cloned()
            .collect())
    }

    fn count_by_role_set(
        &self,
        cluster_id: ClusterId,
        roles: &[NodeRole],
    ) -> Result<u64, StoreError> {
        let count = self
            .state
            .lock()
            .nodes
            .values()
            .filter(|node| {
                node.cluster_id == cluster_id && roles.contains(&node.spec.role)
            })
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    fn get_record(&self, id: RecordId) -> Result<Option<OperationRecord>, StoreError> {
        Ok(self.state.lock().records.get(&id).cloned())
    }

    fn insert_record(&self, record: NewRecord) -> Result<OperationRecord, StoreError> {
        let mut state = self.state.lock();
        let stored = OperationRecord {
            id: state.allocate(),
            cluster_id: record.cluster_id,
            operation: record.operation,
            status: OperationStatus::Operating,
            error_msg: String::new(),
            node_id: record.node_id,
            removed_role: record.removed_role,
            created_at: Utc::now(),
        };
        state.records.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn update_record(&self, id: RecordId, patch: &RecordPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state.records.get_mut(&id).ok_or_else(|| not_found("record", id))?;
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(error) = &patch.append_error {
            record.append_error(error);
        }
        Ok(())
    }

    fn delete_record(&self, id: RecordId) -> Result<bool, StoreError> {
        Ok(self.state.lock().records.remove(&id).is_some())
    }

    fn list_records(&self, filter: &RecordFilter) -> Result<Vec<OperationRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}
