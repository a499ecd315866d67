//! Shared fixtures for reconcile BDD scenarios.

use std::sync::Arc;

use hoist::kv::MemoryKvStore;
use hoist::model::{
    ClusterDraft, ClusterId, ClusterStatus, NewRecord, NodeRole, OperationRecord, OperationStatus,
    OperationType, RecordId,
};
use hoist::reconcile::{StatusReconciler, SweepReport, TemplateAgentCommands};
use hoist::store::{MemoryRecordStore, RecordStore, StoreError};
use hoist::test_support::{ScriptedConnector, node_spec, outer_node_spec, test_config};
use parking_lot::Mutex;
use rstest::fixture;
use thiserror::Error;

pub type WorldReconciler =
    StatusReconciler<ScriptedConnector, MemoryKvStore, MemoryRecordStore, TemplateAgentCommands>;

#[derive(Debug, Error)]
pub enum WorldError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

/// Collaborators shared by the steps of one scenario.
pub struct ReconcileWorld {
    pub connector: ScriptedConnector,
    pub kv: MemoryKvStore,
    pub store: MemoryRecordStore,
    pub reconciler: WorldReconciler,
    pub cluster_id: Mutex<Option<ClusterId>>,
    pub record_id: Mutex<Option<RecordId>>,
    pub report: Mutex<Option<SweepReport>>,
}

#[fixture]
pub fn reconcile_world() -> ReconcileWorld {
    let connector = ScriptedConnector::new();
    let kv = MemoryKvStore::new();
    let store = MemoryRecordStore::new();
    let config = Arc::new(test_config("/tmp/hoist-bdd"));
    let reconciler = StatusReconciler::new(
        Arc::clone(&config),
        connector.clone(),
        kv.clone(),
        store.clone(),
        TemplateAgentCommands::from_config(&config),
    );
    ReconcileWorld {
        connector,
        kv,
        store,
        reconciler,
        cluster_id: Mutex::new(None),
        record_id: Mutex::new(None),
        report: Mutex::new(None),
    }
}

impl ReconcileWorld {
    pub fn seed_install(&self) -> Result<(), WorldError> {
        let cluster = self.store.insert_cluster(
            1,
            &ClusterDraft {
                code: String::from("bdd"),
                name: String::from("Behaviour"),
            },
            ClusterStatus::Operating,
        )?;
        self.store.insert_nodes(
            1,
            cluster.id,
            vec![
                outer_node_spec("bastion", "10.1.0.9"),
                node_spec("m1", NodeRole::MasterEtcdWorker, "10.1.0.1"),
            ],
        )?;
        let record = self
            .store
            .insert_record(NewRecord::new(cluster.id, OperationType::InstallK8s))?;
        *self.cluster_id.lock() = Some(cluster.id);
        *self.record_id.lock() = Some(record.id);
        Ok(())
    }

    pub fn record(&self) -> Result<OperationRecord, WorldError> {
        let id = (*self.record_id.lock())
            .ok_or_else(|| WorldError::Assertion(String::from("no record seeded")))?;
        self.store
            .get_record(id)?
            .ok_or_else(|| WorldError::Assertion(format!("record {id} vanished")))
    }

    pub fn cluster_status(&self) -> Result<ClusterStatus, WorldError> {
        let id = (*self.cluster_id.lock())
            .ok_or_else(|| WorldError::Assertion(String::from("no cluster seeded")))?;
        self.store
            .get_cluster(id)?
            .map(|cluster| cluster.status)
            .ok_or_else(|| WorldError::Assertion(format!("cluster {id} vanished")))
    }
}

pub fn parse_record_status(text: &str) -> Result<OperationStatus, WorldError> {
    serde_json::from_value(serde_json::Value::String(text.to_owned()))
        .map_err(|err| WorldError::Assertion(format!("unknown record status {text}: {err}")))
}

pub fn parse_cluster_status(text: &str) -> Result<ClusterStatus, WorldError> {
    serde_json::from_value(serde_json::Value::String(text.to_owned()))
        .map_err(|err| WorldError::Assertion(format!("unknown cluster status {text}: {err}")))
}
