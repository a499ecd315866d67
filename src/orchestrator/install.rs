//! Cluster bootstrap.

use tracing::{info, warn};

use super::{ProvisionError, Provisioner};
use crate::inventory;
use crate::kv::KvStore;
use crate::model::{ClusterId, ClusterStatus, HostConnection, NewRecord, OperationType, RecordId};
use crate::operator::{NodeOperator, PlaybookJob, launch, record_failure};
use crate::reconcile::OperationHandle;
use crate::session::{Connector, open_session};
use crate::store::{ClusterPatch, NodeFilter, RecordStore};

/// Work item for [`Provisioner::install_k8s`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallPayload {
    /// Cluster to bootstrap.
    pub cluster_id: ClusterId,
    /// Record tracking the install.
    pub record_id: RecordId,
    /// Host that runs the playbook.
    pub control: HostConnection,
}

impl<C, K, S, O> Provisioner<C, K, S, O>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    O: NodeOperator,
{
    /// Creates the install record for `cluster_id` and marks the cluster
    /// operating.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Validation`] when the cluster is missing
    /// and [`ProvisionError::Conflict`] when it is already operating.
    pub fn prepare_install(
        &self,
        cluster_id: ClusterId,
        control: HostConnection,
    ) -> Result<InstallPayload, ProvisionError> {
        let cluster = self.store.get_cluster(cluster_id)?.ok_or_else(|| {
            ProvisionError::validation(
                super::CLUSTER_NOT_EXIST,
                format!("cluster {cluster_id} does not exist"),
            )
        })?;
        if cluster.status == ClusterStatus::Operating {
            return Err(ProvisionError::Conflict { cluster_id });
        }
        let record = self
            .store
            .insert_record(NewRecord::new(cluster_id, OperationType::InstallK8s))?;
        self.store
            .update_cluster(cluster_id, &ClusterPatch::status(ClusterStatus::Operating))?;
        info!(cluster_id, record_id = record.id, "install prepared");
        Ok(InstallPayload {
            cluster_id,
            record_id: record.id,
            control,
        })
    }

    /// Starts the bootstrap playbook for a prepared install.
    ///
    /// Any failure marks the record and cluster failed before it is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InconsistentState`] when the record or
    /// cluster vanished, [`ProvisionError::Connect`] when the control host
    /// is unreachable, and [`ProvisionError::Remote`] when the launch exits
    /// non-zero.
    pub fn install_k8s(
        &self,
        payload: &InstallPayload,
    ) -> Result<OperationHandle, ProvisionError> {
        let result = self.launch_install(payload);
        if let Err(err) = &result {
            warn!(
                cluster_id = payload.cluster_id,
                record_id = payload.record_id,
                error = %err,
                "install failed to start"
            );
            if !matches!(err, ProvisionError::InconsistentState { .. }) {
                record_failure(
                    &self.store,
                    payload.record_id,
                    payload.cluster_id,
                    None,
                    &err.to_string(),
                );
            }
        }
        result
    }

    fn launch_install(
        &self,
        payload: &InstallPayload,
    ) -> Result<OperationHandle, ProvisionError> {
        if self.store.get_record(payload.record_id)?.is_none() {
            return Err(ProvisionError::InconsistentState {
                what: format!("operation record {} does not exist", payload.record_id),
            });
        }
        if self.store.get_cluster(payload.cluster_id)?.is_none() {
            return Err(ProvisionError::InconsistentState {
                what: format!("cluster {} does not exist", payload.cluster_id),
            });
        }

        let session = open_session(&self.connector, &payload.control).map_err(|source| {
            ProvisionError::Connect {
                host: payload.control.host.clone(),
                source,
            }
        })?;
        let nodes = self
            .store
            .list_nodes(&NodeFilter::cluster(payload.cluster_id))?;
        let rendered = inventory::render(nodes.iter().map(|node| &node.spec))?;
        launch(
            &*session,
            &self.config,
            &self.templates,
            &rendered,
            PlaybookJob::for_operation(OperationType::InstallK8s, payload.record_id),
        )?;
        Ok(OperationHandle {
            record_id: payload.record_id,
            cluster_id: payload.cluster_id,
        })
    }
}
