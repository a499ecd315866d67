//! Completion feed for asynchronous operations.
//!
//! The reconciler publishes one [`Completion`] whenever it finalizes or
//! prunes an operation record. Callers holding an [`OperationHandle`] wait
//! on a subscription instead of polling the record store.

use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing::warn;

use crate::model::{ClusterId, OperationStatus, RecordId};

/// Default capacity of the completion channel.
pub const COMPLETION_CHANNEL_CAPACITY: usize = 64;

/// How an operation ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Outcome {
    /// The remote work finished successfully.
    Succeeded,
    /// The remote work failed.
    Failed,
    /// The record was discarded because its cluster vanished or has no
    /// reachable host.
    Pruned,
}

impl Outcome {
    /// Outcome matching a terminal record status.
    #[must_use]
    pub const fn from_status(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Failed => Self::Failed,
            OperationStatus::Success | OperationStatus::Operating => Self::Succeeded,
        }
    }
}

/// Terminal transition of one operation record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Completion {
    /// Record that finished.
    pub record_id: RecordId,
    /// Cluster the record targeted.
    pub cluster_id: ClusterId,
    /// How it ended.
    pub outcome: Outcome,
}

/// Handle to remote work launched in the background.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OperationHandle {
    /// Record tracking the work.
    pub record_id: RecordId,
    /// Cluster the work targets.
    pub cluster_id: ClusterId,
}

impl OperationHandle {
    /// Waits until `events` carries the completion of this handle.
    ///
    /// Subscribe before the reconciler can finalize the record, otherwise
    /// the event may already have been sent. Lagged receivers skip ahead
    /// and keep waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError::Closed`] when the reconciler is dropped first.
    pub async fn wait(&self, events: &mut Receiver<Completion>) -> Result<Completion, RecvError> {
        loop {
            match events.recv().await {
                Ok(completion) if completion.record_id == self.record_id => return Ok(completion),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(record_id = self.record_id, skipped, "completion feed lagged");
                }
                Err(RecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }
}
