use std::sync::Arc;

use common::{
    ChangePreciousBit, ChangeStickyBit, Expiry, ReplicaState, ReplicaStatus, ReplicaStatusRequest,
    SYSTEM_STICKY_OWNER,
};
use tracing::info;

use crate::mutator::{MutatorError, on_worker, replica_status};
use crate::repository::ReplicaRepository;

pub const PRECIOUS_CLEARED_REASON: &str = "qos: replica no longer needs to be precious";

/// Applies quality-of-service changes to local replicas.
#[derive(Clone)]
pub struct QosHandler {
    repository: Arc<ReplicaRepository>,
}

impl QosHandler {
    pub fn new(repository: Arc<ReplicaRepository>) -> Self {
        Self { repository }
    }

    /// Pins or unpins the replica for the `"system"` owner.
    pub async fn change_sticky_bit(&self, message: ChangeStickyBit) -> Result<(), MutatorError> {
        let repository = Arc::clone(&self.repository);
        on_worker(async move {
            let expiry = if message.sticky {
                Expiry::Never
            } else {
                Expiry::EXPIRED
            };
            repository
                .set_sticky(&message.file_id, SYSTEM_STICKY_OWNER, expiry, true)
                .await?;
            info!(file_id = %message.file_id, sticky = message.sticky, "qos changed sticky bit");
            Ok(())
        })
        .await
    }

    /// Demotes a precious replica to cached.
    pub async fn change_precious_bit(
        &self,
        message: ChangePreciousBit,
    ) -> Result<(), MutatorError> {
        let repository = Arc::clone(&self.repository);
        on_worker(async move {
            repository
                .set_state(&message.file_id, ReplicaState::Cached, PRECIOUS_CLEARED_REASON)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn replica_status(
        &self,
        message: ReplicaStatusRequest,
    ) -> Result<ReplicaStatus, MutatorError> {
        replica_status(Arc::clone(&self.repository), message).await
    }
}
