use std::sync::Arc;

use common::{
    Expiry, ForceSystemStickyBit, RemoveReplica, ReplicaState, ReplicaStatus,
    ReplicaStatusRequest, SYSTEM_STICKY_OWNER,
};
use tracing::{debug, info};

use crate::mutator::{MutatorError, on_worker, replica_status};
use crate::repository::{ReplicaRepository, RepositoryError};

pub const EXCESS_REPLICA_REASON: &str = "resilience: excess replica";

/// Adapter for the replication repair subsystem.
#[derive(Clone)]
pub struct ResilienceHandler {
    repository: Arc<ReplicaRepository>,
}

impl ResilienceHandler {
    pub fn new(repository: Arc<ReplicaRepository>) -> Self {
        Self { repository }
    }

    /// Makes the replica permanently sticky for `"system"`, replacing any
    /// time-limited system pin.
    pub async fn force_system_sticky(
        &self,
        message: ForceSystemStickyBit,
    ) -> Result<(), MutatorError> {
        let repository = Arc::clone(&self.repository);
        on_worker(async move {
            repository
                .set_sticky(&message.file_id, SYSTEM_STICKY_OWNER, Expiry::Never, true)
                .await?;
            info!(file_id = %message.file_id, "resilience forced system sticky bit");
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

    /// Removes a replica the resilience engine considers surplus. A replica
    /// that is already gone counts as removed.
    pub async fn remove_replica(&self, message: RemoveReplica) -> Result<(), MutatorError> {
        let repository = Arc::clone(&self.repository);
        on_worker(async move {
            match repository
                .set_state(&message.file_id, ReplicaState::Removed, EXCESS_REPLICA_REASON)
                .await
            {
                Ok(_) => Ok(()),
                Err(RepositoryError::NotFound(_)) => {
                    debug!(file_id = %message.file_id, "replica already gone");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }
}
