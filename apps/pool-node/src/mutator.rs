use std::future::Future;
use std::sync::Arc;

use common::{ReplicaStatus, ReplicaStatusRequest, SYSTEM_STICKY_OWNER};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::error;

use crate::repository::{ReplicaRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum MutatorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("request worker failed: {0}")]
    Worker(String),
}

impl From<JoinError> for MutatorError {
    fn from(err: JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

/// Runs one request on its own task and waits for its single reply.
pub async fn on_worker<F, T, E>(request: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    match tokio::spawn(request).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(error = %err, "request worker did not finish");
            Err(E::from(err))
        }
    }
}

/// Status of a replica; an unknown id reports `exists = false`.
pub async fn replica_status(
    repository: Arc<ReplicaRepository>,
    request: ReplicaStatusRequest,
) -> Result<ReplicaStatus, MutatorError> {
    let owner = request
        .sticky_owner
        .unwrap_or_else(|| SYSTEM_STICKY_OWNER.to_string());

    on_worker(async move {
        match repository.status(&request.file_id, &owner).await {
            Ok(status) => Ok(status),
            Err(RepositoryError::NotFound(_)) => Ok(ReplicaStatus::default()),
            Err(err) => Err(err.into()),
        }
    })
    .await
}
