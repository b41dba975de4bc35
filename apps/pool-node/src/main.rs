use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use common::{
    ChangePreciousBit, ChangeStickyBit, ErrorKind, ErrorReply, ForceSystemStickyBit,
    HealthStatus, MigrationCancel, MigrationCancelReply, MigrationCopyReplica, MigrationCopyReply,
    MigrationJobReport, MigrationJobRequest, MigrationUpdateReplica, PoolCostPair, RemoveReplica,
    ReplicaId, ReplicaState, ReplicaStatus, ReplicaStatusRequest,
};
use pool_client::PoolManagerClient;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod companion;
mod config;
mod migration;
mod mutator;
mod p2p;
mod pool_list;
mod qos;
mod repository;
mod resilience;
mod selection;
mod sticky;

use config::{NodeConfig, PoolSource};
use migration::{HttpPeers, MigrationError, MigrationService, MigrationServiceParts};
use mutator::MutatorError;
use p2p::{TransferAcceptor, TransferError};
use pool_list::{FixedPoolList, ManagerPoolList, RefreshablePoolList, run_refresher};
use qos::QosHandler;
use repository::{BrokenReplicaLogger, ReplicaRepository, RepositoryError, write_atomic};
use resilience::ResilienceHandler;
use selection::RngSource;

#[derive(Clone)]
struct ServerState {
    pool_name: String,
    repository: Arc<ReplicaRepository>,
    qos: QosHandler,
    resilience: ResilienceHandler,
    migration: Arc<MigrationService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = NodeConfig::from_env()?;
    let shutdown = CancellationToken::new();

    let repository = ReplicaRepository::open(&config.data_dir)
        .await
        .with_context(|| {
            format!(
                "failed to open repository at {}",
                config.data_dir.display()
            )
        })?;
    let repository = Arc::new(repository);
    repository.add_listener(Arc::new(BrokenReplicaLogger));

    let pool_list = build_pool_list(&config)?;
    if matches!(config.pools, PoolSource::Manager { .. }) {
        tokio::spawn(run_refresher(
            Arc::clone(&pool_list),
            config.pool_refresh,
            shutdown.clone(),
        ));
    }
    tokio::spawn(run_sticky_sweep(
        Arc::clone(&repository),
        config.sticky_sweep,
        shutdown.clone(),
    ));

    let acceptor = Arc::new(TransferAcceptor::new(config.acceptor.clone()));
    let migration = Arc::new(MigrationService::new(MigrationServiceParts {
        pool_name: config.pool_name.clone(),
        advertise_host: config.advertise_host.clone(),
        repository: Arc::clone(&repository),
        acceptor: Arc::clone(&acceptor),
        pool_list,
        selection: Arc::from(config.selection.build(RngSource::from_entropy())),
        peers: Arc::new(HttpPeers::new()),
        session_timeout: config.session_timeout,
    }));

    let state = ServerState {
        pool_name: config.pool_name.clone(),
        qos: QosHandler::new(Arc::clone(&repository)),
        resilience: ResilienceHandler::new(Arc::clone(&repository)),
        repository,
        migration,
    };

    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    info!(
        bind_addr = %config.http_bind,
        pool_name = %config.pool_name,
        "pool node listening"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested");
        signal.cancel();
    });

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    acceptor.shutdown().await;
    Ok(())
}

fn build_pool_list(config: &NodeConfig) -> Result<Arc<dyn RefreshablePoolList>> {
    Ok(match &config.pools {
        PoolSource::Fixed(list) => Arc::new(FixedPoolList::parse(list)?),
        PoolSource::Manager {
            url,
            target,
            exclude,
            factors,
        } => Arc::new(ManagerPoolList::new(
            Arc::new(PoolManagerClient::new(url.clone())),
            target.clone(),
            exclude.clone(),
            *factors,
            config.pool_query_timeout,
        )),
    })
}

async fn run_sticky_sweep(
    repository: Arc<ReplicaRepository>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match repository.purge_expired_sticky().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "purged expired sticky records"),
                Err(err) => warn!(error = %err, "sticky record sweep failed"),
            },
        }
    }
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pools", get(list_pools))
        .route("/replicas/{id}", put(put_replica))
        .route("/qos/change-sticky-bit", post(qos_change_sticky_bit))
        .route("/qos/change-precious-bit", post(qos_change_precious_bit))
        .route("/qos/replica-status", post(qos_replica_status))
        .route("/resilience/force-system-sticky", post(resilience_force_sticky))
        .route("/resilience/replica-status", post(resilience_replica_status))
        .route("/resilience/remove-replica", post(resilience_remove_replica))
        .route("/migration/copy", post(migration_copy))
        .route("/migration/update", post(migration_update))
        .route("/migration/cancel", post(migration_cancel))
        .route("/migration/jobs", post(migration_job))
        .with_state(state)
}

/// Typed failure reply; every request gets exactly one response.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::BadRequest, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        } else {
            debug!(status = %self.status, error = %self.message, "request rejected");
        }
        (
            self.status,
            Json(ErrorReply {
                kind: self.kind,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        let (status, kind) = match &err {
            RepositoryError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorKind::NotFound),
            RepositoryError::AlreadyExists(_) => (StatusCode::CONFLICT, ErrorKind::AlreadyExists),
            RepositoryError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, ErrorKind::InvalidTransition)
            }
            RepositoryError::Incomplete(_) => (StatusCode::CONFLICT, ErrorKind::Incomplete),
            RepositoryError::Pinned(_) => (StatusCode::CONFLICT, ErrorKind::Pinned),
            RepositoryError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, ErrorKind::Timeout),
            RepositoryError::Io(_) | RepositoryError::Corrupt { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal)
            }
        };
        Self::new(status, kind, err.to_string())
    }
}

impl From<MutatorError> for ApiError {
    fn from(err: MutatorError) -> Self {
        match err {
            MutatorError::Repository(err) => err.into(),
            MutatorError::Worker(message) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, message)
            }
        }
    }
}

impl From<MigrationError> for ApiError {
    fn from(err: MigrationError) -> Self {
        let message = err.to_string();
        match err {
            MigrationError::Repository(err) => err.into(),
            MigrationError::Transfer(TransferError::Repository(err)) => err.into(),
            MigrationError::Transfer(TransferError::Cancelled) => {
                Self::new(StatusCode::CONFLICT, ErrorKind::Cancelled, message)
            }
            MigrationError::Transfer(TransferError::Bind(_)) | MigrationError::NoDestination(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Unavailable, message)
            }
            MigrationError::Transfer(_) | MigrationError::Peer(_) => {
                Self::new(StatusCode::BAD_GATEWAY, ErrorKind::Unavailable, message)
            }
            MigrationError::InvalidRequest(_) => Self::bad_request(message),
            MigrationError::Worker(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, message)
            }
        }
    }
}

async fn health(State(state): State<ServerState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        pool_name: state.pool_name.clone(),
        role: "pool-node".to_string(),
        online: true,
    })
}

async fn list_pools(State(state): State<ServerState>) -> Json<Vec<PoolCostPair>> {
    Json(state.migration.pool_list().pools().as_ref().clone())
}

#[derive(Debug, Deserialize)]
struct PutReplicaQuery {
    state: Option<ReplicaState>,
}

async fn put_replica(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<PutReplicaQuery>,
    payload: Bytes,
) -> Result<StatusCode, ApiError> {
    let id = ReplicaId::parse(id).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let target = query.state.unwrap_or(ReplicaState::Cached);
    if !target.is_readable() {
        return Err(ApiError::bad_request(format!(
            "replicas can only be written as cached or precious, not {target}"
        )));
    }

    let repository = &state.repository;
    repository.create_entry(&id, ReplicaState::FromClient).await?;

    if let Err(err) = write_atomic(&repository.data_path(&id), &payload).await {
        if let Err(abort_err) = repository.abort_entry(&id, "client write failed").await {
            warn!(file_id = %id, error = %abort_err, "failed to abort replica");
        }
        return Err(RepositoryError::Io(err).into());
    }

    repository
        .complete_entry(&id, target, payload.len() as u64, &[])
        .await?;
    info!(file_id = %id, size = payload.len(), state = %target, "stored replica from client");
    Ok(StatusCode::CREATED)
}

async fn qos_change_sticky_bit(
    State(state): State<ServerState>,
    Json(message): Json<ChangeStickyBit>,
) -> Result<StatusCode, ApiError> {
    state.qos.change_sticky_bit(message).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn qos_change_precious_bit(
    State(state): State<ServerState>,
    Json(message): Json<ChangePreciousBit>,
) -> Result<StatusCode, ApiError> {
    state.qos.change_precious_bit(message).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn qos_replica_status(
    State(state): State<ServerState>,
    Json(message): Json<ReplicaStatusRequest>,
) -> Result<Json<ReplicaStatus>, ApiError> {
    Ok(Json(state.qos.replica_status(message).await?))
}

async fn resilience_force_sticky(
    State(state): State<ServerState>,
    Json(message): Json<ForceSystemStickyBit>,
) -> Result<StatusCode, ApiError> {
    state.resilience.force_system_sticky(message).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resilience_replica_status(
    State(state): State<ServerState>,
    Json(message): Json<ReplicaStatusRequest>,
) -> Result<Json<ReplicaStatus>, ApiError> {
    Ok(Json(state.resilience.replica_status(message).await?))
}

async fn resilience_remove_replica(
    State(state): State<ServerState>,
    Json(message): Json<RemoveReplica>,
) -> Result<StatusCode, ApiError> {
    state.resilience.remove_replica(message).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn migration_copy(
    State(state): State<ServerState>,
    Json(message): Json<MigrationCopyReplica>,
) -> Result<Json<MigrationCopyReply>, ApiError> {
    Ok(Json(state.migration.accept_copy(message).await?))
}

async fn migration_update(
    State(state): State<ServerState>,
    Json(message): Json<MigrationUpdateReplica>,
) -> Result<StatusCode, ApiError> {
    state.migration.apply_update(message).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn migration_cancel(
    State(state): State<ServerState>,
    Json(message): Json<MigrationCancel>,
) -> Result<Json<MigrationCancelReply>, ApiError> {
    Ok(Json(state.migration.cancel(message).await?))
}

async fn migration_job(
    State(state): State<ServerState>,
    Json(request): Json<MigrationJobRequest>,
) -> Result<Json<MigrationJobReport>, ApiError> {
    let migration = Arc::clone(&state.migration);
    let report = mutator::on_worker(async move { migration.migrate(request).await }).await?;
    Ok(Json(report))
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
