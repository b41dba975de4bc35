use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Expiry, MIGRATION_STICKY_OWNER, MigrationCancel, MigrationCancelReply, MigrationCopyReplica,
    MigrationCopyReply, MigrationJobReport, MigrationJobRequest, MigrationMode,
    MigrationUpdateReplica, PoolCostPair, ReplicaId, ReplicaState, StickyRecord,
};
use parking_lot::Mutex;
use pool_client::PoolClient;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::companion::{CompanionStatus, ReplicaCompanion, send_replica};
use crate::mutator::on_worker;
use crate::p2p::{Companion, TransferAcceptor, TransferError};
use crate::pool_list::RefreshablePoolList;
use crate::repository::{
    ReplicaEntry, ReplicaRepository, RepositoryError, transition_allowed, unix_millis,
};
use crate::selection::PoolSelectionStrategy;

/// How long a destination waits for the entry lock when applying an update
/// for an already present replica.
pub const UPDATE_TIME_TO_LIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("no destination pool available for {0}")]
    NoDestination(ReplicaId),

    #[error("peer pool request failed: {0}")]
    Peer(String),

    #[error("invalid migration request: {0}")]
    InvalidRequest(String),

    #[error("migration worker failed: {0}")]
    Worker(String),
}

impl From<JoinError> for MigrationError {
    fn from(err: JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

/// Migration messages sent to other pools.
#[async_trait]
pub trait MigrationPeers: Send + Sync {
    async fn copy(
        &self,
        address: &str,
        message: &MigrationCopyReplica,
    ) -> anyhow::Result<MigrationCopyReply>;

    async fn update(&self, address: &str, message: &MigrationUpdateReplica) -> anyhow::Result<()>;

    async fn cancel(
        &self,
        address: &str,
        message: &MigrationCancel,
    ) -> anyhow::Result<MigrationCancelReply>;
}

/// Reaches peers through their HTTP message endpoints over one shared
/// connection pool.
#[derive(Clone, Default)]
pub struct HttpPeers {
    http: reqwest::Client,
}

impl HttpPeers {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, address: &str) -> PoolClient {
        PoolClient::with_http(self.http.clone(), address)
    }
}

#[async_trait]
impl MigrationPeers for HttpPeers {
    async fn copy(
        &self,
        address: &str,
        message: &MigrationCopyReplica,
    ) -> anyhow::Result<MigrationCopyReply> {
        self.client(address).migration_copy(message).await
    }

    async fn update(&self, address: &str, message: &MigrationUpdateReplica) -> anyhow::Result<()> {
        self.client(address).migration_update(message).await
    }

    async fn cancel(
        &self,
        address: &str,
        message: &MigrationCancel,
    ) -> anyhow::Result<MigrationCancelReply> {
        self.client(address).migration_cancel(message).await
    }
}

struct IncomingCopy {
    file_id: ReplicaId,
    session_id: u32,
    companion: Arc<ReplicaCompanion>,
}

struct OutgoingJob {
    file_id: ReplicaId,
    cancel: CancellationToken,
}

/// Both ends of replica migration.
///
/// As destination it accepts copies into the local repository through the
/// transfer acceptor. As source it picks a destination from the pool list
/// and streams a local replica to it.
pub struct MigrationService {
    pool_name: String,
    advertise_host: Option<String>,
    repository: Arc<ReplicaRepository>,
    acceptor: Arc<TransferAcceptor>,
    pool_list: Arc<dyn RefreshablePoolList>,
    selection: Arc<dyn PoolSelectionStrategy>,
    peers: Arc<dyn MigrationPeers>,
    session_timeout: Duration,
    incoming: Arc<Mutex<HashMap<Uuid, IncomingCopy>>>,
    outgoing: Mutex<HashMap<Uuid, OutgoingJob>>,
}

pub struct MigrationServiceParts {
    pub pool_name: String,
    pub advertise_host: Option<String>,
    pub repository: Arc<ReplicaRepository>,
    pub acceptor: Arc<TransferAcceptor>,
    pub pool_list: Arc<dyn RefreshablePoolList>,
    pub selection: Arc<dyn PoolSelectionStrategy>,
    pub peers: Arc<dyn MigrationPeers>,
    pub session_timeout: Duration,
}

impl MigrationService {
    pub fn new(parts: MigrationServiceParts) -> Self {
        Self {
            pool_name: parts.pool_name,
            advertise_host: parts.advertise_host,
            repository: parts.repository,
            acceptor: parts.acceptor,
            pool_list: parts.pool_list,
            selection: parts.selection,
            peers: parts.peers,
            session_timeout: parts.session_timeout,
            incoming: Arc::new(Mutex::new(HashMap::new())),
            outgoing: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn pool_list(&self) -> &Arc<dyn RefreshablePoolList> {
        &self.pool_list
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.lock().len()
    }

    /// Destination side of a copy: prepares an entry and a transfer session
    /// for the sender.
    pub async fn accept_copy(
        &self,
        message: MigrationCopyReplica,
    ) -> Result<MigrationCopyReply, MigrationError> {
        if !matches!(
            message.target_state,
            ReplicaState::Cached | ReplicaState::Precious
        ) {
            return Err(MigrationError::InvalidRequest(format!(
                "target state {} is not a readable state",
                message.target_state
            )));
        }

        let file_id = message.file_id.clone();
        match self
            .repository
            .create_entry(&file_id, ReplicaState::FromPool)
            .await
        {
            Ok(_) => {}
            Err(RepositoryError::AlreadyExists(_)) => {
                let existing = self.repository.get_entry(&file_id).await?;
                if existing.state.is_transient() {
                    return Err(RepositoryError::Incomplete(file_id).into());
                }
                debug!(file_id = %file_id, state = %existing.state, "replica already present");
                return Ok(MigrationCopyReply::AlreadyPresent {
                    state: existing.state,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let companion = Arc::new(ReplicaCompanion::new(
            Arc::clone(&self.repository),
            file_id.clone(),
            message.target_state,
            message.sticky_records,
        ));

        let registration = match self
            .acceptor
            .register(Arc::clone(&companion) as Arc<dyn Companion>)
            .await
        {
            Ok(registration) => registration,
            Err(err) => {
                if let Err(abort_err) = self
                    .repository
                    .abort_entry(&file_id, "transfer listener unavailable")
                    .await
                {
                    warn!(file_id = %file_id, error = %abort_err, "failed to abort entry");
                }
                return Err(err.into());
            }
        };

        self.incoming.lock().insert(
            message.uuid,
            IncomingCopy {
                file_id: file_id.clone(),
                session_id: registration.session_id,
                companion: Arc::clone(&companion),
            },
        );

        tokio::spawn(supervise_incoming(
            message.uuid,
            registration.session_id,
            companion,
            Arc::clone(&self.repository),
            Arc::clone(&self.acceptor),
            Arc::clone(&self.incoming),
            self.session_timeout,
        ));

        let host = self
            .advertise_host
            .clone()
            .unwrap_or_else(|| registration.addr.ip().to_string());
        info!(
            file_id = %file_id,
            uuid = %message.uuid,
            source_pool = %message.source_pool,
            session_id = registration.session_id,
            "accepted migration copy"
        );
        Ok(MigrationCopyReply::Accepted {
            session_id: registration.session_id,
            host,
            port: registration.addr.port(),
        })
    }

    /// Applies state and pins to a replica that a source found already
    /// present here.
    pub async fn apply_update(
        &self,
        message: MigrationUpdateReplica,
    ) -> Result<(), MigrationError> {
        let repository = Arc::clone(&self.repository);
        on_worker(async move {
            repository
                .update_entry(
                    &message.file_id,
                    message.state,
                    &message.sticky_records,
                    Duration::from_millis(message.time_to_live_ms),
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Cancels a local job or an incoming copy with the given uuid.
    pub async fn cancel(
        &self,
        message: MigrationCancel,
    ) -> Result<MigrationCancelReply, MigrationError> {
        let outgoing = self
            .outgoing
            .lock()
            .get(&message.uuid)
            .filter(|job| job.file_id == message.file_id)
            .map(|job| job.cancel.clone());
        if let Some(cancel) = outgoing {
            info!(uuid = %message.uuid, file_id = %message.file_id, "cancelling migration job");
            cancel.cancel();
            return Ok(MigrationCancelReply { cancelled: true });
        }

        let incoming = self
            .incoming
            .lock()
            .get(&message.uuid)
            .filter(|copy| copy.file_id == message.file_id)
            .map(|copy| Arc::clone(&copy.companion));
        if let Some(companion) = incoming {
            info!(
                uuid = %message.uuid,
                file_id = %message.file_id,
                pool = %message.pool_name,
                "cancelling incoming migration copy"
            );
            companion.cancel();
            return Ok(MigrationCancelReply { cancelled: true });
        }

        debug!(uuid = %message.uuid, "no migration to cancel");
        Ok(MigrationCancelReply { cancelled: false })
    }

    /// Source side: copies or moves one local replica to another pool.
    pub async fn migrate(
        &self,
        request: MigrationJobRequest,
    ) -> Result<MigrationJobReport, MigrationError> {
        let file_id = request.file_id.clone();
        let entry = self.repository.get_entry(&file_id).await?;
        if !entry.state.is_readable() {
            return Err(MigrationError::InvalidRequest(format!(
                "replica {file_id} is {} and cannot be migrated",
                entry.state
            )));
        }

        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut outgoing = self.outgoing.lock();
            if outgoing.values().any(|job| job.file_id == file_id) {
                return Err(MigrationError::InvalidRequest(format!(
                    "replica {file_id} is already being migrated"
                )));
            }
            outgoing.insert(
                uuid,
                OutgoingJob {
                    file_id: file_id.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        let destination = match self.pick_destination(&file_id).await {
            Ok(destination) => destination,
            Err(err) => {
                self.outgoing.lock().remove(&uuid);
                return Err(err);
            }
        };

        let result = self
            .run_job(uuid, &entry, request.mode, &destination, &cancel)
            .await;

        self.outgoing.lock().remove(&uuid);
        match self
            .repository
            .clear_sticky(&file_id, MIGRATION_STICKY_OWNER)
            .await
        {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(err) => warn!(file_id = %file_id, error = %err, "failed to release migration pin"),
        }

        let mut report = result?;
        if request.mode == MigrationMode::Move {
            report.source_removed = self.remove_source(&entry, &destination.name).await;
        }

        info!(
            file_id = %file_id,
            uuid = %uuid,
            destination = %destination.name,
            bytes = report.bytes_sent,
            already_present = report.already_present,
            "migration job finished"
        );
        Ok(report)
    }

    async fn pick_destination(&self, file_id: &ReplicaId) -> Result<PoolCostPair, MigrationError> {
        if !self.pool_list.is_valid() {
            self.pool_list.refresh().await;
        }

        let candidates: Vec<PoolCostPair> = self
            .pool_list
            .pools()
            .iter()
            .filter(|pool| pool.name != self.pool_name)
            .cloned()
            .collect();

        self.selection
            .select(&candidates)
            .cloned()
            .ok_or_else(|| MigrationError::NoDestination(file_id.clone()))
    }

    async fn run_job(
        &self,
        uuid: Uuid,
        entry: &ReplicaEntry,
        mode: MigrationMode,
        destination: &PoolCostPair,
        cancel: &CancellationToken,
    ) -> Result<MigrationJobReport, MigrationError> {
        let file_id = &entry.id;
        self.repository
            .set_sticky(file_id, MIGRATION_STICKY_OWNER, Expiry::Never, true)
            .await?;

        let now = unix_millis();
        let sticky_records: Vec<StickyRecord> = entry
            .sticky_records
            .iter()
            .filter(|record| record.owner != MIGRATION_STICKY_OWNER && record.is_live(now))
            .cloned()
            .collect();

        let copy = MigrationCopyReplica {
            uuid,
            source_pool: self.pool_name.clone(),
            file_id: file_id.clone(),
            target_state: entry.state,
            sticky_records: sticky_records.clone(),
        };
        let request = self.peers.copy(&destination.address, &copy);
        let reply = match unless_cancelled(cancel, request).await {
            Ok(reply) => reply,
            Err(err) => {
                if matches!(err, MigrationError::Transfer(TransferError::Cancelled)) {
                    self.cancel_remote(destination, uuid, file_id).await;
                }
                return Err(err);
            }
        };

        let mut report = MigrationJobReport {
            uuid,
            file_id: file_id.clone(),
            destination: destination.name.clone(),
            bytes_sent: 0,
            already_present: false,
            source_removed: false,
        };

        match reply {
            MigrationCopyReply::Accepted {
                session_id,
                host,
                port,
            } => {
                let addr = resolve(&host, port).await?;
                debug!(file_id = %file_id, %addr, session_id, mode = ?mode, "streaming replica");
                let path = self.repository.data_path(file_id);
                match send_replica(addr, session_id, &path, cancel).await {
                    Ok(bytes) => report.bytes_sent = bytes,
                    Err(err) => {
                        self.cancel_remote(destination, uuid, file_id).await;
                        return Err(err.into());
                    }
                }
            }
            MigrationCopyReply::AlreadyPresent { state } => {
                let target = if transition_allowed(state, entry.state) {
                    entry.state
                } else {
                    state
                };
                let update = MigrationUpdateReplica {
                    file_id: file_id.clone(),
                    state: target,
                    sticky_records,
                    time_to_live_ms: UPDATE_TIME_TO_LIVE.as_millis() as u64,
                };
                let request = self.peers.update(&destination.address, &update);
                unless_cancelled(cancel, request).await?;
                report.already_present = true;
            }
        }

        Ok(report)
    }

    async fn cancel_remote(&self, destination: &PoolCostPair, uuid: Uuid, file_id: &ReplicaId) {
        let message = MigrationCancel {
            uuid,
            pool_name: self.pool_name.clone(),
            file_id: file_id.clone(),
        };
        if let Err(err) = self.peers.cancel(&destination.address, &message).await {
            warn!(
                uuid = %uuid,
                destination = %destination.name,
                error = %err,
                "failed to cancel remote copy"
            );
        }
    }

    /// Drops the source replica after a move. Returns whether it is gone.
    async fn remove_source(&self, entry: &ReplicaEntry, destination: &str) -> bool {
        let reason = format!("migrated to {destination}");
        if entry.state == ReplicaState::Precious
            && let Err(err) = self
                .repository
                .set_state(&entry.id, ReplicaState::Cached, &reason)
                .await
        {
            warn!(file_id = %entry.id, error = %err, "could not demote moved replica");
            return false;
        }

        match self
            .repository
            .set_state(&entry.id, ReplicaState::Removed, &reason)
            .await
        {
            Ok(_) | Err(RepositoryError::NotFound(_)) => true,
            Err(err) => {
                warn!(file_id = %entry.id, error = %err, "moved replica kept on source");
                false
            }
        }
    }
}

/// Runs a peer request unless the job is cancelled first.
async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, MigrationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled.into()),
        result = request => result.map_err(|err| MigrationError::Peer(format!("{err:#}"))),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, MigrationError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(TransferError::from)?
        .next()
        .ok_or_else(|| MigrationError::Peer(format!("destination host {host} did not resolve")))
}

async fn supervise_incoming(
    uuid: Uuid,
    session_id: u32,
    companion: Arc<ReplicaCompanion>,
    repository: Arc<ReplicaRepository>,
    acceptor: Arc<TransferAcceptor>,
    incoming: Arc<Mutex<HashMap<Uuid, IncomingCopy>>>,
    session_timeout: Duration,
) {
    let mut status = companion.subscribe();
    let mut progress = companion.progress();
    let cancel = companion.cancel_token();

    // The deadline restarts whenever bytes arrive, so only an idle session
    // times out.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = status.wait_for(|s| *s != CompanionStatus::Waiting) => break,
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(session_timeout) => {
                warn!(
                    uuid = %uuid,
                    file_id = %companion.file_id(),
                    "migration copy idle for too long"
                );
                companion.cancel();
                break;
            }
        }
    }

    acceptor.unregister(session_id).await;
    incoming.lock().remove(&uuid);

    let completed = *status.borrow() == CompanionStatus::Completed;
    if completed {
        return;
    }

    match repository.abort_entry(companion.file_id(), "migration copy did not complete").await {
        Ok(()) | Err(RepositoryError::NotFound(_)) => {}
        Err(RepositoryError::InvalidTransition { .. }) => {
            debug!(file_id = %companion.file_id(), "copy completed before it could be aborted");
        }
        Err(err) => warn!(
            file_id = %companion.file_id(),
            error = %err,
            "failed to abort incoming replica"
        ),
    }
}

#[cfg(test)]
#[path = "migration_tests.rs"]
mod tests;
