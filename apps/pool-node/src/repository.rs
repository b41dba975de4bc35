use std::collections::HashMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{Expiry, ReplicaId, ReplicaState, ReplicaStatus, StickyRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, error, info, warn};

use crate::sticky::{PinOutcome, StickyLedger};

const RECOVERED_AT_STARTUP: &str = "incomplete at startup";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("replica not found: {0}")]
    NotFound(ReplicaId),

    #[error("replica already exists: {0}")]
    AlreadyExists(ReplicaId),

    #[error("illegal state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ReplicaId,
        from: ReplicaState,
        to: ReplicaState,
    },

    #[error("replica is incomplete: {0}")]
    Incomplete(ReplicaId),

    #[error("replica is pinned: {0}")]
    Pinned(ReplicaId),

    #[error("timed out waiting for replica {0}")]
    Timeout(ReplicaId),

    #[error("metadata store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt metadata record {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Snapshot of one replica as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaEntry {
    pub id: ReplicaId,
    pub state: ReplicaState,
    pub size: u64,
    pub created_at_millis: u64,
    pub sticky_records: Vec<StickyRecord>,
}

impl ReplicaEntry {
    pub fn is_pinned(&self, now: u64) -> bool {
        self.sticky_records.iter().any(|record| record.is_live(now))
    }

    pub fn is_removable(&self, now: u64) -> bool {
        self.state.is_removable() && !self.is_pinned(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub id: ReplicaId,
    pub old_state: ReplicaState,
    pub new_state: ReplicaState,
    pub reason: String,
}

/// Observer of successful state transitions.
///
/// Called from the repository's dispatcher task, never from inside a
/// mutation. Events of one replica arrive in transition order. A panicking
/// listener is logged and skipped; the others keep receiving events.
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, event: &StateChangeEvent);
}

/// Reports replicas that turned broken.
pub struct BrokenReplicaLogger;

impl StateChangeListener for BrokenReplicaLogger {
    fn state_changed(&self, event: &StateChangeEvent) {
        if event.new_state == ReplicaState::Broken {
            warn!(
                file_id = %event.id,
                previous_state = %event.old_state,
                reason = %event.reason,
                "replica marked broken"
            );
        }
    }
}

/// Whether `setState` may move an entry from `from` to `to`.
pub fn transition_allowed(from: ReplicaState, to: ReplicaState) -> bool {
    use ReplicaState::*;

    matches!(
        (from, to),
        (FromClient | FromPool | FromStore, Cached | Precious)
            | (Precious, Cached)
            | (Cached | Precious, Broken)
            | (Cached | Broken, Removed)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplicaRecord {
    id: ReplicaId,
    state: ReplicaState,
    size: u64,
    created_at_millis: u64,
    #[serde(default)]
    last_reason: Option<String>,
    #[serde(default)]
    sticky: StickyLedger,
    #[serde(skip)]
    removed: bool,
}

impl ReplicaRecord {
    fn new(id: ReplicaId, state: ReplicaState) -> Self {
        Self {
            id,
            state,
            size: 0,
            created_at_millis: unix_millis(),
            last_reason: None,
            sticky: StickyLedger::default(),
            removed: false,
        }
    }

    fn snapshot(&self) -> ReplicaEntry {
        ReplicaEntry {
            id: self.id.clone(),
            state: self.state,
            size: self.size,
            created_at_millis: self.created_at_millis,
            sticky_records: self.sticky.records(),
        }
    }
}

type EntryHandle = Arc<Mutex<ReplicaRecord>>;
type ListenerSet = Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>;

/// Authoritative table of local replicas.
///
/// Every entry sits behind its own lock, so operations on one file are
/// totally ordered while different files proceed in parallel. The index
/// lock is only held to look up or swap handles, never across I/O.
pub struct ReplicaRepository {
    data_dir: PathBuf,
    meta_dir: Option<PathBuf>,
    entries: RwLock<HashMap<ReplicaId, EntryHandle>>,
    events: mpsc::UnboundedSender<StateChangeEvent>,
    listeners: ListenerSet,
}

impl ReplicaRepository {
    /// Opens a persistent repository rooted at `root_dir`, loading every
    /// metadata record found under `meta/`.
    pub async fn open(root_dir: impl Into<PathBuf>) -> RepositoryResult<Self> {
        let root_dir = root_dir.into();
        let data_dir = root_dir.join("data");
        let meta_dir = root_dir.join("meta");

        fs::create_dir_all(&data_dir).await?;
        fs::create_dir_all(&meta_dir).await?;

        let repository = Self::with_dirs(data_dir, Some(meta_dir.clone()));
        let records = load_records(&meta_dir).await?;
        let mut recovered = 0usize;

        for mut record in records {
            if record.state.is_transient() {
                warn!(
                    file_id = %record.id,
                    state = %record.state,
                    "replica was incomplete at startup; marking broken"
                );
                record.state = ReplicaState::Broken;
                record.last_reason = Some(RECOVERED_AT_STARTUP.to_string());
                repository.persist(&record).await?;
                recovered += 1;
            }

            repository
                .entries
                .write()
                .insert(record.id.clone(), Arc::new(Mutex::new(record)));
        }

        info!(
            replicas = repository.len(),
            recovered,
            "replica repository loaded"
        );
        Ok(repository)
    }

    /// A repository whose metadata lives only in memory. Replica bytes
    /// written by transfers still land under `data_dir`.
    pub fn in_memory(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_dirs(data_dir.into(), None)
    }

    fn with_dirs(data_dir: PathBuf, meta_dir: Option<PathBuf>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let listeners: ListenerSet = Arc::new(RwLock::new(Vec::new()));
        tokio::spawn(dispatch_events(receiver, Arc::clone(&listeners)));

        Self {
            data_dir,
            meta_dir,
            entries: RwLock::new(HashMap::new()),
            events,
            listeners,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<_> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn data_path(&self, id: &ReplicaId) -> PathBuf {
        self.data_dir.join(id.as_str())
    }

    pub fn partial_path(&self, id: &ReplicaId) -> PathBuf {
        self.data_dir.join(format!("{id}.part"))
    }

    pub async fn get_entry(&self, id: &ReplicaId) -> RepositoryResult<ReplicaEntry> {
        let mut guard = self.lock(id).await?;
        guard.sticky.purge_expired(unix_millis());
        Ok(guard.snapshot())
    }

    /// Registers a replica that starts arriving from `source`, which must be
    /// one of the arriving states. An absent entry counts as `Removed` when
    /// the initial state is rejected.
    pub async fn create_entry(
        &self,
        id: &ReplicaId,
        source: ReplicaState,
    ) -> RepositoryResult<ReplicaEntry> {
        if !source.is_transient() {
            return Err(RepositoryError::InvalidTransition {
                id: id.clone(),
                from: ReplicaState::Removed,
                to: source,
            });
        }

        let handle: EntryHandle = Arc::new(Mutex::new(ReplicaRecord::new(id.clone(), source)));
        let mut guard = Arc::clone(&handle).lock_owned().await;

        {
            let mut entries = self.entries.write();
            if entries.contains_key(id) {
                return Err(RepositoryError::AlreadyExists(id.clone()));
            }
            entries.insert(id.clone(), Arc::clone(&handle));
        }

        if let Err(err) = self.persist(&guard).await {
            guard.removed = true;
            self.entries.write().remove(id);
            return Err(err);
        }

        info!(file_id = %id, state = %source, "created replica entry");
        self.emit(id, ReplicaState::Removed, source, "entry created");
        Ok(guard.snapshot())
    }

    /// Finishes an arriving replica: records its size and creation time,
    /// installs the given pins and moves it to `target` in one step.
    pub async fn complete_entry(
        &self,
        id: &ReplicaId,
        target: ReplicaState,
        size: u64,
        sticky_records: &[StickyRecord],
    ) -> RepositoryResult<ReplicaEntry> {
        let mut guard = self.lock(id).await?;
        let from = guard.state;
        if !from.is_transient() || !transition_allowed(from, target) {
            return Err(RepositoryError::InvalidTransition {
                id: id.clone(),
                from,
                to: target,
            });
        }

        let now = unix_millis();
        let mut next = guard.clone();
        next.state = target;
        next.size = size;
        next.created_at_millis = now;
        next.last_reason = Some("transfer completed".to_string());
        for record in sticky_records {
            next.sticky.set(&record.owner, record.expiry, true, now);
        }

        self.persist(&next).await?;
        *guard = next;

        info!(file_id = %id, from = %from, to = %target, size, "replica completed");
        self.emit(id, from, target, "transfer completed");
        Ok(guard.snapshot())
    }

    /// Discards an entry that is still arriving, together with any bytes
    /// written so far.
    pub async fn abort_entry(&self, id: &ReplicaId, reason: &str) -> RepositoryResult<()> {
        let mut guard = self.lock(id).await?;
        let from = guard.state;
        if !from.is_transient() {
            return Err(RepositoryError::InvalidTransition {
                id: id.clone(),
                from,
                to: ReplicaState::Removed,
            });
        }

        self.delete_locked(&mut guard).await?;
        warn!(file_id = %id, state = %from, reason, "aborted incoming replica");
        self.emit(id, from, ReplicaState::Removed, reason);
        Ok(())
    }

    pub async fn set_state(
        &self,
        id: &ReplicaId,
        to: ReplicaState,
        reason: &str,
    ) -> RepositoryResult<ReplicaEntry> {
        let mut guard = self.lock(id).await?;
        let from = guard.state;
        if !transition_allowed(from, to) {
            return Err(RepositoryError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        let now = unix_millis();
        if to == ReplicaState::Removed {
            if guard.sticky.is_pinned(now) {
                return Err(RepositoryError::Pinned(id.clone()));
            }
            let snapshot = guard.snapshot();
            self.delete_locked(&mut guard).await?;
            info!(file_id = %id, from = %from, reason, "removed replica");
            self.emit(id, from, to, reason);
            return Ok(ReplicaEntry { state: to, ..snapshot });
        }

        let mut next = guard.clone();
        next.state = to;
        next.last_reason = Some(reason.to_string());
        next.sticky.purge_expired(now);
        self.persist(&next).await?;
        *guard = next;

        info!(file_id = %id, from = %from, to = %to, reason, "replica state changed");
        self.emit(id, from, to, reason);
        Ok(guard.snapshot())
    }

    pub async fn set_sticky(
        &self,
        id: &ReplicaId,
        owner: &str,
        expiry: Expiry,
        overwrite: bool,
    ) -> RepositoryResult<PinOutcome> {
        let mut guard = self.lock(id).await?;
        if guard.state.is_transient() {
            return Err(RepositoryError::Incomplete(id.clone()));
        }

        let mut next = guard.clone();
        let outcome = next.sticky.set(owner, expiry, overwrite, unix_millis());
        if next.sticky != guard.sticky {
            self.persist(&next).await?;
            *guard = next;
        }

        debug!(file_id = %id, owner, ?expiry, ?outcome, "sticky record updated");
        Ok(outcome)
    }

    pub async fn clear_sticky(&self, id: &ReplicaId, owner: &str) -> RepositoryResult<()> {
        self.set_sticky(id, owner, Expiry::EXPIRED, true)
            .await
            .map(|_| ())
    }

    pub async fn is_pinned(&self, id: &ReplicaId) -> RepositoryResult<bool> {
        let guard = self.lock(id).await?;
        Ok(guard.sticky.is_pinned(unix_millis()))
    }

    pub async fn is_removable(&self, id: &ReplicaId) -> RepositoryResult<bool> {
        let guard = self.lock(id).await?;
        Ok(guard.state.is_removable() && !guard.sticky.is_pinned(unix_millis()))
    }

    /// Composite status computed from one locked read of the entry.
    pub async fn status(
        &self,
        id: &ReplicaId,
        sticky_owner: &str,
    ) -> RepositoryResult<ReplicaStatus> {
        let guard = self.lock(id).await?;
        let now = unix_millis();
        let state = guard.state;

        Ok(ReplicaStatus {
            exists: true,
            waiting: state.is_transient(),
            readable: state.is_readable(),
            removable: state.is_removable() && !guard.sticky.is_pinned(now),
            broken: state == ReplicaState::Broken,
            precious: state == ReplicaState::Precious,
            system_sticky: guard.sticky.is_pinned_by(sticky_owner, now),
        })
    }

    /// Applies a state change and a set of pins as one update. Waits at most
    /// `wait` for the entry; on timeout nothing is applied.
    pub async fn update_entry(
        &self,
        id: &ReplicaId,
        state: ReplicaState,
        sticky_records: &[StickyRecord],
        wait: Duration,
    ) -> RepositoryResult<ReplicaEntry> {
        let handle = self.handle(id)?;
        let mut guard = tokio::time::timeout(wait, handle.lock_owned())
            .await
            .map_err(|_| RepositoryError::Timeout(id.clone()))?;
        if guard.removed {
            return Err(RepositoryError::NotFound(id.clone()));
        }

        let from = guard.state;
        if from.is_transient() {
            return Err(RepositoryError::Incomplete(id.clone()));
        }
        if from != state && (state == ReplicaState::Removed || !transition_allowed(from, state)) {
            return Err(RepositoryError::InvalidTransition {
                id: id.clone(),
                from,
                to: state,
            });
        }

        let now = unix_millis();
        let mut next = guard.clone();
        next.state = state;
        for record in sticky_records {
            next.sticky.set(&record.owner, record.expiry, true, now);
        }
        next.sticky.purge_expired(now);

        self.persist(&next).await?;
        *guard = next;

        if from != state {
            info!(file_id = %id, from = %from, to = %state, "replica updated by migration");
            self.emit(id, from, state, "migration update");
        }
        Ok(guard.snapshot())
    }

    /// Ids of replicas that space reclaim may delete right now.
    pub async fn removable(&self) -> Vec<ReplicaId> {
        let now = unix_millis();
        let mut removable = Vec::new();

        for (id, handle) in self.handles() {
            let guard = handle.lock().await;
            if !guard.removed && guard.state.is_removable() && !guard.sticky.is_pinned(now) {
                removable.push(id);
            }
        }

        removable.sort();
        removable
    }

    /// Drops expired pins from every entry. Returns how many were dropped.
    pub async fn purge_expired_sticky(&self) -> RepositoryResult<usize> {
        let now = unix_millis();
        let mut purged = 0usize;

        for (_, handle) in self.handles() {
            let mut guard = handle.lock().await;
            if guard.removed {
                continue;
            }

            let mut next = guard.clone();
            let expired = next.sticky.purge_expired(now);
            if expired.is_empty() {
                continue;
            }

            self.persist(&next).await?;
            *guard = next;
            purged += expired.len();
        }

        Ok(purged)
    }

    fn handle(&self, id: &ReplicaId) -> RepositoryResult<EntryHandle> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    fn handles(&self) -> Vec<(ReplicaId, EntryHandle)> {
        self.entries
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    async fn lock(&self, id: &ReplicaId) -> RepositoryResult<OwnedMutexGuard<ReplicaRecord>> {
        let guard = self.handle(id)?.lock_owned().await;
        if guard.removed {
            return Err(RepositoryError::NotFound(id.clone()));
        }
        Ok(guard)
    }

    async fn delete_locked(&self, guard: &mut ReplicaRecord) -> RepositoryResult<()> {
        if let Some(meta_dir) = &self.meta_dir {
            remove_if_present(&meta_path(meta_dir, &guard.id)).await?;
        }
        remove_if_present(&self.data_path(&guard.id)).await?;
        remove_if_present(&self.partial_path(&guard.id)).await?;

        guard.removed = true;
        self.entries.write().remove(&guard.id);
        Ok(())
    }

    async fn persist(&self, record: &ReplicaRecord) -> RepositoryResult<()> {
        let Some(meta_dir) = &self.meta_dir else {
            return Ok(());
        };

        let payload = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        write_atomic(&meta_path(meta_dir, &record.id), &payload).await?;
        Ok(())
    }

    /// Queues an event while the caller still holds the entry lock, which
    /// keeps per-file delivery in transition order. Never waits on the
    /// dispatcher.
    fn emit(
        &self,
        id: &ReplicaId,
        old_state: ReplicaState,
        new_state: ReplicaState,
        reason: &str,
    ) {
        let event = StateChangeEvent {
            id: id.clone(),
            old_state,
            new_state,
            reason: reason.to_string(),
        };

        if self.events.send(event).is_err() {
            warn!(file_id = %id, "state change dispatcher has stopped");
        }
    }
}

async fn dispatch_events(
    mut receiver: mpsc::UnboundedReceiver<StateChangeEvent>,
    listeners: ListenerSet,
) {
    while let Some(event) = receiver.recv().await {
        let current = listeners.read().clone();
        for listener in current {
            if catch_unwind(AssertUnwindSafe(|| listener.state_changed(&event))).is_err() {
                error!(
                    file_id = %event.id,
                    new_state = %event.new_state,
                    "state change listener panicked"
                );
            }
        }
    }
}

async fn load_records(meta_dir: &Path) -> RepositoryResult<Vec<ReplicaRecord>> {
    let mut entries = fs::read_dir(meta_dir).await?;
    let mut records = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let payload = fs::read(&path).await?;
        let record = serde_json::from_slice::<ReplicaRecord>(&payload).map_err(|err| {
            RepositoryError::Corrupt {
                path: path.clone(),
                message: err.to_string(),
            }
        })?;
        records.push(record);
    }

    Ok(records)
}

fn meta_path(meta_dir: &Path, id: &ReplicaId) -> PathBuf {
    meta_dir.join(format!("{id}.json"))
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) async fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent: {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent).await?;

    let tmp = path.with_extension(format!(
        "tmp-{}-{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ));

    fs::write(&tmp, payload).await?;
    fs::rename(&tmp, path).await
}

/// Unique scratch directory under the system temp dir.
#[cfg(test)]
pub(crate) fn test_dir(name: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("poolmesh-{name}-{unique}"))
}

#[cfg(test)]
#[path = "repository_tests.rs"]
mod tests;
