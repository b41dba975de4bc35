use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Owner name used for pins placed on behalf of the pool itself.
pub const SYSTEM_STICKY_OWNER: &str = "system";

/// Owner name the migration source uses to keep a replica while it is copied.
pub const MIGRATION_STICKY_OWNER: &str = "migration";

const MAX_REPLICA_ID_LEN: usize = 128;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid replica id {0:?}: expected 1-128 characters of [A-Za-z0-9_.-]")]
pub struct InvalidReplicaId(pub String);

/// Opaque identifier of a file held by a pool.
///
/// Restricted to a path-safe alphabet because the id names the replica's
/// metadata and data files on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidReplicaId> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= MAX_REPLICA_ID_LEN
            && !value.starts_with('.')
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidReplicaId(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ReplicaId {
    type Error = InvalidReplicaId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ReplicaId> for String {
    fn from(value: ReplicaId) -> Self {
        value.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a local replica.
///
/// `FromClient`, `FromPool` and `FromStore` are the arriving states, one per
/// data source. `Removed` never appears on a live entry; it is the target of
/// the removal transition and shows up in state change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    FromClient,
    FromPool,
    FromStore,
    Cached,
    Precious,
    Broken,
    Removed,
}

impl ReplicaState {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::FromClient | Self::FromPool | Self::FromStore)
    }

    pub fn is_stable(self) -> bool {
        matches!(self, Self::Cached | Self::Precious | Self::Broken)
    }

    /// States from which space reclaim may delete the replica, provided no
    /// pin is live.
    pub fn is_removable(self) -> bool {
        matches!(self, Self::Cached | Self::Broken)
    }

    pub fn is_readable(self) -> bool {
        matches!(self, Self::Cached | Self::Precious)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FromClient => "from_client",
            Self::FromPool => "from_pool",
            Self::FromStore => "from_store",
            Self::Cached => "cached",
            Self::Precious => "precious",
            Self::Broken => "broken",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expiry of a sticky record: never, or an absolute unix time in millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    Never,
    At(u64),
}

impl Expiry {
    /// An expiry that lies in the past for any realistic clock.
    pub const EXPIRED: Expiry = Expiry::At(0);

    pub fn is_live(self, now_millis: u64) -> bool {
        match self {
            Self::Never => true,
            Self::At(at) => at > now_millis,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    pub expiry: Expiry,
}

impl StickyRecord {
    pub fn new(owner: impl Into<String>, expiry: Expiry) -> Self {
        Self {
            owner: owner.into(),
            expiry,
        }
    }

    pub fn is_live(&self, now_millis: u64) -> bool {
        self.expiry.is_live(now_millis)
    }
}

/// One pool as reported by the pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    /// Base URL of the pool's message endpoint.
    pub address: String,
    pub space_cost: f64,
    pub cpu_cost: f64,
}

/// A candidate pool together with its current cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCostPair {
    pub name: String,
    pub address: String,
    pub cost: f64,
}

/// Which pools the pool manager should return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PoolTarget {
    Group(String),
    Link(String),
    Names(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolQuery {
    pub target: PoolTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolQueryReply {
    pub pools: Vec<PoolInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStickyBit {
    pub file_id: ReplicaId,
    pub sticky: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePreciousBit {
    pub file_id: ReplicaId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceSystemStickyBit {
    pub file_id: ReplicaId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveReplica {
    pub file_id: ReplicaId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatusRequest {
    pub file_id: ReplicaId,
    /// Pin owner reported in `system_sticky`; defaults to `"system"`.
    #[serde(default)]
    pub sticky_owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub exists: bool,
    pub waiting: bool,
    pub readable: bool,
    pub removable: bool,
    pub broken: bool,
    pub precious: bool,
    pub system_sticky: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCopyReplica {
    pub uuid: Uuid,
    pub source_pool: String,
    pub file_id: ReplicaId,
    pub target_state: ReplicaState,
    pub sticky_records: Vec<StickyRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationCopyReply {
    Accepted {
        session_id: u32,
        host: String,
        port: u16,
    },
    AlreadyPresent {
        state: ReplicaState,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationUpdateReplica {
    pub file_id: ReplicaId,
    pub state: ReplicaState,
    pub sticky_records: Vec<StickyRecord>,
    pub time_to_live_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCancel {
    pub uuid: Uuid,
    pub pool_name: String,
    pub file_id: ReplicaId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCancelReply {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJobRequest {
    pub file_id: ReplicaId,
    pub mode: MigrationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJobReport {
    pub uuid: Uuid,
    pub file_id: ReplicaId,
    pub destination: String,
    pub bytes_sent: u64,
    pub already_present: bool,
    pub source_removed: bool,
}

/// Failure kinds carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidTransition,
    Incomplete,
    Pinned,
    Timeout,
    Cancelled,
    BadRequest,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub pool_name: String,
    pub role: String,
    pub online: bool,
}
