use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use common::{
    ChangePreciousBit, ChangeStickyBit, ErrorKind, ErrorReply, ForceSystemStickyBit, HealthStatus,
    MigrationCancel, MigrationCancelReply, MigrationCopyReplica, MigrationCopyReply,
    MigrationJobReport, MigrationJobRequest, MigrationUpdateReplica, PoolCostPair, PoolInfo,
    PoolQuery, PoolQueryReply, PoolTarget, RemoveReplica, ReplicaId, ReplicaState, ReplicaStatus,
    ReplicaStatusRequest,
};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// A typed failure returned by a pool node.
#[derive(Debug, Clone, Error)]
#[error("pool replied {status}: {} ({:?})", reply.message, reply.kind)]
pub struct RemoteError {
    pub status: StatusCode,
    pub reply: ErrorReply,
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        self.reply.kind
    }
}

/// Returns the remote error kind carried by `err`, if any.
pub fn remote_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<RemoteError>().map(RemoteError::kind)
}

/// Client for one pool node's message endpoints.
#[derive(Clone)]
pub struct PoolClient {
    http: Client,
    base_url: String,
}

impl PoolClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(Client::new(), base_url)
    }

    pub fn with_http(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .with_context(|| format!("failed to reach pool at {}", self.base_url))?;
        decode(response).await
    }

    pub async fn pools(&self) -> Result<Vec<PoolCostPair>> {
        let response = self
            .http
            .get(format!("{}/pools", self.base_url))
            .send()
            .await
            .context("failed to fetch pool list")?;
        decode(response).await
    }

    /// Writes a replica through the local write path and completes it in
    /// `state`.
    pub async fn put_replica(
        &self,
        file_id: &ReplicaId,
        state: ReplicaState,
        data: Bytes,
    ) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/replicas/{}", self.base_url, file_id))
            .query(&[("state", state.as_str())])
            .body(data)
            .send()
            .await
            .with_context(|| format!("failed to PUT replica file_id={file_id}"))?;
        expect_success(response).await
    }

    pub async fn change_sticky_bit(&self, message: &ChangeStickyBit) -> Result<()> {
        self.post_empty("/qos/change-sticky-bit", message).await
    }

    pub async fn change_precious_bit(&self, message: &ChangePreciousBit) -> Result<()> {
        self.post_empty("/qos/change-precious-bit", message).await
    }

    pub async fn qos_status(&self, message: &ReplicaStatusRequest) -> Result<ReplicaStatus> {
        self.post("/qos/replica-status", message).await
    }

    pub async fn force_system_sticky(&self, message: &ForceSystemStickyBit) -> Result<()> {
        self.post_empty("/resilience/force-system-sticky", message)
            .await
    }

    pub async fn resilience_status(&self, message: &ReplicaStatusRequest) -> Result<ReplicaStatus> {
        self.post("/resilience/replica-status", message).await
    }

    pub async fn remove_replica(&self, message: &RemoveReplica) -> Result<()> {
        self.post_empty("/resilience/remove-replica", message).await
    }

    pub async fn migration_copy(
        &self,
        message: &MigrationCopyReplica,
    ) -> Result<MigrationCopyReply> {
        self.post("/migration/copy", message).await
    }

    pub async fn migration_update(&self, message: &MigrationUpdateReplica) -> Result<()> {
        self.post_empty("/migration/update", message).await
    }

    pub async fn migration_cancel(
        &self,
        message: &MigrationCancel,
    ) -> Result<MigrationCancelReply> {
        self.post("/migration/cancel", message).await
    }

    /// Asks the pool to migrate one of its replicas and waits for the job.
    pub async fn start_migration(
        &self,
        message: &MigrationJobRequest,
    ) -> Result<MigrationJobReport> {
        self.post("/migration/jobs", message).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(path, body).await?;
        decode(response).await
    }

    async fn post_empty<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.send(path, body).await?;
        expect_success(response).await
    }

    async fn send<B: Serialize>(&self, path: &str, body: &B) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "sending pool message");
        self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to send message to {url}"))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .context("failed to decode pool reply")
}

async fn expect_success(response: Response) -> Result<()> {
    check_status(response).await.map(|_| ())
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    let reply = serde_json::from_slice::<ErrorReply>(&body).unwrap_or_else(|_| ErrorReply {
        kind: ErrorKind::Internal,
        message: String::from_utf8_lossy(&body).into_owned(),
    });
    Err(RemoteError { status, reply }.into())
}

#[derive(Debug, Error)]
pub enum PoolManagerError {
    #[error("no route to pool manager: {0}")]
    NoRoute(String),

    #[error("pool manager query timed out")]
    Timeout,

    #[error("pool manager returned an error: {0}")]
    ErrorReply(String),

    #[error("undecodable pool manager reply: {0}")]
    Decode(String),
}

/// Central service that knows every pool and its current costs.
#[async_trait]
pub trait PoolManager: Send + Sync {
    async fn query_pools(&self, target: &PoolTarget) -> Result<Vec<PoolInfo>, PoolManagerError>;
}

/// `PoolManager` reached over HTTP at `POST {base}/pools/query`.
#[derive(Clone)]
pub struct PoolManagerClient {
    http: Client,
    base_url: String,
}

impl PoolManagerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PoolManager for PoolManagerClient {
    async fn query_pools(&self, target: &PoolTarget) -> Result<Vec<PoolInfo>, PoolManagerError> {
        let query = PoolQuery {
            target: target.clone(),
        };
        let response = self
            .http
            .post(format!("{}/pools/query", self.base_url))
            .json(&query)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PoolManagerError::Timeout
                } else {
                    PoolManagerError::NoRoute(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PoolManagerError::ErrorReply(format!("{status}: {body}")));
        }

        let reply = response
            .json::<PoolQueryReply>()
            .await
            .map_err(|err| PoolManagerError::Decode(err.to_string()))?;
        Ok(reply.pools)
    }
}
