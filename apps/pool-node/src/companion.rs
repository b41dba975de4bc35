//! Replica byte stream carried over a transfer session.
//!
//! After the session header the sender writes the replica length as a
//! big-endian `u64`, the bytes, and the 32-byte BLAKE3 digest of the bytes.
//! The receiver answers with one status byte.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{ReplicaId, ReplicaState, StickyRecord};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::p2p::{Companion, TransferError};
use crate::repository::ReplicaRepository;

pub const DIGEST_LEN: usize = 32;
pub const STATUS_OK: u8 = 0;
pub const STATUS_FAILED: u8 = 1;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionStatus {
    Waiting,
    Completed,
    Failed,
}

/// Receives one replica into the local repository.
///
/// The entry must already exist in an arriving state. On success the
/// companion moves the bytes into place and completes the entry; it never
/// aborts the entry itself, that is left to whoever owns the session.
pub struct ReplicaCompanion {
    repository: Arc<ReplicaRepository>,
    file_id: ReplicaId,
    target_state: ReplicaState,
    sticky_records: Vec<StickyRecord>,
    cancel: CancellationToken,
    claimed: AtomicBool,
    status: watch::Sender<CompanionStatus>,
    received: watch::Sender<u64>,
}

impl ReplicaCompanion {
    pub fn new(
        repository: Arc<ReplicaRepository>,
        file_id: ReplicaId,
        target_state: ReplicaState,
        sticky_records: Vec<StickyRecord>,
    ) -> Self {
        let (status, _) = watch::channel(CompanionStatus::Waiting);
        let (received, _) = watch::channel(0);
        Self {
            repository,
            file_id,
            target_state,
            sticky_records,
            cancel: CancellationToken::new(),
            claimed: AtomicBool::new(false),
            status,
            received,
        }
    }

    pub fn file_id(&self) -> &ReplicaId {
        &self.file_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CompanionStatus> {
        self.status.subscribe()
    }

    /// Bytes received so far; changes every time a chunk lands.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.received.subscribe()
    }

    async fn receive(&self, stream: &mut TcpStream) -> Result<u64, TransferError> {
        let len = stream.read_u64().await?;
        let partial = self.repository.partial_path(&self.file_id);
        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&partial).await?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = len;

        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let read = stream.read(&mut buf[..want]).await?;
            if read == 0 {
                return Err(TransferError::Protocol(format!(
                    "stream ended with {remaining} of {len} bytes outstanding"
                )));
            }
            hasher.update(&buf[..read]);
            file.write_all(&buf[..read]).await?;
            remaining -= read as u64;
            self.received.send_replace(len - remaining);
        }

        let mut digest = [0u8; DIGEST_LEN];
        stream.read_exact(&mut digest).await?;
        let actual = hasher.finalize();
        if actual.as_bytes() != &digest {
            return Err(TransferError::Integrity(format!(
                "blake3 mismatch for {}: got {}",
                self.file_id,
                actual.to_hex()
            )));
        }

        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, self.repository.data_path(&self.file_id)).await?;

        self.repository
            .complete_entry(&self.file_id, self.target_state, len, &self.sticky_records)
            .await?;
        Ok(len)
    }
}

#[async_trait]
impl Companion for ReplicaCompanion {
    async fn transfer(&self, mut stream: TcpStream) -> Result<(), TransferError> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(TransferError::Protocol(format!(
                "session for {} already has a connection",
                self.file_id
            )));
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.receive(&mut stream) => result,
        };

        match outcome {
            Ok(size) => {
                info!(
                    file_id = %self.file_id,
                    size,
                    state = %self.target_state,
                    "replica received"
                );
                if let Err(err) = stream.write_u8(STATUS_OK).await {
                    debug!(file_id = %self.file_id, error = %err, "sender left before status");
                }
                self.status.send_replace(CompanionStatus::Completed);
                Ok(())
            }
            Err(err) => {
                let partial = self.repository.partial_path(&self.file_id);
                if let Err(remove_err) = fs::remove_file(&partial).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(
                        path = %partial.display(),
                        error = %remove_err,
                        "failed to remove partial replica"
                    );
                }
                let _ = stream.write_u8(STATUS_FAILED).await;
                self.status.send_replace(CompanionStatus::Failed);
                Err(err)
            }
        }
    }
}

/// Streams the file at `path` to a registered session at `addr`.
/// Returns the number of bytes the destination accepted.
pub async fn send_replica(
    addr: SocketAddr,
    session_id: u32,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = stream_file(addr, session_id, path) => result,
    }
}

async fn stream_file(addr: SocketAddr, session_id: u32, path: &Path) -> Result<u64, TransferError> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&session_id.to_be_bytes()).await?;
    stream.write_u64(len).await?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < len {
        let want = (len - sent).min(CHUNK_SIZE as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(TransferError::Integrity(format!(
                "{} shrank to {sent} bytes during transfer",
                path.display()
            )));
        }
        hasher.update(&buf[..read]);
        stream.write_all(&buf[..read]).await?;
        sent += read as u64;
    }

    stream.write_all(hasher.finalize().as_bytes()).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
        STATUS_OK => Ok(len),
        status => Err(TransferError::Protocol(format!(
            "destination rejected transfer with status {status}"
        ))),
    }
}
