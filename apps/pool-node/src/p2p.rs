use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::repository::RepositoryError;

pub const FIRST_SESSION_ID: u32 = 100;
pub const SESSION_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to bind transfer listener: {0}")]
    Bind(String),

    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transfer protocol violation: {0}")]
    Protocol(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transferred data failed verification: {0}")]
    Integrity(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Handler for one in-flight pool-to-pool transfer.
///
/// The acceptor hands over the connection right after the session header.
#[async_trait]
pub trait Companion: Send + Sync {
    async fn transfer(&self, stream: TcpStream) -> Result<(), TransferError>;
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub bind_addr: IpAddr,
    /// Fixed port. Takes precedence over `port_range`.
    pub port: Option<u16>,
    pub port_range: Option<RangeInclusive<u16>>,
    pub header_timeout: Duration,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: None,
            port_range: None,
            header_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    NotStarted,
    Listening,
    Stopped,
}

/// Where a peer has to connect for a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub session_id: u32,
    pub addr: SocketAddr,
}

struct SessionTable {
    next_id: u32,
    companions: HashMap<u32, Arc<dyn Companion>>,
}

impl SessionTable {
    fn insert(&mut self, companion: Arc<dyn Companion>) -> u32 {
        let mut id = self.next_id;
        while self.companions.contains_key(&id) {
            id = id.checked_add(1).unwrap_or(FIRST_SESSION_ID);
        }
        self.next_id = id.checked_add(1).unwrap_or(FIRST_SESSION_ID);
        self.companions.insert(id, companion);
        id
    }
}

struct ListenerSlot {
    state: AcceptorState,
    local_addr: Option<SocketAddr>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Demultiplexes inbound transfer connections by session id.
///
/// The socket is bound lazily on the first registration and closed when
/// the last session goes away. The session table lock is never held across
/// I/O; binding and teardown are serialised on a separate async lock.
pub struct TransferAcceptor {
    config: AcceptorConfig,
    sessions: Arc<Mutex<SessionTable>>,
    listener: tokio::sync::Mutex<ListenerSlot>,
}

impl TransferAcceptor {
    pub fn new(config: AcceptorConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(SessionTable {
                next_id: FIRST_SESSION_ID,
                companions: HashMap::new(),
            })),
            listener: tokio::sync::Mutex::new(ListenerSlot {
                state: AcceptorState::NotStarted,
                local_addr: None,
                stop: CancellationToken::new(),
                task: None,
            }),
        }
    }

    /// Registers `companion` and makes sure the acceptor is listening.
    ///
    /// A bind failure is returned to the caller and the session is dropped.
    pub async fn register(
        &self,
        companion: Arc<dyn Companion>,
    ) -> Result<Registration, TransferError> {
        let session_id = self.sessions.lock().insert(companion);

        let mut slot = self.listener.lock().await;
        if slot.state != AcceptorState::Listening
            && let Err(err) = self.start(&mut slot).await
        {
            self.sessions.lock().companions.remove(&session_id);
            error!(error = %err, "transfer acceptor could not start");
            return Err(err);
        }

        let Some(addr) = slot.local_addr else {
            self.sessions.lock().companions.remove(&session_id);
            return Err(TransferError::Bind("listener has no local address".to_string()));
        };

        debug!(session_id, %addr, "registered transfer session");
        Ok(Registration { session_id, addr })
    }

    /// Drops the session. Returns whether it was registered.
    pub async fn unregister(&self, session_id: u32) -> bool {
        let removed = self.sessions.lock().companions.remove(&session_id).is_some();
        if !removed {
            return false;
        }
        debug!(session_id, "unregistered transfer session");

        let mut slot = self.listener.lock().await;
        let idle = self.sessions.lock().companions.is_empty();
        if idle && slot.state == AcceptorState::Listening {
            Self::stop(&mut slot).await;
        }
        true
    }

    /// Stops listening whatever sessions are registered.
    pub async fn shutdown(&self) {
        let mut slot = self.listener.lock().await;
        if slot.state == AcceptorState::Listening {
            Self::stop(&mut slot).await;
        }
    }

    pub async fn state(&self) -> AcceptorState {
        self.listener.lock().await.state
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().companions.len()
    }

    async fn start(&self, slot: &mut ListenerSlot) -> Result<(), TransferError> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();

        slot.task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.sessions),
            self.config.header_timeout,
            stop.clone(),
        )));
        slot.stop = stop;
        slot.local_addr = Some(local_addr);
        slot.state = AcceptorState::Listening;

        info!(%local_addr, "transfer acceptor listening");
        Ok(())
    }

    async fn stop(slot: &mut ListenerSlot) {
        slot.stop.cancel();
        if let Some(task) = slot.task.take()
            && let Err(err) = task.await
        {
            warn!(error = %err, "transfer accept loop ended abnormally");
        }
        info!(local_addr = ?slot.local_addr, "transfer acceptor stopped");
        slot.local_addr = None;
        slot.state = AcceptorState::Stopped;
    }

    async fn bind(&self) -> Result<TcpListener, TransferError> {
        let addr = self.config.bind_addr;

        if let Some(port) = self.config.port {
            return TcpListener::bind((addr, port))
                .await
                .map_err(|err| TransferError::Bind(format!("{addr}:{port}: {err}")));
        }

        let Some(range) = self.config.port_range.clone() else {
            return TcpListener::bind((addr, 0))
                .await
                .map_err(|err| TransferError::Bind(format!("{addr}:0: {err}")));
        };

        let (first, last) = (*range.start(), *range.end());
        for port in range {
            match TcpListener::bind((addr, port)).await {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, "transfer port in use, trying next");
                }
                Err(err) => return Err(TransferError::Bind(format!("{addr}:{port}: {err}"))),
            }
        }
        Err(TransferError::Bind(format!(
            "no free port in {addr}:{first}-{last}"
        )))
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<Mutex<SessionTable>>,
    header_timeout: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&sessions),
                        header_timeout,
                    ));
                }
                Err(err) => warn!(error = %err, "failed to accept transfer connection"),
            },
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    sessions: Arc<Mutex<SessionTable>>,
    header_timeout: Duration,
) {
    let mut header = [0u8; SESSION_HEADER_LEN];
    match tokio::time::timeout(header_timeout, stream.read_exact(&mut header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            warn!(%peer, error = %err, "transfer connection closed before session header");
            return;
        }
        Err(_) => {
            warn!(%peer, "timed out waiting for transfer session header");
            return;
        }
    }

    let session_id = u32::from_be_bytes(header);
    let companion = sessions.lock().companions.get(&session_id).cloned();
    let Some(companion) = companion else {
        warn!(%peer, session_id, "dropping connection for unknown transfer session");
        return;
    };

    debug!(%peer, session_id, "transfer connection accepted");
    if let Err(err) = companion.transfer(stream).await {
        warn!(%peer, session_id, error = %err, "transfer failed");
    }
}

#[cfg(test)]
#[path = "p2p_tests.rs"]
mod tests;
