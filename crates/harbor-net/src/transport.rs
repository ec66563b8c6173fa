//! Per-service TCP transport.
//!
//! A [`Transport`] owns a multi-threaded tokio runtime whose worker threads
//! (`harbor-io-<label>`) run the accept loops and one reader plus one writer
//! task per session. Everything that happens on those threads is reported
//! through [`TransportEvents`]; the owner decides what to do with frames. The
//! public API is synchronous so it can be called from service threads and
//! host loops that are not inside a tokio context.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use harbor_config::NetworkConfig;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};

use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::session::{
    SESSION_IDS, SessionEntry, SessionId, SessionInfo, SessionOrigin, SessionTable,
};

/// How long [`Transport::shutdown`] waits for writers to drain, and then
/// again for I/O threads to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Framing applied to every session.
    pub frame: FrameConfig,
    /// Maximum concurrent sessions. Default: 1024.
    pub max_sessions: usize,
    /// Timeout for blocking and asynchronous connects. Default: 5s.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            max_sessions: 1024,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&NetworkConfig> for TransportConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            frame: FrameConfig {
                max_payload_size: config.max_payload_size,
                read_buffer_size: config.read_buffer_size,
                ..FrameConfig::default()
            },
            max_sessions: config.max_sessions,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

/// Errors returned by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket or runtime I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session does not exist or has already closed.
    #[error("invalid session {0}")]
    InvalidSession(SessionId),

    /// A blocking connect did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// The session table is full.
    #[error("session limit reached")]
    SessionLimitReached,

    /// The transport has been shut down.
    #[error("transport is shut down")]
    ShutDown,
}

/// Outcome of [`Transport::async_connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncConnResult {
    /// Address that was dialled.
    pub peer: SocketAddr,
    /// The new session, or a description of the failure.
    pub result: Result<SessionId, String>,
}

/// Callbacks invoked by the transport, usually from its I/O threads.
///
/// Implementations must be cheap and must not block: they run inside the
/// reader tasks, so a slow callback stalls that session.
pub trait TransportEvents: Send + Sync + 'static {
    /// A session was opened. Always reported before any of its frames.
    fn on_session_created(&self, session: &SessionInfo);

    /// A session closed, locally or remotely.
    fn on_session_destroyed(&self, session: &SessionInfo, reason: &str);

    /// A complete frame arrived. Frames of one session arrive in order.
    fn on_frame(&self, session_id: SessionId, frame: Bytes);

    /// An asynchronous connect finished.
    fn on_async_conn_result(&self, result: AsyncConnResult);
}

/// State shared between the transport handle and its tasks.
struct Shared {
    label: String,
    handle: Handle,
    sessions: SessionTable,
    events: Arc<dyn TransportEvents>,
    frame: FrameConfig,
    shutdown_tx: watch::Sender<bool>,
    /// Number of writer tasks still running.
    writers: watch::Sender<usize>,
}

/// Keeps a writer task counted in [`Shared::writers`] until it is dropped.
struct WriterGuard(Arc<Shared>);

impl WriterGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.writers.send_modify(|n| *n += 1);
        Self(Arc::clone(shared))
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.0.writers.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// TCP transport owning its I/O runtime and session table.
pub struct Transport {
    config: TransportConfig,
    runtime: Mutex<Option<Runtime>>,
    shared: Arc<Shared>,
}

impl Transport {
    /// Build a transport with `worker_count` I/O threads (at least one).
    pub fn new(
        label: &str,
        worker_count: usize,
        config: TransportConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_count.max(1))
            .thread_name(format!("harbor-io-{label}"))
            .enable_io()
            .enable_time()
            .build()?;

        let (shutdown_tx, _) = watch::channel(false);
        let (writers, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            label: label.to_string(),
            handle: runtime.handle().clone(),
            sessions: SessionTable::new(config.max_sessions),
            events,
            frame: config.frame.clone(),
            shutdown_tx,
            writers,
        });

        tracing::debug!(
            "Transport {label} started with {} I/O workers",
            worker_count.max(1)
        );

        Ok(Self {
            config,
            runtime: Mutex::new(Some(runtime)),
            shared,
        })
    }

    /// Bind `addr` and accept sessions in the background.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was
    /// requested.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        self.ensure_running()?;

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;

        let _guard = self.shared.handle.enter();
        let listener = TcpListener::from_std(std_listener)?;
        let shared = Arc::clone(&self.shared);
        self.shared.handle.spawn(async move {
            shared.accept_loop(listener).await;
        });

        tracing::info!("Transport {} listening on {local}", self.shared.label);
        Ok(local)
    }

    /// Connect to `addr`, blocking the caller until the session is open or
    /// the connect timeout expires.
    pub fn connect(&self, addr: SocketAddr) -> Result<SessionId, TransportError> {
        self.ensure_running()?;

        let std_stream = std::net::TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    TransportError::ConnectTimeout(addr)
                } else {
                    TransportError::Io(e)
                }
            })?;
        std_stream.set_nonblocking(true)?;

        let _guard = self.shared.handle.enter();
        let stream = TcpStream::from_std(std_stream)?;
        let info = self.shared.open_session(stream, SessionOrigin::Connected)?;
        Ok(info.id)
    }

    /// Start connecting to `addr` without blocking. The outcome is reported
    /// through [`TransportEvents::on_async_conn_result`].
    pub fn async_connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        self.ensure_running()?;

        let shared = Arc::clone(&self.shared);
        let timeout = self.config.connect_timeout;
        self.shared.handle.spawn(async move {
            let result = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => shared
                    .open_session(stream, SessionOrigin::AsyncConnected)
                    .map(|info| info.id)
                    .map_err(|e| e.to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("connect to {addr} timed out")),
            };
            if let Err(ref reason) = result {
                tracing::debug!("Async connect to {addr} failed: {reason}");
            }
            shared
                .events
                .on_async_conn_result(AsyncConnResult { peer: addr, result });
        });
        Ok(())
    }

    /// Whether `id` names a live session of this transport.
    pub fn is_session_valid(&self, id: SessionId) -> bool {
        self.shared.sessions.contains(id)
    }

    /// Close a session. Frames already queued are still written.
    pub fn remove_session(&self, id: SessionId, reason: &str) -> Result<(), TransportError> {
        let entry = self
            .shared
            .sessions
            .remove(id)
            .ok_or(TransportError::InvalidSession(id))?;
        entry.close_tx.send_replace(Some(reason.to_string()));
        tracing::debug!("Session {id} removed: {reason}");
        Ok(())
    }

    /// Largest frame the writers accept. Larger frames fail in the writer
    /// and close their session.
    pub fn max_frame_size(&self) -> u32 {
        self.config.frame.max_payload_size
    }

    /// Queue one frame on a session.
    pub fn send(&self, id: SessionId, frame: Bytes) -> Result<(), TransportError> {
        self.ensure_running()?;
        if self.shared.sessions.enqueue(id, frame) {
            Ok(())
        } else {
            Err(TransportError::InvalidSession(id))
        }
    }

    /// Queue one frame on every live session. Returns how many accepted it.
    pub fn broadcast(&self, frame: Bytes) -> usize {
        self.shared
            .sessions
            .ids()
            .into_iter()
            .filter(|id| self.shared.sessions.enqueue(*id, frame.clone()))
            .count()
    }

    /// Ids of all live sessions, ascending.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.shared.sessions.ids()
    }

    /// Descriptive data for a live session.
    pub fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        self.shared.sessions.info(id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        *self.shared.shutdown_tx.borrow()
    }

    /// Close every session and stop the I/O threads.
    ///
    /// Frames queued before the call are written out first, waiting at most
    /// [`SHUTDOWN_GRACE`] for the writers. Blocks until the runtime's threads
    /// have exited, so no [`TransportEvents`] callback runs after this
    /// returns. Must not be called from inside an async context. Idempotent.
    pub fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        self.shared.shutdown_tx.send_replace(true);
        self.shared.sessions.close_all("transport shutdown");

        let mut writers = self.shared.writers.subscribe();
        let drained = runtime.block_on(async {
            matches!(
                tokio::time::timeout(SHUTDOWN_GRACE, writers.wait_for(|n| *n == 0)).await,
                Ok(Ok(_))
            )
        });
        if !drained {
            tracing::warn!(
                "Transport {}: {} writers still busy after {SHUTDOWN_GRACE:?}",
                self.shared.label,
                *self.shared.writers.borrow()
            );
        }

        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        tracing::debug!("Transport {} shut down", self.shared.label);
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_shut_down() {
            Err(TransportError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = self.open_session(stream, SessionOrigin::Accepted) {
                                tracing::warn!("Rejecting connection from {peer_addr}: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("Accept failed on {}: {e}", self.label),
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Register a connected stream and spawn its reader and writer tasks.
    ///
    /// The created event is emitted here, before the reader starts, so it
    /// always precedes the session's frames. Must run inside the runtime
    /// context.
    fn open_session(
        self: &Arc<Self>,
        stream: TcpStream,
        origin: SessionOrigin,
    ) -> Result<SessionInfo, TransportError> {
        stream.set_nodelay(true)?;
        let info = SessionInfo {
            id: SESSION_IDS.next_id(),
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
            origin,
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);
        self.sessions
            .insert(SessionEntry {
                info: info.clone(),
                outbound,
                close_tx,
            })
            .map_err(|_| TransportError::SessionLimitReached)?;

        tracing::debug!(
            "Session {} opened ({:?}) {} -> {}",
            info.id,
            origin,
            info.local_addr,
            info.peer_addr
        );
        self.events.on_session_created(&info);

        let (reader, writer) = stream.into_split();
        let guard = WriterGuard::new(self);
        let shared = Arc::clone(self);
        let id = info.id;
        self.handle.spawn(async move {
            shared.run_writer(id, writer, outbound_rx, guard).await;
        });

        let shared = Arc::clone(self);
        let task_info = info.clone();
        self.handle.spawn(async move {
            shared.run_reader(task_info, reader, close_rx).await;
        });
        Ok(info)
    }

    /// Per-session writer loop. Runs until the outbound queue closes, which
    /// happens once the session leaves the table, so queued frames are
    /// written before the socket is shut down.
    async fn run_writer(
        self: Arc<Self>,
        id: SessionId,
        mut writer: OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
        _guard: WriterGuard,
    ) {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame, &self.frame).await {
                let reason = format!("write error: {e}");
                tracing::debug!("Session {id} {reason}");
                if let Some(entry) = self.sessions.remove(id) {
                    entry.close_tx.send_replace(Some(reason));
                }
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Per-session reader loop. Reports the destroyed event when it ends.
    async fn run_reader(
        self: Arc<Self>,
        info: SessionInfo,
        mut reader: OwnedReadHalf,
        mut close_rx: watch::Receiver<Option<String>>,
    ) {
        let id = info.id;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reason = loop {
            tokio::select! {
                result = read_frame(&mut reader, &self.frame) => {
                    match result {
                        Ok(frame) => self.events.on_frame(id, frame),
                        Err(FrameError::ConnectionClosed) => break "closed by peer".to_string(),
                        Err(e) => break format!("read error: {e}"),
                    }
                }
                _ = close_rx.changed() => {
                    break close_rx
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "closed".to_string());
                }
                _ = shutdown_rx.changed() => break "transport shutdown".to_string(),
            }
        };

        // Dropping the entry closes the outbound queue, which lets the writer
        // drain what is left and shut the socket down.
        self.sessions.remove(id);
        tracing::debug!("Session {id} closed: {reason}");
        self.events.on_session_destroyed(&info, &reason);
    }
}
