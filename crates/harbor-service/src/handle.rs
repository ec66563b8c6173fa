//! The cloneable [`ServiceHandle`] given to facades, handlers and timers.
//!
//! The handle exposes everything that is safe to do from inside a tick or
//! from another thread: session operations, sends, timers and the frame rate.
//! Outgoing packets are encoded immediately and queued; the tick flushes the
//! queue into the transport.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use harbor_config::{DriveMode, ServiceKind};
use harbor_net::{SessionId, SessionInfo, Transport};
use parking_lot::RwLock;

use crate::codec::Coder;
use crate::delegates::PacketDelegates;
use crate::error::ServiceError;
use crate::timer::TimerScheduler;

/// Process-unique service identifier, assigned from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u32);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Built, never started.
    Created,
    /// Running.
    Started,
    /// A stop failed in a facade's `on_stop`; `stop` must be called again.
    Stopping,
    /// Stopped; may be started again.
    Stopped,
}

/// A frame waiting to be handed to the transport.
#[derive(Debug)]
pub(crate) enum Outbound {
    Unicast(SessionId, Bytes),
    Multicast(Vec<SessionId>, Bytes),
    Broadcast(Bytes),
}

pub(crate) struct Shared {
    pub(crate) id: ServiceId,
    pub(crate) name: String,
    pub(crate) kind: ServiceKind,
    pub(crate) fps: AtomicU32,
    pub(crate) drive_mode: RwLock<DriveMode>,
    pub(crate) state: RwLock<ServiceState>,
    pub(crate) transport: RwLock<Option<Arc<Transport>>>,
    pub(crate) timers: TimerScheduler,
    pub(crate) outbound_tx: Sender<Outbound>,
    pub(crate) delegates: Arc<PacketDelegates>,
}

/// Shared view of a service.
#[derive(Clone)]
pub struct ServiceHandle {
    pub(crate) shared: Arc<Shared>,
}

impl ServiceHandle {
    /// Service id.
    pub fn id(&self) -> ServiceId {
        self.shared.id
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Framing kind.
    pub fn kind(&self) -> ServiceKind {
        self.shared.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.shared.state.read()
    }

    /// Current drive mode.
    pub fn drive_mode(&self) -> DriveMode {
        *self.shared.drive_mode.read()
    }

    /// Target ticks per second.
    pub fn fps(&self) -> u32 {
        self.shared.fps.load(Ordering::Relaxed)
    }

    /// Change the frame rate. Takes effect from the next frame.
    pub fn set_fps(&self, fps: u32) -> Result<(), ServiceError> {
        if fps == 0 {
            return Err(ServiceError::InvalidFps);
        }
        self.shared.fps.store(fps, Ordering::Relaxed);
        Ok(())
    }

    /// Time budget of one frame: `1000 / fps` milliseconds, at least 1 ms.
    pub fn frame_interval(&self) -> Duration {
        frame_interval(self.fps())
    }

    /// The service's timer queue.
    pub fn timers(&self) -> &TimerScheduler {
        &self.shared.timers
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Accept sessions on `ip:port`. Returns the bound address.
    pub fn listen(&self, ip: &str, port: u16) -> Result<SocketAddr, ServiceError> {
        let addr = parse_addr(ip, port)?;
        let transport = self.started_transport()?;
        transport.listen(addr).map_err(ServiceError::from_transport)
    }

    /// Connect to `ip:port`, blocking until the session is open.
    pub fn connect(&self, ip: &str, port: u16) -> Result<SessionId, ServiceError> {
        let addr = parse_addr(ip, port)?;
        let transport = self.started_transport()?;
        transport.connect(addr).map_err(ServiceError::from_transport)
    }

    /// Start connecting to `ip:port`. Facades learn the outcome through
    /// `on_async_conn_result`.
    pub fn async_conn(&self, ip: &str, port: u16) -> Result<(), ServiceError> {
        let addr = parse_addr(ip, port)?;
        let transport = self.started_transport()?;
        transport
            .async_connect(addr)
            .map_err(ServiceError::from_transport)
    }

    /// Whether `session_id` is a live session of this service.
    pub fn is_session_valid(&self, session_id: SessionId) -> bool {
        self.transport()
            .is_some_and(|transport| transport.is_session_valid(session_id))
    }

    /// Details of a live session.
    pub fn session_info(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.transport()?.session_info(session_id)
    }

    /// Ids of all live sessions.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.transport()
            .map(|transport| transport.session_ids())
            .unwrap_or_default()
    }

    /// Close a session. Frames already flushed to it are still written.
    pub fn remove_session(&self, session_id: SessionId, reason: &str) -> Result<(), ServiceError> {
        let transport = self.active_transport()?;
        transport
            .remove_session(session_id, reason)
            .map_err(ServiceError::from_transport)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue a packet for one session.
    pub fn send<C: Coder>(
        &self,
        session_id: SessionId,
        opcode: u32,
        body: &C,
        status: i32,
    ) -> Result<(), ServiceError> {
        let transport = self.active_transport()?;
        if !transport.is_session_valid(session_id) {
            return Err(ServiceError::InvalidSession(session_id));
        }
        let frame = self.encode(&transport, opcode, body, status)?;
        self.enqueue(Outbound::Unicast(session_id, frame))
    }

    /// Queue one packet for several sessions. Unknown ids are skipped at
    /// flush time.
    pub fn multicast<C: Coder>(
        &self,
        session_ids: &[SessionId],
        opcode: u32,
        body: &C,
        status: i32,
    ) -> Result<(), ServiceError> {
        let transport = self.active_transport()?;
        if session_ids.is_empty() {
            return Ok(());
        }
        let frame = self.encode(&transport, opcode, body, status)?;
        self.enqueue(Outbound::Multicast(session_ids.to_vec(), frame))
    }

    /// Queue one packet for every session alive at flush time.
    pub fn broadcast<C: Coder>(&self, opcode: u32, body: &C, status: i32) -> Result<(), ServiceError> {
        let transport = self.active_transport()?;
        let frame = self.encode(&transport, opcode, body, status)?;
        self.enqueue(Outbound::Broadcast(frame))
    }

    /// Encode a packet, refusing frames the transport's writers would reject.
    fn encode<C: Coder>(
        &self,
        transport: &Transport,
        opcode: u32,
        body: &C,
        status: i32,
    ) -> Result<Bytes, ServiceError> {
        let mut payload = BytesMut::new();
        body.encode(&mut payload);
        let frame = (self.shared.delegates.encode)(opcode, &payload, status);
        let max = transport.max_frame_size();
        if frame.len() > max as usize {
            return Err(ServiceError::PayloadTooLarge {
                size: frame.len(),
                max,
            });
        }
        Ok(frame)
    }

    fn enqueue(&self, item: Outbound) -> Result<(), ServiceError> {
        self.shared
            .outbound_tx
            .send(item)
            .map_err(|_| ServiceError::NotStarted)
    }

    // -----------------------------------------------------------------------
    // Transport slot
    // -----------------------------------------------------------------------

    pub(crate) fn transport(&self) -> Option<Arc<Transport>> {
        self.shared.transport.read().clone()
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        *self.shared.state.write() = state;
    }

    pub(crate) fn install_transport(&self, transport: Arc<Transport>) {
        *self.shared.transport.write() = Some(transport);
    }

    pub(crate) fn take_transport(&self) -> Option<Arc<Transport>> {
        self.shared.transport.write().take()
    }

    /// Transport for operations that open sessions; needs `Started`.
    fn started_transport(&self) -> Result<Arc<Transport>, ServiceError> {
        if self.state() != ServiceState::Started {
            return Err(ServiceError::NotStarted);
        }
        self.transport().ok_or(ServiceError::NotStarted)
    }

    /// Transport for sends and removals; also usable from `on_stop` while a
    /// stop is in progress.
    fn active_transport(&self) -> Result<Arc<Transport>, ServiceError> {
        match self.state() {
            ServiceState::Started | ServiceState::Stopping => {
                self.transport().ok_or(ServiceError::NotStarted)
            }
            ServiceState::Created | ServiceState::Stopped => Err(ServiceError::NotStarted),
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn frame_interval(fps: u32) -> Duration {
    Duration::from_millis(u64::from((1000 / fps.max(1)).max(1)))
}

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr, ServiceError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ServiceError::InvalidAddress(ip.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}
