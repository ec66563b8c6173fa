//! The [`Service`] orchestrator and its [`ServiceBuilder`].
//!
//! Lifecycle: `Created -> Started -> Stopped -> Started -> ...`. A failing
//! `on_stop` leaves the service in `Stopping` until `stop` is called again.
//! Registration (facades, coders, subscriptions, drive mode) is only allowed
//! while the service is not started, so the tick never races with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use harbor_config::{DriveMode, NetworkConfig, ServiceConfig, ServiceKind};
use harbor_net::{
    FrameMode, PacketHeader, SessionId, SessionInfo, Transport, TransportConfig,
};
use parking_lot::RwLock;

use crate::codec::{Coder, CoderTable, Packet};
use crate::delegates::{PacketDelegates, add_packet_delegates, remove_packet_delegates};
use crate::dispatch::Propagation;
use crate::engine::{Engine, IoBridge, NotFoundDecoderHook, TickReport};
use crate::error::{CodecError, ServiceError};
use crate::facade::{FacadeFactory, FacadeSlot};
use crate::handle::{ServiceHandle, ServiceId, ServiceState, Shared};
use crate::timer::TimerScheduler;

/// Default tick rate.
pub const DEFAULT_FPS: u32 = 30;

static NEXT_SERVICE_ID: AtomicU32 = AtomicU32::new(1);

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and creates a [`Service`].
pub struct ServiceBuilder {
    name: String,
    kind: ServiceKind,
    drive_mode: DriveMode,
    fps: u32,
    transport: TransportConfig,
    not_found: Option<NotFoundDecoderHook>,
}

impl ServiceBuilder {
    /// Start a builder with default settings: normal framing, self-drive,
    /// [`DEFAULT_FPS`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServiceKind::Normal,
            drive_mode: DriveMode::SelfDrive,
            fps: DEFAULT_FPS,
            transport: TransportConfig::default(),
            not_found: None,
        }
    }

    /// Builder seeded from the `[service]` config section.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.name.clone())
            .kind(config.kind)
            .drive_mode(config.drive_mode)
            .fps(config.fps)
    }

    /// Framing kind.
    pub fn kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Drive mode.
    pub fn drive_mode(mut self, drive_mode: DriveMode) -> Self {
        self.drive_mode = drive_mode;
        self
    }

    /// Tick rate; must be at least 1.
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Transport limits from the `[network]` config section.
    pub fn network(mut self, config: &NetworkConfig) -> Self {
        self.transport = TransportConfig::from(config);
        self
    }

    /// Transport settings. The frame mode is always derived from the kind.
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    /// Report packets whose opcode has no coder to `hook` instead of
    /// dispatching them undecoded.
    pub fn not_found_decoder<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&ServiceHandle, SessionId, u32) + Send + 'static,
    {
        self.not_found = Some(Box::new(hook));
        self
    }

    /// Create the service and register its delegates in the global index.
    pub fn build(self) -> Result<Service, ServiceError> {
        if self.fps == 0 {
            return Err(ServiceError::InvalidFps);
        }

        let id = ServiceId(NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed));
        let kind = self.kind;
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        let coders = Arc::new(CoderTable::default());

        let report_missing = self.not_found.is_some();
        let decode_coders = Arc::clone(&coders);
        let delegates = Arc::new(PacketDelegates {
            encode: Box::new(move |opcode, payload, status| {
                encode_frame(kind, opcode, payload, status)
            }),
            decode: Box::new(move |session_id, frame| {
                decode_frame(kind, &decode_coders, report_missing, session_id, frame)
            }),
            deliver: Box::new(move |event| inbound_tx.send(event).is_ok()),
        });
        add_packet_delegates(id, Arc::clone(&delegates))?;

        let handle = ServiceHandle {
            shared: Arc::new(Shared {
                id,
                name: self.name,
                kind,
                fps: AtomicU32::new(self.fps),
                drive_mode: RwLock::new(self.drive_mode),
                state: RwLock::new(ServiceState::Created),
                transport: RwLock::new(None),
                timers: TimerScheduler::new(),
                outbound_tx,
                delegates,
            }),
        };

        let mut transport = self.transport;
        transport.frame.mode = match kind {
            ServiceKind::Normal => FrameMode::LengthPrefixed,
            ServiceKind::Raw => FrameMode::Raw,
        };

        tracing::info!(
            "Service {id} ({}) created: {kind:?}, {:?}, {} fps",
            handle.name(),
            self.drive_mode,
            self.fps
        );

        Ok(Service {
            engine: Some(Engine::new(
                handle.clone(),
                inbound_rx,
                outbound_rx,
                self.not_found,
            )),
            handle,
            coders,
            runner: None,
            transport,
            facade_count: 0,
        })
    }
}

fn encode_frame(kind: ServiceKind, opcode: u32, payload: &[u8], status: i32) -> Bytes {
    match kind {
        ServiceKind::Normal => PacketHeader { opcode, status }.encode_with(payload),
        ServiceKind::Raw => Bytes::copy_from_slice(payload),
    }
}

fn decode_frame(
    kind: ServiceKind,
    coders: &CoderTable,
    report_missing: bool,
    session_id: SessionId,
    frame: Bytes,
) -> Result<Packet, ServiceError> {
    let mut packet = match kind {
        ServiceKind::Normal => {
            let (header, payload) = PacketHeader::decode(frame)
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            Packet::new(session_id, header.opcode, header.status, payload)
        }
        ServiceKind::Raw => Packet::new(session_id, 0, 0, frame),
    };
    if !coders.decode_into(&mut packet)? && report_missing {
        return Err(ServiceError::NotFoundDecoder {
            opcode: packet.opcode,
        });
    }
    Ok(packet)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The self-drive execution thread.
struct Runner {
    stop_tx: Sender<()>,
    thread: JoinHandle<Option<Engine>>,
}

/// A network service: sessions, facades, timers and packet dispatch.
pub struct Service {
    handle: ServiceHandle,
    coders: Arc<CoderTable>,
    // `None` while the engine runs on the execution thread.
    engine: Option<Engine>,
    runner: Option<Runner>,
    transport: TransportConfig,
    facade_count: usize,
}

impl Service {
    /// Shorthand for [`ServiceBuilder::new`].
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    /// A handle sharing this service's state.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Service id.
    pub fn id(&self) -> ServiceId {
        self.handle.id()
    }

    /// Service name.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Framing kind.
    pub fn kind(&self) -> ServiceKind {
        self.handle.kind()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.handle.state()
    }

    /// Drive mode.
    pub fn drive_mode(&self) -> DriveMode {
        self.handle.drive_mode()
    }

    /// Change the drive mode. Only allowed while not started.
    pub fn set_drive_mode(&mut self, drive_mode: DriveMode) -> Result<(), ServiceError> {
        self.ensure_configurable()?;
        *self.handle.shared.drive_mode.write() = drive_mode;
        Ok(())
    }

    /// Target ticks per second.
    pub fn fps(&self) -> u32 {
        self.handle.fps()
    }

    /// Change the frame rate, also while running.
    pub fn set_fps(&self, fps: u32) -> Result<(), ServiceError> {
        self.handle.set_fps(fps)
    }

    /// Time budget of one frame.
    pub fn frame_interval(&self) -> Duration {
        self.handle.frame_interval()
    }

    /// Timer queue ticked by this service.
    pub fn timers(&self) -> &TimerScheduler {
        self.handle.timers()
    }

    /// Number of attached facades.
    pub fn facade_count(&self) -> usize {
        self.facade_count
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Create a facade from `factory` and attach it after the existing ones.
    pub fn register_facade<F>(&mut self, factory: &F) -> Result<(), ServiceError>
    where
        F: FacadeFactory + ?Sized,
    {
        self.ensure_configurable()?;
        let facade = factory.create();
        tracing::debug!("Service {} registered facade {}", self.id(), facade.name());
        self.engine_mut()?.facades.push(FacadeSlot::new(facade));
        self.facade_count += 1;
        Ok(())
    }

    /// Decode payloads of `opcode` as `C`.
    pub fn register_coder<C: Coder>(&mut self, opcode: u32) -> Result<(), ServiceError> {
        self.ensure_configurable()?;
        self.coders.register::<C>(opcode)
    }

    /// Register the handler for `opcode`.
    pub fn subscribe<F>(&mut self, opcode: u32, handler: F) -> Result<(), ServiceError>
    where
        F: FnMut(&ServiceHandle, &Packet) + Send + 'static,
    {
        self.ensure_configurable()?;
        self.engine_mut()?.registry.subscribe(opcode, Box::new(handler))
    }

    /// Register the pre-handler for `opcode`.
    pub fn pre_subscribe<F>(&mut self, opcode: u32, pre_handler: F) -> Result<(), ServiceError>
    where
        F: FnMut(&ServiceHandle, &Packet) -> Propagation + Send + 'static,
    {
        self.ensure_configurable()?;
        self.engine_mut()?
            .registry
            .pre_subscribe(opcode, Box::new(pre_handler))
    }

    /// Register the unify pre-handler. Fails with
    /// [`ServiceError::NotSupported`] when the `unify-pre-subscribe` feature
    /// is disabled.
    pub fn unify_pre_subscribe<F>(&mut self, unify: F) -> Result<(), ServiceError>
    where
        F: FnMut(&ServiceHandle, &Packet) -> Propagation + Send + 'static,
    {
        self.ensure_configurable()?;
        self.engine_mut()?.registry.unify_pre_subscribe(Box::new(unify))
    }

    fn ensure_configurable(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Started | ServiceState::Stopping => Err(ServiceError::AlreadyStarted),
            ServiceState::Created | ServiceState::Stopped => Ok(()),
        }
    }

    fn engine_mut(&mut self) -> Result<&mut Engine, ServiceError> {
        self.engine.as_mut().ok_or(ServiceError::AlreadyStarted)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the service with `worker_count` transport I/O threads (at least
    /// one).
    ///
    /// Runs `on_initialize` then `on_start` on every facade. If a hook fails,
    /// the facades already started are stopped, the initialized ones
    /// destroyed, and the service ends `Stopped` with the hook's error.
    pub fn start(&mut self, worker_count: usize) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Started => return Err(ServiceError::AlreadyStarted),
            ServiceState::Stopping => return Err(ServiceError::TeardownPending),
            ServiceState::Created | ServiceState::Stopped => {}
        }
        if self.engine.is_none() {
            return Err(ServiceError::AlreadyStarted);
        }

        let id = self.id();
        let transport = Transport::new(
            &id.to_string(),
            worker_count,
            self.transport.clone(),
            Arc::new(IoBridge { service_id: id }),
        )?;
        self.handle.install_transport(Arc::new(transport));
        self.handle.set_state(ServiceState::Started);

        let started = match self.engine.as_mut() {
            Some(engine) => {
                engine.reset_idle();
                engine.start_facades()
            }
            None => Err(ServiceError::AlreadyStarted),
        };
        if let Err(e) = started {
            tracing::warn!("Service {id} start aborted: {e}");
            self.abort_start();
            return Err(e);
        }

        if self.drive_mode() == DriveMode::SelfDrive
            && let Err(e) = self.spawn_runner()
        {
            tracing::warn!("Service {id} could not spawn its execution thread: {e}");
            self.abort_start();
            return Err(e);
        }

        tracing::info!(
            "Service {id} ({}) started: {:?}, {} I/O workers",
            self.name(),
            self.drive_mode(),
            worker_count.max(1)
        );
        Ok(())
    }

    fn abort_start(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.rollback();
            engine.flush_outbound();
        }
        if let Some(transport) = self.handle.take_transport() {
            transport.shutdown();
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.discard_inbound();
        }
        self.handle.set_state(ServiceState::Stopped);
    }

    fn spawn_runner(&mut self) -> Result<(), ServiceError> {
        let (engine_tx, engine_rx) = crossbeam_channel::bounded::<Engine>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        // The engine is handed over only once the thread exists, so a failed
        // spawn leaves it in place.
        let thread = std::thread::Builder::new()
            .name(format!("harbor-svc-{}", self.id()))
            .spawn(move || {
                let engine = engine_rx.recv().ok()?;
                Some(engine.run(stop_rx))
            })?;

        let engine = self.engine.take().ok_or(ServiceError::AlreadyStarted)?;
        if let Err(returned) = engine_tx.send(engine) {
            self.engine = Some(returned.into_inner());
            return Err(ServiceError::NotStarted);
        }
        self.runner = Some(Runner { stop_tx, thread });
        Ok(())
    }

    /// Stop the service.
    ///
    /// Joins the execution thread, runs `on_stop` in reverse order, flushes
    /// queued sends, shuts the transport down and runs `on_destroy` in
    /// reverse order. A no-op when not started. If an `on_stop` fails the
    /// service stays `Stopping` and a later call continues with the
    /// remaining facades.
    pub fn stop(&mut self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Created | ServiceState::Stopped => return Ok(()),
            ServiceState::Started | ServiceState::Stopping => {}
        }
        let id = self.id();

        if let Some(runner) = self.runner.take() {
            let _ = runner.stop_tx.send(());
            match runner.thread.join() {
                Ok(Some(engine)) => self.engine = Some(engine),
                Ok(None) => tracing::error!("Service {id} execution thread lost its engine"),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        self.handle.set_state(ServiceState::Stopping);

        if let Some(engine) = self.engine.as_mut()
            && let Err(e) = engine.stop_facades()
        {
            tracing::warn!("Service {id} stop interrupted: {e}");
            return Err(e);
        }

        if let Some(engine) = self.engine.as_ref() {
            engine.flush_outbound();
        }
        if let Some(transport) = self.handle.take_transport() {
            transport.shutdown();
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.discard_inbound();
            engine.destroy_facades();
        }

        self.handle.set_state(ServiceState::Stopped);
        tracing::info!("Service {id} ({}) stopped", self.name());
        Ok(())
    }

    /// Run one tick on the calling thread. External drive only.
    ///
    /// With `full_stack` set, queued sends are flushed at the end of the tick;
    /// otherwise they wait for [`flush`](Self::flush).
    pub fn on_svc(&mut self, full_stack: bool) -> Result<TickReport, ServiceError> {
        let mode = self.drive_mode();
        if mode == DriveMode::SelfDrive {
            return Err(ServiceError::WrongDriveMode(mode));
        }
        if self.state() != ServiceState::Started {
            return Err(ServiceError::NotStarted);
        }
        let engine = self.engine.as_mut().ok_or(ServiceError::NotStarted)?;
        Ok(engine.tick(full_stack))
    }

    /// Hand queued sends to the transport now. Returns the number of queued
    /// items processed; always 0 in self-drive mode, where the execution
    /// thread flushes.
    pub fn flush(&mut self) -> Result<usize, ServiceError> {
        if self.state() != ServiceState::Started {
            return Err(ServiceError::NotStarted);
        }
        Ok(self
            .engine
            .as_ref()
            .map_or(0, |engine| engine.flush_outbound()))
    }

    // -----------------------------------------------------------------------
    // Sessions and sending
    // -----------------------------------------------------------------------

    /// See [`ServiceHandle::listen`].
    pub fn listen(&self, ip: &str, port: u16) -> Result<std::net::SocketAddr, ServiceError> {
        self.handle.listen(ip, port)
    }

    /// See [`ServiceHandle::connect`].
    pub fn connect(&self, ip: &str, port: u16) -> Result<SessionId, ServiceError> {
        self.handle.connect(ip, port)
    }

    /// See [`ServiceHandle::async_conn`].
    pub fn async_conn(&self, ip: &str, port: u16) -> Result<(), ServiceError> {
        self.handle.async_conn(ip, port)
    }

    /// See [`ServiceHandle::is_session_valid`].
    pub fn is_session_valid(&self, session_id: SessionId) -> bool {
        self.handle.is_session_valid(session_id)
    }

    /// See [`ServiceHandle::session_info`].
    pub fn session_info(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.handle.session_info(session_id)
    }

    /// See [`ServiceHandle::remove_session`].
    pub fn remove_session(&self, session_id: SessionId, reason: &str) -> Result<(), ServiceError> {
        self.handle.remove_session(session_id, reason)
    }

    /// See [`ServiceHandle::send`].
    pub fn send<C: Coder>(
        &self,
        session_id: SessionId,
        opcode: u32,
        body: &C,
        status: i32,
    ) -> Result<(), ServiceError> {
        self.handle.send(session_id, opcode, body, status)
    }

    /// See [`ServiceHandle::multicast`].
    pub fn multicast<C: Coder>(
        &self,
        session_ids: &[SessionId],
        opcode: u32,
        body: &C,
        status: i32,
    ) -> Result<(), ServiceError> {
        self.handle.multicast(session_ids, opcode, body, status)
    }

    /// See [`ServiceHandle::broadcast`].
    pub fn broadcast<C: Coder>(&self, opcode: u32, body: &C, status: i32) -> Result<(), ServiceError> {
        self.handle.broadcast(opcode, body, status)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let id = self.id();
        // Every failed attempt retires one facade, so this terminates.
        for _ in 0..=self.facade_count {
            match self.stop() {
                Ok(()) => break,
                Err(e) => tracing::warn!("Service {id} teardown step failed: {e}"),
            }
        }
        remove_packet_delegates(id);
        tracing::debug!("Service {id} dropped");
    }
}
