//! Tick execution and facade lifecycle.
//!
//! The [`Engine`] owns everything a tick touches: facades, the dispatch
//! registry, the not-found-decoder hook and the receiving ends of the inbound
//! and outbound queues. In self-drive mode it moves into the execution thread
//! and comes back through `join`; in external drive it stays inside the
//! [`Service`](crate::Service) and `on_svc` runs one tick on the caller.

use std::time::Instant;

use crossbeam_channel::{Receiver, Select, TryRecvError};
use harbor_net::{AsyncConnResult, SessionId, SessionInfo, TransportEvents};

use crate::codec::Packet;
use crate::delegates::{ServiceEvent, packet_delegates};
use crate::dispatch::{DispatchOutcome, DispatchRegistry};
use crate::error::{FacadeError, ServiceError};
use crate::facade::{Facade, FacadeSlot, FacadeStage};
use crate::handle::{Outbound, ServiceHandle, ServiceId};

/// Called on the tick thread when a packet's opcode has no coder.
pub type NotFoundDecoderHook = Box<dyn FnMut(&ServiceHandle, SessionId, u32) + Send>;

/// Work done by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Inbound events handled.
    pub events: usize,
    /// Timer callbacks run.
    pub timers_fired: usize,
    /// Outbound items handed to the transport.
    pub flushed: usize,
}

impl TickReport {
    /// Whether the tick found anything to do.
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.timers_fired == 0 && self.flushed == 0
    }
}

pub(crate) struct Engine {
    pub(crate) handle: ServiceHandle,
    pub(crate) facades: Vec<FacadeSlot>,
    pub(crate) registry: DispatchRegistry,
    pub(crate) not_found: Option<NotFoundDecoderHook>,
    inbound_rx: Receiver<ServiceEvent>,
    outbound_rx: Receiver<Outbound>,
    idle_since: Instant,
    /// Set when work was done between frames; such a frame is not idle.
    pumped: bool,
}

impl Engine {
    pub(crate) fn new(
        handle: ServiceHandle,
        inbound_rx: Receiver<ServiceEvent>,
        outbound_rx: Receiver<Outbound>,
        not_found: Option<NotFoundDecoderHook>,
    ) -> Self {
        Self {
            handle,
            facades: Vec::new(),
            registry: DispatchRegistry::new(),
            not_found,
            inbound_rx,
            outbound_rx,
            idle_since: Instant::now(),
            pumped: false,
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One tick: inbound events, due timers, `on_update`, then the outbound
    /// flush when `full_stack` is set. `on_idle` runs when nothing was done.
    pub(crate) fn tick(&mut self, full_stack: bool) -> TickReport {
        let events = self.drain_inbound();
        let timers_fired = self.handle.timers().fire_due(Instant::now());

        for slot in running(&mut self.facades) {
            if let Err(e) = slot.facade.on_update(&self.handle) {
                warn_fault(&self.handle, slot.facade.as_ref(), "on_update", &e);
            }
        }

        let flushed = if full_stack { self.flush_outbound() } else { 0 };
        let report = TickReport {
            events,
            timers_fired,
            flushed,
        };

        let now = Instant::now();
        let pumped = std::mem::take(&mut self.pumped);
        if report.is_idle() && !pumped {
            let idle_time = now.saturating_duration_since(self.idle_since);
            for slot in running(&mut self.facades) {
                if let Err(e) = slot.facade.on_idle(&self.handle, idle_time) {
                    warn_fault(&self.handle, slot.facade.as_ref(), "on_idle", &e);
                }
            }
        } else {
            self.idle_since = now;
        }
        report
    }

    /// Work done between frames in self-drive: inbound events, timers that
    /// are already due and the outbound flush. Facade `on_update` and
    /// `on_idle` wait for the next frame.
    fn pump(&mut self) -> TickReport {
        let report = TickReport {
            events: self.drain_inbound(),
            timers_fired: self.handle.timers().fire_due(Instant::now()),
            flushed: self.flush_outbound(),
        };
        if !report.is_idle() {
            self.pumped = true;
            self.idle_since = Instant::now();
        }
        report
    }

    /// Handle the events queued when the call began. Later arrivals wait for
    /// the next tick so a busy peer cannot starve timers and updates.
    fn drain_inbound(&mut self) -> usize {
        let pending = self.inbound_rx.len();
        let mut handled = 0;
        for _ in 0..pending {
            let Ok(event) = self.inbound_rx.try_recv() else {
                break;
            };
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::SessionCreated(session) => {
                tracing::debug!("Service {} session {} created", self.handle.id(), session.id);
                for slot in running(&mut self.facades) {
                    if let Err(e) = slot.facade.on_session_create(&self.handle, &session) {
                        warn_fault(&self.handle, slot.facade.as_ref(), "on_session_create", &e);
                    }
                }
            }
            ServiceEvent::SessionDestroyed { session, reason } => {
                tracing::debug!(
                    "Service {} session {} destroyed: {reason}",
                    self.handle.id(),
                    session.id
                );
                for slot in running(&mut self.facades) {
                    if let Err(e) = slot.facade.on_session_destroy(&self.handle, &session, &reason) {
                        warn_fault(&self.handle, slot.facade.as_ref(), "on_session_destroy", &e);
                    }
                }
            }
            ServiceEvent::AsyncConnResult(result) => {
                for slot in running(&mut self.facades) {
                    if let Err(e) = slot.facade.on_async_conn_result(&self.handle, &result) {
                        warn_fault(&self.handle, slot.facade.as_ref(), "on_async_conn_result", &e);
                    }
                }
            }
            ServiceEvent::Packet(packet) => self.dispatch(packet),
            ServiceEvent::NotFoundDecoder { session_id, opcode } => match self.not_found.as_mut() {
                Some(hook) => hook(&self.handle, session_id, opcode),
                None => tracing::trace!(
                    "Service {} dropped opcode {opcode} from session {session_id}: no decoder",
                    self.handle.id()
                ),
            },
        }
    }

    fn dispatch(&mut self, packet: Packet) {
        tracing::trace!(
            "Service {} dispatching opcode {} from session {}",
            self.handle.id(),
            packet.opcode,
            packet.session_id
        );
        if self.registry.dispatch(&self.handle, &packet) == DispatchOutcome::Unhandled {
            tracing::trace!(
                "Service {} has no handler for opcode {}",
                self.handle.id(),
                packet.opcode
            );
            for slot in running(&mut self.facades) {
                if let Err(e) = slot.facade.on_unhandled_packet(&self.handle, &packet) {
                    warn_fault(&self.handle, slot.facade.as_ref(), "on_unhandled_packet", &e);
                }
            }
        }
    }

    /// Hand queued outbound frames to the transport. Returns how many queue
    /// items were processed.
    pub(crate) fn flush_outbound(&self) -> usize {
        let Some(transport) = self.handle.transport() else {
            return 0;
        };
        let pending = self.outbound_rx.len();
        let mut flushed = 0;
        for _ in 0..pending {
            let Ok(item) = self.outbound_rx.try_recv() else {
                break;
            };
            match item {
                Outbound::Unicast(session_id, frame) => {
                    if let Err(e) = transport.send(session_id, frame) {
                        tracing::trace!("Service {} send skipped: {e}", self.handle.id());
                    }
                }
                Outbound::Multicast(session_ids, frame) => {
                    for session_id in session_ids {
                        if let Err(e) = transport.send(session_id, frame.clone()) {
                            tracing::trace!("Service {} multicast skipped: {e}", self.handle.id());
                        }
                    }
                }
                Outbound::Broadcast(frame) => {
                    transport.broadcast(frame);
                }
            }
            flushed += 1;
        }
        flushed
    }

    /// Drop everything still queued inbound. Used once the transport is gone.
    pub(crate) fn discard_inbound(&mut self) -> usize {
        let discarded = self.inbound_rx.try_iter().count();
        if discarded > 0 {
            tracing::debug!(
                "Service {} discarded {discarded} inbound events on stop",
                self.handle.id()
            );
        }
        discarded
    }

    pub(crate) fn reset_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `on_initialize` on every facade, then `on_start` on every facade, both
    /// in registration order. Stops at the first failure.
    pub(crate) fn start_facades(&mut self) -> Result<(), ServiceError> {
        for slot in &mut self.facades {
            slot.facade
                .on_initialize(&self.handle)
                .map_err(|e| fault(slot.facade.as_ref(), "on_initialize", e))?;
            slot.stage = FacadeStage::Initialized;
        }
        for slot in &mut self.facades {
            slot.facade
                .on_start(&self.handle)
                .map_err(|e| fault(slot.facade.as_ref(), "on_start", e))?;
            slot.stage = FacadeStage::Started;
        }
        Ok(())
    }

    /// `on_stop` in reverse order on every started facade. A failing facade
    /// still counts as stopped, so a retry continues with the next one.
    pub(crate) fn stop_facades(&mut self) -> Result<(), ServiceError> {
        for slot in self.facades.iter_mut().rev() {
            if slot.stage != FacadeStage::Started {
                continue;
            }
            slot.stage = FacadeStage::Stopped;
            slot.facade
                .on_stop(&self.handle)
                .map_err(|e| fault(slot.facade.as_ref(), "on_stop", e))?;
        }
        Ok(())
    }

    /// `on_destroy` in reverse order on every initialized facade. Failures
    /// are logged and teardown continues.
    pub(crate) fn destroy_facades(&mut self) {
        for slot in self.facades.iter_mut().rev() {
            if !matches!(slot.stage, FacadeStage::Initialized | FacadeStage::Stopped) {
                continue;
            }
            slot.stage = FacadeStage::Destroyed;
            if let Err(e) = slot.facade.on_destroy(&self.handle) {
                warn_fault(&self.handle, slot.facade.as_ref(), "on_destroy", &e);
            }
        }
    }

    /// Undo a failed start: every started facade is stopped and every
    /// initialized facade destroyed, both in reverse order.
    pub(crate) fn rollback(&mut self) {
        for slot in self.facades.iter_mut().rev() {
            if slot.stage != FacadeStage::Started {
                continue;
            }
            slot.stage = FacadeStage::Stopped;
            if let Err(e) = slot.facade.on_stop(&self.handle) {
                warn_fault(&self.handle, slot.facade.as_ref(), "on_stop", &e);
            }
        }
        self.destroy_facades();
    }

    // -----------------------------------------------------------------------
    // Self-drive loop
    // -----------------------------------------------------------------------

    /// Execution thread body. Runs a full tick once per frame and pumps I/O
    /// and due timers whenever the queues wake it in between. Returns the
    /// engine once `stop_rx` fires or disconnects.
    pub(crate) fn run(mut self, stop_rx: Receiver<()>) -> Self {
        tracing::info!(
            "Service {} ({}) execution thread running at {} fps",
            self.handle.id(),
            self.handle.name(),
            self.handle.fps()
        );
        let mut next_frame = Instant::now();

        loop {
            match stop_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => break,
            }

            if Instant::now() >= next_frame {
                self.tick(true);
                let interval = self.handle.frame_interval();
                next_frame += interval;
                let now = Instant::now();
                if next_frame <= now {
                    // Fell behind by more than a frame; restart the cadence.
                    next_frame = now + interval;
                }
            } else {
                self.pump();
            }

            let deadline = match self.handle.timers().next_due() {
                Some(due) => due.min(next_frame),
                None => next_frame,
            };

            let mut select = Select::new();
            let stop_index = select.recv(&stop_rx);
            select.recv(&self.inbound_rx);
            select.recv(&self.outbound_rx);
            if let Ok(index) = select.ready_deadline(deadline)
                && index == stop_index
            {
                break;
            }
        }

        tracing::info!("Service {} execution thread exiting", self.handle.id());
        self
    }
}

/// Facades that receive tick and session hooks.
fn running(facades: &mut [FacadeSlot]) -> impl Iterator<Item = &mut FacadeSlot> {
    facades
        .iter_mut()
        .filter(|slot| slot.stage == FacadeStage::Started)
}

fn fault(facade: &dyn Facade, hook: &'static str, source: FacadeError) -> ServiceError {
    ServiceError::FacadeFault {
        facade: facade.name().to_string(),
        hook,
        source,
    }
}

fn warn_fault(svc: &ServiceHandle, facade: &dyn Facade, hook: &str, err: &FacadeError) {
    tracing::warn!(
        "Service {} facade {} failed in {hook}: {err}",
        svc.id(),
        facade.name()
    );
}

// ---------------------------------------------------------------------------
// I/O bridge
// ---------------------------------------------------------------------------

/// Transport callbacks of one service. Knows only the service id and goes
/// through the global delegate index for everything else.
pub(crate) struct IoBridge {
    pub(crate) service_id: ServiceId,
}

impl IoBridge {
    fn deliver(&self, event: ServiceEvent) {
        let Some(delegates) = packet_delegates(self.service_id) else {
            tracing::trace!("Service {} is gone; dropping event", self.service_id);
            return;
        };
        if !(delegates.deliver)(event) {
            tracing::trace!("Service {} inbound queue closed", self.service_id);
        }
    }
}

impl TransportEvents for IoBridge {
    fn on_session_created(&self, session: &SessionInfo) {
        self.deliver(ServiceEvent::SessionCreated(session.clone()));
    }

    fn on_session_destroyed(&self, session: &SessionInfo, reason: &str) {
        self.deliver(ServiceEvent::SessionDestroyed {
            session: session.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_frame(&self, session_id: SessionId, frame: bytes::Bytes) {
        let Some(delegates) = packet_delegates(self.service_id) else {
            return;
        };
        let event = match (delegates.decode)(session_id, frame) {
            Ok(packet) => ServiceEvent::Packet(packet),
            Err(ServiceError::NotFoundDecoder { opcode }) => {
                ServiceEvent::NotFoundDecoder { session_id, opcode }
            }
            Err(e) => {
                tracing::warn!(
                    "Service {} dropped malformed packet from session {session_id}: {e}",
                    self.service_id
                );
                return;
            }
        };
        (delegates.deliver)(event);
    }

    fn on_async_conn_result(&self, result: AsyncConnResult) {
        self.deliver(ServiceEvent::AsyncConnResult(result));
    }
}
