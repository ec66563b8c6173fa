//! Facades: pluggable lifecycle objects attached to a service.
//!
//! Every hook has a no-op default so a facade only implements what it needs.
//! Hooks run on the tick thread (the execution thread in self-drive mode, the
//! `on_svc` caller in external drive) and receive the service's
//! [`ServiceHandle`].

use std::time::Duration;

use harbor_net::{AsyncConnResult, SessionInfo};

use crate::codec::Packet;
use crate::error::FacadeError;
use crate::handle::ServiceHandle;

/// Result type of facade hooks.
pub type FacadeResult = Result<(), FacadeError>;

/// Lifecycle hooks of a service component.
///
/// On start, every facade gets `on_initialize` in registration order, then
/// every facade gets `on_start` in registration order. On stop, `on_stop` and
/// then `on_destroy` run in reverse registration order.
#[allow(unused_variables)]
pub trait Facade: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// First hook of a start sequence.
    fn on_initialize(&mut self, svc: &ServiceHandle) -> FacadeResult {
        Ok(())
    }

    /// Runs once every facade is initialized; the service is already
    /// `Started`, so sessions can be opened here.
    fn on_start(&mut self, svc: &ServiceHandle) -> FacadeResult {
        Ok(())
    }

    /// Once per tick, after inbound events and timers.
    fn on_update(&mut self, svc: &ServiceHandle) -> FacadeResult {
        Ok(())
    }

    /// On ticks that found no work. `idle_time` is how long the service has
    /// been idle.
    fn on_idle(&mut self, svc: &ServiceHandle, idle_time: Duration) -> FacadeResult {
        Ok(())
    }

    /// First hook of a stop sequence. Sends made here are still flushed.
    fn on_stop(&mut self, svc: &ServiceHandle) -> FacadeResult {
        Ok(())
    }

    /// Last hook of a stop sequence; the transport is already shut down.
    fn on_destroy(&mut self, svc: &ServiceHandle) -> FacadeResult {
        Ok(())
    }

    /// A session opened.
    fn on_session_create(&mut self, svc: &ServiceHandle, session: &SessionInfo) -> FacadeResult {
        Ok(())
    }

    /// A session closed.
    fn on_session_destroy(
        &mut self,
        svc: &ServiceHandle,
        session: &SessionInfo,
        reason: &str,
    ) -> FacadeResult {
        Ok(())
    }

    /// An asynchronous connect finished.
    fn on_async_conn_result(
        &mut self,
        svc: &ServiceHandle,
        result: &AsyncConnResult,
    ) -> FacadeResult {
        Ok(())
    }

    /// A packet arrived for an opcode with neither a handler nor a
    /// pre-handler.
    fn on_unhandled_packet(&mut self, svc: &ServiceHandle, packet: &Packet) -> FacadeResult {
        Ok(())
    }
}

/// Creates facades; one factory can serve many services.
pub trait FacadeFactory {
    /// Build a fresh facade.
    fn create(&self) -> Box<dyn Facade>;
}

impl<F> FacadeFactory for F
where
    F: Fn() -> Box<dyn Facade>,
{
    fn create(&self) -> Box<dyn Facade> {
        self()
    }
}

/// How far a facade has progressed through the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FacadeStage {
    Created,
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

/// A facade plus its lifecycle stage.
pub(crate) struct FacadeSlot {
    pub(crate) facade: Box<dyn Facade>,
    pub(crate) stage: FacadeStage,
}

impl FacadeSlot {
    pub(crate) fn new(facade: Box<dyn Facade>) -> Self {
        Self {
            facade,
            stage: FacadeStage::Created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Facade for Plain {}

    struct Named;

    impl Facade for Named {
        fn name(&self) -> &str {
            "lobby"
        }
    }

    #[test]
    fn test_default_name_is_type_name() {
        let facade: Box<dyn Facade> = Box::new(Plain);
        assert!(facade.name().ends_with("Plain"));
        assert_eq!(Named.name(), "lobby");
    }

    #[test]
    fn test_closure_factory_creates_fresh_facades() {
        let factory = || Box::new(Named) as Box<dyn Facade>;
        let a = factory.create();
        let b = factory.create();
        assert_eq!(a.name(), b.name());

        let slot = FacadeSlot::new(a);
        assert_eq!(slot.stage, FacadeStage::Created);
    }
}
