//! Opcode-keyed packet dispatch.
//!
//! Each inbound packet runs through up to three stages: the service-wide
//! unify pre-handler, the opcode's pre-handler, then the opcode's handler.
//! A pre-stage returning [`Propagation::Stop`] ends dispatch for that packet.

use rustc_hash::FxHashMap;

use crate::codec::Packet;
use crate::error::ServiceError;
use crate::handle::ServiceHandle;

/// Whether dispatch continues to the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Run the next stage.
    Continue,
    /// Skip all later stages for this packet.
    Stop,
}

/// Normal packet handler.
pub type Handler = Box<dyn FnMut(&ServiceHandle, &Packet) + Send>;

/// Pre-handler or unify pre-handler.
pub type PreHandler = Box<dyn FnMut(&ServiceHandle, &Packet) -> Propagation + Send>;

/// What happened to a dispatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A pre-handler or handler ran and nothing stopped it.
    Handled,
    /// A pre-stage returned [`Propagation::Stop`].
    Stopped,
    /// No handler or pre-handler exists for the opcode.
    Unhandled,
}

/// Per-service dispatch tables.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: FxHashMap<u32, Handler>,
    pre_handlers: FxHashMap<u32, PreHandler>,
    unify: Option<PreHandler>,
}

impl DispatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `opcode`.
    pub fn subscribe(&mut self, opcode: u32, handler: Handler) -> Result<(), ServiceError> {
        if self.handlers.contains_key(&opcode) {
            return Err(ServiceError::DuplicateSubscription(format!(
                "handler of opcode {opcode}"
            )));
        }
        self.handlers.insert(opcode, handler);
        Ok(())
    }

    /// Register the pre-handler for `opcode`. Independent of
    /// [`subscribe`](Self::subscribe).
    pub fn pre_subscribe(&mut self, opcode: u32, pre_handler: PreHandler) -> Result<(), ServiceError> {
        if self.pre_handlers.contains_key(&opcode) {
            return Err(ServiceError::DuplicateSubscription(format!(
                "pre-handler of opcode {opcode}"
            )));
        }
        self.pre_handlers.insert(opcode, pre_handler);
        Ok(())
    }

    /// Register the unify pre-handler, which sees every packet first.
    #[cfg(feature = "unify-pre-subscribe")]
    pub fn unify_pre_subscribe(&mut self, unify: PreHandler) -> Result<(), ServiceError> {
        if self.unify.is_some() {
            return Err(ServiceError::DuplicateSubscription(
                "unify pre-handler".to_string(),
            ));
        }
        self.unify = Some(unify);
        Ok(())
    }

    /// Unify pre-handlers are compiled out of this build.
    #[cfg(not(feature = "unify-pre-subscribe"))]
    pub fn unify_pre_subscribe(&mut self, _unify: PreHandler) -> Result<(), ServiceError> {
        Err(ServiceError::NotSupported("unify pre-subscribe"))
    }

    /// Whether a handler is registered for `opcode`.
    pub fn has_handler(&self, opcode: u32) -> bool {
        self.handlers.contains_key(&opcode)
    }

    /// Whether a pre-handler is registered for `opcode`.
    pub fn has_pre_handler(&self, opcode: u32) -> bool {
        self.pre_handlers.contains_key(&opcode)
    }

    /// Whether a unify pre-handler is registered.
    pub fn has_unify(&self) -> bool {
        self.unify.is_some()
    }

    /// Run `packet` through the stages.
    pub fn dispatch(&mut self, svc: &ServiceHandle, packet: &Packet) -> DispatchOutcome {
        if let Some(unify) = self.unify.as_mut()
            && unify(svc, packet) == Propagation::Stop
        {
            return DispatchOutcome::Stopped;
        }

        let pre = self.pre_handlers.get_mut(&packet.opcode);
        let handler_exists = self.handlers.contains_key(&packet.opcode);
        if pre.is_none() && !handler_exists {
            return DispatchOutcome::Unhandled;
        }
        if let Some(pre) = pre
            && pre(svc, packet) == Propagation::Stop
        {
            return DispatchOutcome::Stopped;
        }

        if let Some(handler) = self.handlers.get_mut(&packet.opcode) {
            handler(svc, packet);
        }
        DispatchOutcome::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Service, ServiceBuilder};
    use bytes::Bytes;
    use harbor_config::DriveMode;
    use harbor_net::SessionId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn service() -> Service {
        ServiceBuilder::new("dispatch-test")
            .drive_mode(DriveMode::ExternalDrive)
            .build()
            .unwrap()
    }

    fn packet(opcode: u32) -> Packet {
        Packet::new(SessionId(1), opcode, 0, Bytes::new())
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Handler {
        let log = Arc::clone(log);
        Box::new(move |_, _| log.lock().push(tag))
    }

    fn pre_recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
        result: Propagation,
    ) -> PreHandler {
        let log = Arc::clone(log);
        Box::new(move |_, _| {
            log.lock().push(tag);
            result
        })
    }

    #[test]
    fn test_duplicate_subscribe_keeps_original() {
        let svc = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();

        registry.subscribe(7, recorder(&log, "first")).unwrap();
        let err = registry.subscribe(7, recorder(&log, "second")).unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateSubscription(_)));

        assert_eq!(registry.dispatch(&svc.handle(), &packet(7)), DispatchOutcome::Handled);
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[test]
    fn test_stage_order() {
        let svc = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry.subscribe(1, recorder(&log, "handler")).unwrap();
        registry
            .pre_subscribe(1, pre_recorder(&log, "pre", Propagation::Continue))
            .unwrap();
        #[cfg(feature = "unify-pre-subscribe")]
        registry
            .unify_pre_subscribe(pre_recorder(&log, "unify", Propagation::Continue))
            .unwrap();

        registry.dispatch(&svc.handle(), &packet(1));
        #[cfg(feature = "unify-pre-subscribe")]
        assert_eq!(*log.lock(), vec!["unify", "pre", "handler"]);
        #[cfg(not(feature = "unify-pre-subscribe"))]
        assert_eq!(*log.lock(), vec!["pre", "handler"]);
    }

    #[cfg(feature = "unify-pre-subscribe")]
    #[test]
    fn test_unify_stop_suppresses_later_stages() {
        let svc = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry.subscribe(1, recorder(&log, "handler")).unwrap();
        registry
            .pre_subscribe(1, pre_recorder(&log, "pre", Propagation::Continue))
            .unwrap();
        registry
            .unify_pre_subscribe(pre_recorder(&log, "unify", Propagation::Stop))
            .unwrap();

        assert_eq!(registry.dispatch(&svc.handle(), &packet(1)), DispatchOutcome::Stopped);
        assert_eq!(registry.dispatch(&svc.handle(), &packet(99)), DispatchOutcome::Stopped);
        assert_eq!(*log.lock(), vec!["unify", "unify"]);
    }

    #[cfg(feature = "unify-pre-subscribe")]
    #[test]
    fn test_second_unify_rejected() {
        let mut registry = DispatchRegistry::new();
        registry
            .unify_pre_subscribe(Box::new(|_, _| Propagation::Continue))
            .unwrap();
        assert!(matches!(
            registry.unify_pre_subscribe(Box::new(|_, _| Propagation::Continue)),
            Err(ServiceError::DuplicateSubscription(_))
        ));
    }

    #[cfg(not(feature = "unify-pre-subscribe"))]
    #[test]
    fn test_unify_not_supported() {
        let mut registry = DispatchRegistry::new();
        assert!(matches!(
            registry.unify_pre_subscribe(Box::new(|_, _| Propagation::Continue)),
            Err(ServiceError::NotSupported(_))
        ));
        assert!(!registry.has_unify());
    }

    #[test]
    fn test_pre_stop_suppresses_handler() {
        let svc = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry.subscribe(3, recorder(&log, "handler")).unwrap();
        registry
            .pre_subscribe(3, pre_recorder(&log, "pre", Propagation::Stop))
            .unwrap();

        assert_eq!(registry.dispatch(&svc.handle(), &packet(3)), DispatchOutcome::Stopped);
        assert_eq!(*log.lock(), vec!["pre"]);
    }

    #[test]
    fn test_pre_handler_alone_counts_as_handled() {
        let svc = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry
            .pre_subscribe(4, pre_recorder(&log, "pre", Propagation::Continue))
            .unwrap();
        assert!(registry.has_pre_handler(4));
        assert!(!registry.has_handler(4));

        assert_eq!(registry.dispatch(&svc.handle(), &packet(4)), DispatchOutcome::Handled);
        assert_eq!(registry.dispatch(&svc.handle(), &packet(5)), DispatchOutcome::Unhandled);
        assert_eq!(*log.lock(), vec!["pre"]);
    }
}
