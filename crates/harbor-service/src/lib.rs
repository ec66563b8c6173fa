//! Service engine for Harbor.
//!
//! A [`Service`] owns a TCP transport, a list of [`Facade`]s, a
//! [`TimerScheduler`] and an opcode-keyed [`DispatchRegistry`]. Transport I/O
//! threads decode frames into [`Packet`]s through the process-wide delegate
//! index and queue them for the service's tick. The tick runs either on the
//! service's own execution thread ([`DriveMode::SelfDrive`]) or on the host's
//! thread through [`Service::on_svc`] ([`DriveMode::ExternalDrive`]); facade
//! hooks, handlers and timer callbacks never run anywhere else.
//!
//! # Example
//!
//! ```no_run
//! use harbor_service::{ServiceBuilder, ServiceError};
//!
//! fn main() -> Result<(), ServiceError> {
//!     let mut svc = ServiceBuilder::new("echo").fps(60).build()?;
//!     svc.register_coder::<String>(1)?;
//!     svc.subscribe(1, |svc, packet| {
//!         if let Some(text) = packet.decoded::<String>() {
//!             let _ = svc.send(packet.session_id, 1, text, 0);
//!         }
//!     })?;
//!     svc.start(2)?;
//!     svc.listen("127.0.0.1", 7777)?;
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     svc.stop()
//! }
//! ```

mod codec;
mod delegates;
mod dispatch;
mod engine;
mod error;
mod facade;
mod handle;
mod service;
mod timer;

pub use codec::{Coder, Packet};
pub use delegates::{
    DecodeDelegate, DeliverDelegate, EncodeDelegate, PacketDelegates, ServiceEvent,
    add_packet_delegates, packet_delegates, registered_service_count, remove_packet_delegates,
};
pub use dispatch::{DispatchOutcome, DispatchRegistry, Handler, PreHandler, Propagation};
pub use engine::{NotFoundDecoderHook, TickReport};
pub use error::{CodecError, FacadeError, ServiceError};
pub use facade::{Facade, FacadeFactory, FacadeResult};
pub use handle::{ServiceHandle, ServiceId, ServiceState};
pub use service::{DEFAULT_FPS, Service, ServiceBuilder};
pub use timer::{Timer, TimerId, TimerScheduler, TimerState};

pub use harbor_config::{DriveMode, ServiceKind};
pub use harbor_net::{AsyncConnResult, SessionId, SessionInfo};
