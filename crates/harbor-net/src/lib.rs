//! TCP transport for Harbor services: framing, session bookkeeping, and the
//! runtime-owning [`Transport`] that reports session activity through
//! [`TransportEvents`].

pub mod framing;
pub mod session;
pub mod transport;

pub use framing::{
    FrameConfig, FrameError, FrameMode, LENGTH_PREFIX_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    checked_frame_len, read_frame, write_frame,
};
pub use session::{IdGenerator, SessionId, SessionInfo, SessionLimitReached, SessionOrigin};
pub use transport::{
    AsyncConnResult, Transport, TransportConfig, TransportError, TransportEvents,
};
