//! Error types for the service engine.

use harbor_net::{SessionId, TransportError};

use crate::handle::ServiceId;

/// Failure reported by a [`Facade`](crate::Facade) hook.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// The hook could not complete.
    #[error("{reason}")]
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

impl FacadeError {
    /// Shorthand for [`FacadeError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Failure decoding a packet payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload was not valid UTF-8.
    #[error("invalid UTF-8 payload: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The payload did not match the expected layout.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Errors returned by service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A service id already has delegates in the global index.
    #[error("service {service} is already initialized")]
    AlreadyInitialized {
        /// The duplicate id.
        service: ServiceId,
    },

    /// The operation is only allowed before start.
    #[error("service is already started")]
    AlreadyStarted,

    /// The operation needs a started service.
    #[error("service is not started")]
    NotStarted,

    /// A previous stop failed part way; call `stop` again to finish it.
    #[error("service teardown is pending")]
    TeardownPending,

    /// The operation is not available in the current drive mode.
    #[error("operation is not available in {0:?} mode")]
    WrongDriveMode(harbor_config::DriveMode),

    /// The capability was compiled out.
    #[error("{0} is not supported by this build")]
    NotSupported(&'static str),

    /// A handler is already registered for this slot.
    #[error("duplicate subscription for {0}")]
    DuplicateSubscription(String),

    /// A coder is already registered for this opcode.
    #[error("a coder is already registered for opcode {opcode}")]
    AlreadyRegistered {
        /// The duplicate opcode.
        opcode: u32,
    },

    /// No coder is registered for this opcode.
    #[error("no decoder registered for opcode {opcode}")]
    NotFoundDecoder {
        /// The unknown opcode.
        opcode: u32,
    },

    /// The session is unknown or already closed.
    #[error("invalid session {0}")]
    InvalidSession(SessionId),

    /// An encoded packet exceeds the transport's frame limit.
    #[error("encoded packet of {size} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge {
        /// Encoded frame size.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// Frame rate must be at least 1.
    #[error("fps must be at least 1")]
    InvalidFps,

    /// An address string could not be parsed.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// A facade hook failed during start or stop.
    #[error("facade {facade} failed in {hook}: {source}")]
    FacadeFault {
        /// Facade name.
        facade: String,
        /// Hook that failed.
        hook: &'static str,
        /// Underlying error.
        source: FacadeError,
    },

    /// The execution thread could not be spawned.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ServiceError {
    /// Stable snake_case label for logs and counters.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::AlreadyStarted => "already_started",
            Self::NotStarted => "not_started",
            Self::TeardownPending => "teardown_pending",
            Self::WrongDriveMode(_) => "wrong_drive_mode",
            Self::NotSupported(_) => "not_supported",
            Self::DuplicateSubscription(_) => "duplicate_subscription",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::NotFoundDecoder { .. } => "not_found_decoder",
            Self::InvalidSession(_) => "invalid_session",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidFps => "invalid_fps",
            Self::InvalidAddress(_) => "invalid_address",
            Self::FacadeFault { .. } => "facade_fault",
            Self::Io(_) => "io",
            Self::Transport(_) => "transport",
            Self::Codec(_) => "codec",
        }
    }

    /// Map a transport error, turning unknown sessions into
    /// [`ServiceError::InvalidSession`].
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::InvalidSession(id) => Self::InvalidSession(id),
            TransportError::ShutDown => Self::NotStarted,
            other => Self::Transport(other),
        }
    }
}
