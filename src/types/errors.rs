//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Every variant maps onto a 32-bit wire
//! status so failures can cross a process boundary and come back as the same
//! variant on the calling side.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire status codes carried in SETUP_REPLY / INVOKE_REPLY and broker acks.
pub mod status {
    pub const OK: u32 = 0;
    pub const NOT_IMPLEMENTED: u32 = 0x8000_4001;
    pub const NO_INTERFACE: u32 = 0x8000_4002;
    pub const ABORT: u32 = 0x8000_4004;
    pub const FAILURE: u32 = 0x8000_4005;
    pub const UNEXPECTED: u32 = 0x8000_FFFF;
    pub const OUT_OF_MEMORY: u32 = 0x8007_000E;
    pub const INVALID_ARG: u32 = 0x8007_0057;
    pub const NOT_AVAILABLE: u32 = 0x8004_0111;
    pub const FACTORY_NOT_REGISTERED: u32 = 0x8004_0154;
    pub const NOT_INITIALIZED: u32 = 0xC1F3_0001;
    pub const ALREADY_INITIALIZED: u32 = 0xC1F3_0002;
    pub const TIMEOUT: u32 = 0x804B_000E;

    /// True for any status with the failure bit set.
    pub fn failed(status: u32) -> bool {
        status & 0x8000_0000 != 0
    }
}

/// Main error enum for the broker, bus and object-proxy layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, oversized or unexpected message. Recoverable, never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown target, handle, class or contract name.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object does not implement the requested interface.
    #[error("no interface: {0}")]
    NoInterface(String),

    /// A synchronous call exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer process went away mid-call.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// Table insertion or allocation failure.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// The callee reported an application-level failure.
    #[error("remote exception 0x{status:08X}: {message}")]
    RemoteException { status: u32, message: String },

    /// The id is reserved by the bus itself.
    #[error("already reserved: {0}")]
    AlreadyReserved(String),

    /// Caller supplied an invalid argument.
    #[error("validation error: {0}")]
    Validation(String),

    /// The bus connection is not up (or is shutting down).
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Shape the marshaler does not support.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to a wire status code.
    pub fn status(&self) -> u32 {
        match self {
            Error::Protocol(_) => status::UNEXPECTED,
            Error::NotFound(_) => status::FACTORY_NOT_REGISTERED,
            Error::NoInterface(_) => status::NO_INTERFACE,
            Error::Timeout(_) => status::TIMEOUT,
            Error::PeerGone(_) => status::NOT_AVAILABLE,
            Error::OutOfResources(_) => status::OUT_OF_MEMORY,
            Error::RemoteException { status, .. } => *status,
            Error::AlreadyReserved(_) => status::ALREADY_INITIALIZED,
            Error::Validation(_) => status::INVALID_ARG,
            Error::Disconnected(_) => status::NOT_INITIALIZED,
            Error::NotImplemented(_) => status::NOT_IMPLEMENTED,
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => status::FAILURE,
        }
    }

    /// Rebuild an error from a wire status received from a peer.
    ///
    /// Statuses that do not correspond to a library failure come back as
    /// [`Error::RemoteException`].
    pub fn from_status(code: u32, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            status::UNEXPECTED => Error::Protocol(msg),
            status::FACTORY_NOT_REGISTERED => Error::NotFound(msg),
            status::NO_INTERFACE => Error::NoInterface(msg),
            status::TIMEOUT => Error::Timeout(msg),
            status::NOT_AVAILABLE => Error::PeerGone(msg),
            status::OUT_OF_MEMORY => Error::OutOfResources(msg),
            status::ALREADY_INITIALIZED => Error::AlreadyReserved(msg),
            status::INVALID_ARG => Error::Validation(msg),
            status::NOT_INITIALIZED => Error::Disconnected(msg),
            status::NOT_IMPLEMENTED => Error::NotImplemented(msg),
            other => Error::RemoteException {
                status: other,
                message: msg,
            },
        }
    }

    /// Stable string code used in logs and broker acks.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NoInterface(_) => "NO_INTERFACE",
            Error::Timeout(_) => "TIMEOUT",
            Error::PeerGone(_) => "PEER_GONE",
            Error::OutOfResources(_) => "OUT_OF_RESOURCES",
            Error::RemoteException { .. } => "REMOTE_EXCEPTION",
            Error::AlreadyReserved(_) => "ALREADY_RESERVED",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Disconnected(_) => "DISCONNECTED",
            Error::NotImplemented(_) => "NOT_IMPLEMENTED",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }

    /// True when the error means the other side is unreachable for good.
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Error::PeerGone(_) | Error::Disconnected(_))
    }
}

// Convenience constructors
impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn no_interface(msg: impl Into<String>) -> Self {
        Self::NoInterface(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn peer_gone(msg: impl Into<String>) -> Self {
        Self::PeerGone(msg.into())
    }

    pub fn out_of_resources(msg: impl Into<String>) -> Self {
        Self::OutOfResources(msg.into())
    }

    pub fn remote(status: u32, message: impl Into<String>) -> Self {
        Self::RemoteException {
            status,
            message: message.into(),
        }
    }

    pub fn already_reserved(msg: impl Into<String>) -> Self {
        Self::AlreadyReserved(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
