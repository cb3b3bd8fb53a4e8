//! Transport boundary.
//!
//! A transport moves frames between one client process and the broker. The
//! bus layer only needs two things from it: "hand this frame to the broker"
//! and "tell me about every frame the broker sends, and when the connection
//! is gone". Peers are reached through the broker's `Forward` control
//! message; peer up/down notices arrive as `ClientState` control frames.
//!
//! Implementations:
//! - [`local::LocalBroker`]: in-process broker, one reader thread per client
//! - [`crate::ipc::TcpTransport`]: length-prefixed frames over TCP

pub mod local;

use bytes::Bytes;
use std::fmt;

use crate::types::{ClientId, Result, TargetId};

pub use local::{LocalBroker, LocalTransport};

/// Client side of a broker connection.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Hand one frame to the broker. Must not block on application logic.
    fn send(&self, target: TargetId, payload: Bytes) -> Result<()>;

    /// Tear the connection down. [`TransportHandler::on_disconnect`] fires
    /// exactly once afterwards, on the transport's reader thread.
    fn close(&self);
}

/// Callbacks a transport drives from its reader thread.
///
/// Implementations only enqueue and signal; they never block on
/// application logic.
pub trait TransportHandler: Send + Sync {
    /// One frame from the broker, in arrival order.
    fn on_message(&self, sender: ClientId, target: TargetId, payload: Bytes);

    /// The connection is gone.
    fn on_disconnect(&self);
}
