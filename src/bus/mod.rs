//! Message-target dispatch engine.
//!
//! - **Targets** ([`target`]): logical channels with a pending queue and optional observer
//! - **Wait engine** ([`wait`]): blocking, selector-driven consumption with single delivery
//! - **Control protocol** ([`control`]): HELLO, target interest, forwarding, liveness
//! - **Client** ([`client`]): one process's connection and its state machine

pub mod client;
pub mod control;
pub(crate) mod delivery;
pub mod envelope;
pub mod target;
pub mod wait;

pub use client::{BusClient, ClientObserver, LinkState, ObserverGuard};
pub use control::ControlMessage;
pub use envelope::{Body, ClientState, Envelope};
pub use target::MessageObserver;
pub use wait::{Admit, AnyMessage, Selector};
