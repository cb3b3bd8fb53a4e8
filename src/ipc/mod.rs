//! TCP transport for the broker.
//!
//! Length-prefixed envelope frames (see [`codec`]) between the broker
//! daemon ([`BrokerServer`]) and bus clients ([`TcpTransport`]).

pub mod client;
pub mod codec;
pub mod server;

pub use client::TcpTransport;
pub use server::BrokerServer;
