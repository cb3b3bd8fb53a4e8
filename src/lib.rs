//! # objbroker - Distributed-Object Broker
//!
//! A small message bus plus a cross-process object proxy protocol:
//! - Broker assigning client ids, tracking target interest and announcing
//!   clients coming up and going down
//! - Message targets with a blocking wait-with-selector engine
//! - Object proxies: remote instance creation, service lookup, method
//!   invocation with marshaled params, exception propagation
//! - Dual local/IPC reference counting that survives peer death
//!
//! ## Architecture
//!
//! ```text
//!   process A                     broker                     process B
//!  ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//!  │  DConnect    │          │ client table │          │  DConnect    │
//!  │  stubs ──────┼─INVOKE──▶│ target sets  │─────────▶│  wrappers    │
//!  │  wrappers ◀──┼──────────│ forward      │◀─REPLY───┼─ worker pool │
//!  ├──────────────┤          │ liveness     │          ├──────────────┤
//!  │  BusClient   │          └──────────────┘          │  BusClient   │
//!  └──────────────┘                                    └──────────────┘
//! ```
//!
//! Transports: [`transport::LocalBroker`] in process, [`ipc`] over TCP.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod broker;
pub mod bus;
pub mod dconnect;
pub mod ipc;
pub mod transport;
pub mod types;

// Internal utilities
pub(crate) mod buf;
pub mod observability;

pub use types::{Config, Error, Result};
