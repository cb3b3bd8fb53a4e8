//! Core types shared by every layer.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TargetId, ClientId, InterfaceId, etc.)
//! - **Errors**: Error taxonomy with wire status mapping
//! - **Config**: Configuration structures for broker, bus and object proxies

mod config;
mod errors;
mod ids;

pub use config::{
    BrokerConfig, BusConfig, Config, DConnectConfig, ObservabilityConfig, WorkerPoolConfig,
};
pub use errors::{status, Error, Result};
pub use ids::{ClassId, ClientId, InterfaceId, RequestCounter, RequestIndex, TargetId};
