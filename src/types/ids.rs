//! Strongly-typed identifiers.
//!
//! Targets, interfaces and component classes are all 128-bit ids; clients
//! are broker-assigned 32-bit numbers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Macro to define a 128-bit id newtype wrapper over [`Uuid`].
///
/// Generates: struct, `from_u128()`, `from_bytes()`, `as_bytes()`, `new_random()`,
/// `parse()`, Display and FromStr.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub const fn from_u128(v: u128) -> Self {
                Self(Uuid::from_u128(v))
            }

            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, &'static str> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| concat!(stringify!($name), " is not a valid uuid"))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }

        impl FromStr for $name {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Logical message channel id.
    TargetId
);
define_id!(
    /// Interface id (the key into the interface repository).
    InterfaceId
);
define_id!(
    /// Component class id.
    ClassId
);

impl TargetId {
    /// Reserved target carrying the broker control protocol.
    pub const CONTROL: TargetId = TargetId::from_u128(0x753c_a8ff_c8c2_4601_b115_8c29_44da_1150);
}

/// Broker-assigned client id. `0` is the broker itself and the "any" sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u32);

impl ClientId {
    /// The broker, and the wildcard sender.
    pub const ANY: ClientId = ClientId(0);
    pub const BROKER: ClientId = ClientId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u32 {
        self.0
    }

    pub fn is_any(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "client:any")
        } else {
            write!(f, "client:{}", self.0)
        }
    }
}

/// Per-process request correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIndex(pub u32);

impl fmt::Display for RequestIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic allocator for [`RequestIndex`] values. Never hands out `0`.
#[derive(Debug, Default)]
pub struct RequestCounter(AtomicU32);

impl RequestCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn next(&self) -> RequestIndex {
        loop {
            let v = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if v != 0 {
                return RequestIndex(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counter_is_monotonic() {
        let counter = RequestCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert_eq!(a.0 + 1, b.0);
        assert_ne!(a.0, 0);
    }

    #[test]
    fn test_id_parse_and_display() {
        let s = "43ca47ef-ebc8-47a2-9679-a4703218089f";
        let id: TargetId = s.parse().unwrap();
        assert_eq!(id.to_string(), s);
        assert!(InterfaceId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_client_any() {
        assert!(ClientId::ANY.is_any());
        assert!(!ClientId::new(3).is_any());
        assert_eq!(ClientId::new(3).to_string(), "client:3");
    }
}
