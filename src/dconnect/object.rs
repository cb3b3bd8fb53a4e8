//! Objects that can cross the process boundary.

use std::fmt;
use std::sync::Arc;

use super::arena::InstanceHandle;
use super::exception::ExceptionInfo;
use super::stub::StubRef;
use super::value::Value;
use crate::types::{ClientId, Error, InterfaceId, Result};

/// The root interface every object answers to.
pub const ISUPPORTS_IID: InterfaceId =
    InterfaceId::from_u128(0x0000_0000_0000_0000_c000_0000_0000_0046);

/// A local object exposed through one or more interfaces.
///
/// `call` receives every parameter slot of the method, in declaration order.
/// In-params hold the caller's values; the implementation writes out-params
/// and the return value in place. To report an application failure, return
/// the error produced by [`super::exception::raise`].
pub trait Object: Send + Sync {
    fn implements(&self, iid: &InterfaceId) -> bool;

    fn call(&self, iid: &InterfaceId, method: u16, params: &mut [Value]) -> Result<()>;

    /// Set only by exception objects.
    fn exception_info(&self) -> Option<ExceptionInfo> {
        None
    }
}

/// Identity used to deduplicate exported wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ObjectIdentity {
    Local(usize),
    Remote(ClientId, InstanceHandle),
}

/// A reference to an object, local or living in a peer process.
#[derive(Clone)]
pub enum ObjectRef {
    Local(Arc<dyn Object>),
    Remote(StubRef),
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Local(obj) => write!(f, "Local({:p})", Arc::as_ptr(obj) as *const ()),
            ObjectRef::Remote(stub) => write!(f, "Remote({:?})", stub),
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl ObjectRef {
    pub fn local(object: impl Object + 'static) -> Self {
        ObjectRef::Local(Arc::new(object))
    }

    pub(crate) fn identity(&self) -> ObjectIdentity {
        match self {
            ObjectRef::Local(obj) => ObjectIdentity::Local(Arc::as_ptr(obj) as *const () as usize),
            ObjectRef::Remote(stub) => ObjectIdentity::Remote(stub.peer(), stub.handle()),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ObjectRef::Remote(_))
    }

    pub fn as_stub(&self) -> Option<&StubRef> {
        match self {
            ObjectRef::Remote(stub) => Some(stub),
            ObjectRef::Local(_) => None,
        }
    }

    /// Whether `iid` can be used without a round trip.
    pub fn implements(&self, iid: &InterfaceId) -> bool {
        match self {
            ObjectRef::Local(obj) => *iid == ISUPPORTS_IID || obj.implements(iid),
            ObjectRef::Remote(stub) => stub.iid() == *iid,
        }
    }

    /// Get a reference usable through `iid`. Remote objects ask their owner.
    pub fn query_interface(&self, iid: &InterfaceId) -> Result<ObjectRef> {
        if self.implements(iid) {
            return Ok(self.clone());
        }
        match self {
            ObjectRef::Local(_) => Err(Error::no_interface(format!("object does not implement {}", iid))),
            ObjectRef::Remote(stub) => stub.query_interface(iid),
        }
    }

    /// Call `method` of interface `iid`.
    pub fn invoke(&self, iid: &InterfaceId, method: u16, params: &mut [Value]) -> Result<()> {
        match self {
            ObjectRef::Local(obj) => obj.call(iid, method, params),
            ObjectRef::Remote(stub) => {
                if stub.iid() != *iid {
                    return Err(Error::no_interface(format!(
                        "proxy is bound to {}, not {}",
                        stub.iid(),
                        iid
                    )));
                }
                stub.invoke(method, params)
            }
        }
    }

    pub fn exception_info(&self) -> Option<ExceptionInfo> {
        match self {
            ObjectRef::Local(obj) => obj.exception_info(),
            ObjectRef::Remote(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    const ICOUNTER: InterfaceId = InterfaceId::from_u128(0xC0);

    impl Object for Counter {
        fn implements(&self, iid: &InterfaceId) -> bool {
            *iid == ICOUNTER
        }

        fn call(&self, _iid: &InterfaceId, method: u16, params: &mut [Value]) -> Result<()> {
            match (method, params) {
                (0, [Value::U32(n), out]) => {
                    *out = Value::U32(*n + 1);
                    Ok(())
                }
                _ => Err(Error::validation("bad call")),
            }
        }
    }

    #[test]
    fn test_local_invoke_writes_out_param() {
        let obj = ObjectRef::local(Counter);
        let mut params = vec![Value::U32(41), Value::U32(0)];
        obj.invoke(&ICOUNTER, 0, &mut params).unwrap();
        assert_eq!(params[1], Value::U32(42));
    }

    #[test]
    fn test_query_interface_on_local_object() {
        let obj = ObjectRef::local(Counter);
        assert_eq!(obj.query_interface(&ISUPPORTS_IID).unwrap(), obj);
        assert!(matches!(
            obj.query_interface(&InterfaceId::from_u128(1)),
            Err(Error::NoInterface(_))
        ));
    }

    #[test]
    fn test_identity_follows_allocation_not_clone() {
        let a = ObjectRef::local(Counter);
        let b = ObjectRef::local(Counter);
        assert_eq!(a.identity(), a.clone().identity());
        assert_ne!(a, b);
    }
}
