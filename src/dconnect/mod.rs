//! Cross-process object proxies on top of the message bus.
//!
//! A process exports local [`Object`]s to peers through instance wrappers
//! and reaches peer objects through stubs ([`StubRef`]). Four requests
//! travel on [`DCONNECT_TARGET`]:
//!
//! | Request | Reply | Purpose |
//! |---|---|---|
//! | SETUP | SETUP_REPLY | create an instance, look up a service, or query an interface |
//! | INVOKE | INVOKE_REPLY | call one method with marshaled params |
//! | RELEASE | none | drop one handle the peer handed over |
//!
//! Lifetime across processes is tracked twice: wrappers count the handles a
//! peer holds (`ipc_refs`) inside their total count, and stubs keep a
//! checkpoint per handle received so exactly one RELEASE goes back per
//! handle. When a peer dies every wrapper it held is swept.

pub mod arena;
pub mod exception;
pub mod instance;
pub mod interface;
pub mod marshal;
pub mod object;
pub mod registry;
pub(crate) mod selector;
pub mod service;
pub mod stub;
pub mod value;
pub mod wire;
pub mod worker;

pub use arena::InstanceHandle;
pub use exception::{
    clear_current_exception, current_exception, raise, set_current_exception, take_current_exception, Exception,
    ExceptionInfo, EXCEPTION_IID,
};
pub use instance::{InstanceTable, InstanceWrapper};
pub use interface::{Direction, InterfaceCatalog, InterfaceInfo, InterfaceRepository, MethodInfo, ParamInfo, TypeTag};
pub use object::{Object, ObjectRef, ISUPPORTS_IID};
pub use registry::ComponentRegistry;
pub use service::{DConnect, DConnectStats, DCONNECT_TARGET};
pub use stub::{StubHost, StubRef, StubTable};
pub use value::Value;
pub use worker::{PoolStats, WorkerPool};
