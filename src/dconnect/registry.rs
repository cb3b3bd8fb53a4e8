//! Component registry: what a SETUP can create or look up.
//!
//! - factories keyed by class id create fresh instances
//! - contract names are aliases for class ids
//! - services are per-class singletons, created on first request

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::object::ObjectRef;
use crate::types::{ClassId, Error, InterfaceId, Result};

pub type Factory = Arc<dyn Fn() -> Result<ObjectRef> + Send + Sync>;

#[derive(Default)]
struct Entries {
    factories: HashMap<ClassId, Factory>,
    contracts: HashMap<String, ClassId>,
    services: HashMap<ClassId, ObjectRef>,
}

#[derive(Default)]
pub struct ComponentRegistry {
    entries: RwLock<Entries>,
    /// Serializes lazy service construction.
    service_init: Mutex<()>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("ComponentRegistry")
            .field("factories", &entries.factories.len())
            .field("contracts", &entries.contracts.len())
            .field("services", &entries.services.len())
            .finish()
    }
}

fn narrow(object: ObjectRef, iid: &InterfaceId, cid: &ClassId) -> Result<ObjectRef> {
    if object.implements(iid) {
        Ok(object)
    } else {
        Err(Error::no_interface(format!("class {} does not implement {}", cid, iid)))
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory<F>(&self, cid: ClassId, factory: F)
    where
        F: Fn() -> Result<ObjectRef> + Send + Sync + 'static,
    {
        self.entries.write().factories.insert(cid, Arc::new(factory));
    }

    pub fn register_contract(&self, contract: impl Into<String>, cid: ClassId) {
        self.entries.write().contracts.insert(contract.into(), cid);
    }

    /// Register an already constructed service singleton.
    pub fn register_service(&self, cid: ClassId, object: ObjectRef) {
        self.entries.write().services.insert(cid, object);
    }

    pub fn resolve_contract(&self, contract: &str) -> Result<ClassId> {
        self.entries
            .read()
            .contracts
            .get(contract)
            .copied()
            .ok_or_else(|| Error::not_found(format!("contract {}", contract)))
    }

    fn factory(&self, cid: &ClassId) -> Result<Factory> {
        self.entries
            .read()
            .factories
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("class {}", cid)))
    }

    pub fn create_instance(&self, cid: &ClassId, iid: &InterfaceId) -> Result<ObjectRef> {
        let factory = self.factory(cid)?;
        narrow(factory()?, iid, cid)
    }

    pub fn create_instance_by_contract(&self, contract: &str, iid: &InterfaceId) -> Result<ObjectRef> {
        let cid = self.resolve_contract(contract)?;
        self.create_instance(&cid, iid)
    }

    pub fn get_service(&self, cid: &ClassId, iid: &InterfaceId) -> Result<ObjectRef> {
        if let Some(existing) = self.entries.read().services.get(cid).cloned() {
            return narrow(existing, iid, cid);
        }
        let _init = self.service_init.lock();
        if let Some(existing) = self.entries.read().services.get(cid).cloned() {
            return narrow(existing, iid, cid);
        }
        let factory = self.factory(cid)?;
        let service = factory()?;
        self.entries.write().services.insert(*cid, service.clone());
        tracing::debug!("component registry: created service {}", cid);
        narrow(service, iid, cid)
    }

    pub fn get_service_by_contract(&self, contract: &str, iid: &InterfaceId) -> Result<ObjectRef> {
        let cid = self.resolve_contract(contract)?;
        self.get_service(&cid, iid)
    }

    /// Drop every cached service singleton.
    pub fn clear_services(&self) {
        let services: Vec<ObjectRef> = self.entries.write().services.drain().map(|(_, s)| s).collect();
        drop(services);
    }
}
