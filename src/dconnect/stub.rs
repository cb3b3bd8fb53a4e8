//! Stubs: local proxies for objects living in a peer.
//!
//! A stub entry counts local references and keeps a stack of checkpoints,
//! the reference count right after each handle the peer handed over. When
//! the count drops below the top checkpoint, that checkpoint is popped and
//! exactly one RELEASE goes back to the peer. Raw clones and drops in
//! between never produce wire traffic.
//!
//! Entries leave the table under the table lock; the RELEASE is sent after
//! the lock is dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::arena::InstanceHandle;
use super::object::ObjectRef;
use super::value::Value;
use crate::types::{ClientId, Error, InterfaceId, Result};

/// What a stub needs from the service that owns it.
pub trait StubHost: Send + Sync {
    fn stubs(&self) -> &StubTable;

    /// Fire-and-forget RELEASE of `handle` to `peer`.
    fn send_release(&self, peer: ClientId, handle: InstanceHandle);

    fn invoke(&self, stub: &StubRef, method: u16, params: &mut [Value]) -> Result<()>;

    fn query_interface(&self, stub: &StubRef, iid: &InterfaceId) -> Result<ObjectRef>;
}

struct StubCore {
    peer: ClientId,
    handle: InstanceHandle,
    iid: InterfaceId,
    host: Weak<dyn StubHost>,
}

struct StubEntry {
    core: Arc<StubCore>,
    refcnt: u32,
    levels: Vec<u32>,
}

type StubKey = (ClientId, InstanceHandle);

#[derive(Default)]
pub struct StubTable {
    entries: Mutex<HashMap<StubKey, StubEntry>>,
}

impl fmt::Debug for StubTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubTable")
            .field("stubs", &self.entries.lock().len())
            .finish()
    }
}

impl StubTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take ownership of one handle the peer handed over: find or create
    /// the stub and push a checkpoint.
    pub fn acquire_ipc(
        &self,
        host: Weak<dyn StubHost>,
        peer: ClientId,
        handle: InstanceHandle,
        iid: InterfaceId,
    ) -> StubRef {
        let mut entries = self.entries.lock();
        let entry = entries.entry((peer, handle)).or_insert_with(|| StubEntry {
            core: Arc::new(StubCore {
                peer,
                handle,
                iid,
                host,
            }),
            refcnt: 0,
            levels: Vec::new(),
        });
        entry.refcnt += 1;
        entry.levels.push(entry.refcnt);
        StubRef {
            core: entry.core.clone(),
        }
    }

    /// Current `(refcnt, checkpoints)` for a stub, if it is in the table.
    pub fn levels(&self, peer: ClientId, handle: InstanceHandle) -> Option<(u32, Vec<u32>)> {
        self.entries
            .lock()
            .get(&(peer, handle))
            .map(|e| (e.refcnt, e.levels.clone()))
    }

    fn add_ref(&self, core: &Arc<StubCore>) {
        if let Some(entry) = self.entries.lock().get_mut(&(core.peer, core.handle)) {
            if Arc::ptr_eq(&entry.core, core) {
                entry.refcnt += 1;
            }
        }
    }

    /// Returns whether a RELEASE is owed.
    fn release(&self, core: &Arc<StubCore>) -> bool {
        let mut entries = self.entries.lock();
        let key = (core.peer, core.handle);
        let Some(entry) = entries.get_mut(&key) else {
            return false;
        };
        if !Arc::ptr_eq(&entry.core, core) || entry.refcnt == 0 {
            return false;
        }
        entry.refcnt -= 1;
        let owed = match entry.levels.last() {
            Some(&top) if entry.refcnt < top => {
                entry.levels.pop();
                true
            }
            _ => false,
        };
        if entry.refcnt == 0 {
            entries.remove(&key);
        }
        owed
    }

    /// Forget every stub without telling peers.
    pub fn clear(&self) -> usize {
        let drained: Vec<StubEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        drained.len()
    }
}

/// One local reference to a remote object.
///
/// Cloning adds a local reference; dropping the last reference that covers
/// a checkpoint sends a RELEASE.
pub struct StubRef {
    core: Arc<StubCore>,
}

impl fmt::Debug for StubRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRef")
            .field("peer", &self.core.peer)
            .field("handle", &self.core.handle)
            .field("iid", &self.core.iid)
            .finish()
    }
}

impl StubRef {
    pub fn peer(&self) -> ClientId {
        self.core.peer
    }

    pub fn handle(&self) -> InstanceHandle {
        self.core.handle
    }

    pub fn iid(&self) -> InterfaceId {
        self.core.iid
    }

    fn host(&self) -> Result<Arc<dyn StubHost>> {
        self.core
            .host
            .upgrade()
            .ok_or_else(|| Error::disconnected("object proxy service is gone"))
    }

    pub fn invoke(&self, method: u16, params: &mut [Value]) -> Result<()> {
        self.host()?.invoke(self, method, params)
    }

    pub fn query_interface(&self, iid: &InterfaceId) -> Result<ObjectRef> {
        if *iid == self.core.iid {
            return Ok(ObjectRef::Remote(self.clone()));
        }
        self.host()?.query_interface(self, iid)
    }
}

impl Clone for StubRef {
    fn clone(&self) -> Self {
        if let Some(host) = self.core.host.upgrade() {
            host.stubs().add_ref(&self.core);
        }
        Self {
            core: self.core.clone(),
        }
    }
}

impl Drop for StubRef {
    fn drop(&mut self) {
        let Some(host) = self.core.host.upgrade() else {
            return;
        };
        if host.stubs().release(&self.core) {
            host.send_release(self.core.peer, self.core.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeHost {
        table: StubTable,
        sent: Mutex<Vec<(ClientId, InstanceHandle)>>,
    }

    impl StubHost for FakeHost {
        fn stubs(&self) -> &StubTable {
            &self.table
        }

        fn send_release(&self, peer: ClientId, handle: InstanceHandle) {
            self.sent.lock().push((peer, handle));
        }

        fn invoke(&self, _stub: &StubRef, _method: u16, _params: &mut [Value]) -> Result<()> {
            Ok(())
        }

        fn query_interface(&self, _stub: &StubRef, iid: &InterfaceId) -> Result<ObjectRef> {
            Err(Error::no_interface(iid.to_string()))
        }
    }

    const PEER: ClientId = ClientId::new(2);
    const IID: InterfaceId = InterfaceId::from_u128(0x5);

    fn handle() -> InstanceHandle {
        InstanceHandle::from_raw(0x40)
    }

    fn setup() -> (Arc<FakeHost>, Weak<dyn StubHost>) {
        let host = Arc::new(FakeHost::default());
        let weak: Weak<dyn StubHost> = Arc::downgrade(&host) as Weak<dyn StubHost>;
        (host, weak)
    }

    #[test]
    fn test_one_release_per_checkpoint() {
        let (host, weak) = setup();
        // 1 (checkpoint), 2, 1, 2 (checkpoint), 3, 2, 1 (pop), 0 (pop)
        let first = host.table.acquire_ipc(weak.clone(), PEER, handle(), IID);
        let extra = first.clone();
        drop(extra);
        let second = host.table.acquire_ipc(weak, PEER, handle(), IID);
        assert_eq!(host.table.levels(PEER, handle()), Some((2, vec![1, 2])));
        let extra = second.clone();
        drop(extra);
        assert!(host.sent.lock().is_empty());
        drop(second);
        assert_eq!(host.sent.lock().len(), 1);
        assert_eq!(host.table.levels(PEER, handle()), Some((1, vec![1])));
        drop(first);
        assert_eq!(*host.sent.lock(), vec![(PEER, handle()), (PEER, handle())]);
        assert!(host.table.is_empty());
    }

    #[test]
    fn test_clones_never_release_early() {
        let (host, weak) = setup();
        let stub = host.table.acquire_ipc(weak, PEER, handle(), IID);
        let clones: Vec<StubRef> = (0..5).map(|_| stub.clone()).collect();
        drop(stub);
        assert!(host.sent.lock().is_empty());
        drop(clones);
        assert_eq!(host.sent.lock().len(), 1);
    }

    #[test]
    fn test_clear_forgets_without_sending() {
        let (host, weak) = setup();
        let stub = host.table.acquire_ipc(weak, PEER, handle(), IID);
        assert_eq!(host.table.clear(), 1);
        drop(stub);
        assert!(host.sent.lock().is_empty());
    }

    #[test]
    fn test_query_same_interface_is_local() {
        let (host, weak) = setup();
        let stub = host.table.acquire_ipc(weak, PEER, handle(), IID);
        let same = stub.query_interface(&IID).unwrap();
        assert_eq!(same.as_stub().unwrap().handle(), handle());
        assert!(matches!(
            stub.query_interface(&InterfaceId::from_u128(6)),
            Err(Error::NoInterface(_))
        ));
    }
}
