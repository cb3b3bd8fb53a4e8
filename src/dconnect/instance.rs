//! Instance wrappers: local objects exported to one peer.
//!
//! Each wrapper carries two counters:
//!   - `refs`: total references, the wrapper's own lifetime
//!   - `ipc_refs`: handles the peer currently holds
//!
//! Every IPC reference owns one unit of `refs`. When `ipc_refs` drops to
//! zero the wrapper leaves the table under the table lock; the paired unit
//! of `refs` is released after the lock, because destroying the object may
//! run arbitrary code (including more IPC).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::arena::{Arena, InstanceHandle};
use super::object::{ObjectIdentity, ObjectRef};
use crate::types::{ClientId, InterfaceId, Result};

pub struct InstanceWrapper {
    peer: ClientId,
    iid: InterfaceId,
    handle: InstanceHandle,
    refs: AtomicU32,
    ipc_refs: AtomicU32,
    object: Mutex<Option<ObjectRef>>,
}

impl fmt::Debug for InstanceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceWrapper")
            .field("peer", &self.peer)
            .field("iid", &self.iid)
            .field("handle", &self.handle)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("ipc_refs", &self.ipc_refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl InstanceWrapper {
    pub fn peer(&self) -> ClientId {
        self.peer
    }

    pub fn iid(&self) -> InterfaceId {
        self.iid
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn ipc_refs(&self) -> u32 {
        self.ipc_refs.load(Ordering::Acquire)
    }

    /// The wrapped object, until the wrapper is destroyed.
    pub fn object(&self) -> Option<ObjectRef> {
        self.object.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.object.lock().is_none()
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one total reference; the last one destroys the object.
    /// Must not be called with the table lock held.
    pub(crate) fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let object = self.object.lock().take();
            tracing::trace!("dconnect: destroying wrapper {} for {}", self.handle, self.peer);
            drop(object);
        } else if prev == 0 {
            tracing::error!("dconnect: wrapper {} released past zero", self.handle);
            self.refs.store(0, Ordering::Release);
        }
    }
}

type WrapperKey = (ClientId, ObjectIdentity, InterfaceId);

#[derive(Debug, Default)]
struct Tables {
    arena: Arena<Arc<InstanceWrapper>>,
    index: HashMap<WrapperKey, InstanceHandle>,
}

impl Tables {
    fn unlink(&mut self, wrapper: &InstanceWrapper, key: WrapperKey) {
        self.arena.remove(wrapper.handle);
        if self.index.get(&key) == Some(&wrapper.handle) {
            self.index.remove(&key);
        }
    }
}

/// Wrappers exported by this process, reachable by handle and by
/// `(peer, object, interface)`.
#[derive(Debug, Default)]
pub struct InstanceTable {
    tables: Mutex<Tables>,
}

fn key_of(wrapper: &InstanceWrapper, identity: ObjectIdentity) -> WrapperKey {
    (wrapper.peer, identity, wrapper.iid)
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find or create the wrapper for `(peer, object, iid)` and count one
    /// more handle held by `peer`.
    pub fn acquire(&self, peer: ClientId, object: ObjectRef, iid: InterfaceId) -> Result<Arc<InstanceWrapper>> {
        let key = (peer, object.identity(), iid);
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.index.get(&key).and_then(|h| tables.arena.get(*h)) {
            let existing = existing.clone();
            existing.add_ref();
            existing.ipc_refs.fetch_add(1, Ordering::AcqRel);
            return Ok(existing);
        }
        let mut created = None;
        let handle = tables.arena.insert_with(|handle| {
            let wrapper = Arc::new(InstanceWrapper {
                peer,
                iid,
                handle,
                refs: AtomicU32::new(1),
                ipc_refs: AtomicU32::new(1),
                object: Mutex::new(Some(object)),
            });
            created = Some(wrapper.clone());
            wrapper
        })?;
        tables.index.insert(key, handle);
        drop(tables);
        tracing::debug!("dconnect: exported {} to {} as {}", iid, peer, handle);
        created.ok_or_else(|| crate::types::Error::internal("wrapper not created"))
    }

    /// Resolve a handle `peer` holds and take a temporary total reference.
    /// The caller must pair it with [`InstanceWrapper::release`].
    pub fn check_and_add_ref(&self, peer: ClientId, handle: InstanceHandle) -> Option<Arc<InstanceWrapper>> {
        let tables = self.tables.lock();
        let wrapper = tables.arena.get(handle)?;
        if wrapper.peer != peer || wrapper.ipc_refs() == 0 {
            return None;
        }
        wrapper.add_ref();
        Some(wrapper.clone())
    }

    /// A RELEASE from `peer`. Unknown or foreign handles are logged and ignored.
    pub fn release_ipc(&self, peer: ClientId, handle: InstanceHandle) {
        let wrapper = {
            let mut tables = self.tables.lock();
            let Some(wrapper) = tables.arena.get(handle).cloned() else {
                tracing::warn!("dconnect: RELEASE from {} for unknown handle {}", peer, handle);
                return;
            };
            if wrapper.peer != peer {
                tracing::warn!(
                    "dconnect: RELEASE from {} for handle {} owned by {}",
                    peer,
                    handle,
                    wrapper.peer
                );
                return;
            }
            if !Self::drop_ipc_locked(&mut tables, &wrapper) {
                return;
            }
            wrapper
        };
        wrapper.release();
    }

    /// Decrement `ipc_refs` with the table lock held; unlink at zero.
    /// Returns whether one total reference is now owed.
    fn drop_ipc_locked(tables: &mut Tables, wrapper: &Arc<InstanceWrapper>) -> bool {
        let prev = wrapper.ipc_refs.load(Ordering::Acquire);
        if prev == 0 {
            return false;
        }
        wrapper.ipc_refs.store(prev - 1, Ordering::Release);
        if prev == 1 {
            if let Some(identity) = wrapper.object().map(|o| o.identity()) {
                tables.unlink(wrapper, key_of(wrapper, identity));
            } else {
                tables.arena.remove(wrapper.handle);
            }
        }
        true
    }

    /// Undo handles that were marshaled for `peer` but never reached it.
    pub fn release_wrappers(&self, wrappers: &[Arc<InstanceWrapper>], peer: ClientId) {
        let mut owed = Vec::new();
        {
            let mut tables = self.tables.lock();
            for wrapper in wrappers {
                let live = tables
                    .arena
                    .get(wrapper.handle)
                    .is_some_and(|w| Arc::ptr_eq(w, wrapper));
                if wrapper.peer == peer && live && Self::drop_ipc_locked(&mut tables, wrapper) {
                    owed.push(wrapper.clone());
                }
            }
        }
        for wrapper in owed {
            wrapper.release();
        }
    }

    /// Drop every wrapper held by a dead peer, as if every outstanding
    /// RELEASE had arrived. Running it twice for the same peer is a no-op.
    pub fn prune_peer(&self, peer: ClientId) -> usize {
        let owed = {
            let mut tables = self.tables.lock();
            let doomed: Vec<Arc<InstanceWrapper>> = tables
                .arena
                .iter()
                .filter(|(_, w)| w.peer == peer)
                .map(|(_, w)| w.clone())
                .collect();
            Self::unlink_all_locked(&mut tables, doomed)
        };
        let count = owed.len();
        if count > 0 {
            tracing::info!("dconnect: pruned {} wrappers held by dead {}", count, peer);
        }
        for wrapper in owed {
            wrapper.release();
        }
        count
    }

    /// Release every wrapper regardless of peer.
    pub fn drain(&self) -> usize {
        let owed = {
            let mut tables = self.tables.lock();
            let all: Vec<Arc<InstanceWrapper>> = tables.arena.iter().map(|(_, w)| w.clone()).collect();
            Self::unlink_all_locked(&mut tables, all)
        };
        let count = owed.len();
        for wrapper in owed {
            wrapper.release();
        }
        count
    }

    /// Force `ipc_refs` to zero and fold all but one owed total reference
    /// while locked; the caller releases the last one after unlocking.
    fn unlink_all_locked(tables: &mut Tables, wrappers: Vec<Arc<InstanceWrapper>>) -> Vec<Arc<InstanceWrapper>> {
        let mut owed = Vec::with_capacity(wrappers.len());
        for wrapper in wrappers {
            let n = wrapper.ipc_refs.swap(0, Ordering::AcqRel);
            match wrapper.object().map(|o| o.identity()) {
                Some(identity) => tables.unlink(&wrapper, key_of(&wrapper, identity)),
                None => {
                    tables.arena.remove(wrapper.handle);
                }
            }
            if n > 0 {
                wrapper.refs.fetch_sub(n - 1, Ordering::AcqRel);
                owed.push(wrapper);
            }
        }
        owed
    }
}
