//! Target registry.
//!
//! A target is a logical message channel identified by a 128-bit id. Each
//! record owns its pending queue, its own mutex/condvar pair and an optional
//! observer. Records are reference counted, so `undefine` is safe while other
//! threads are still blocked on the target.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::delivery::DeliveryJob;
use super::envelope::Envelope;
use crate::types::{Error, Result, TargetId};

/// Receives envelopes for a target when nobody is waiting on it.
///
/// Called on the bus delivery thread, one envelope at a time.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, envelope: &Envelope);
}

#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) seq: u64,
    pub(crate) envelope: Envelope,
    pub(crate) in_process: bool,
    /// Another waiter skipped this entry while it was in-process.
    pub(crate) contended: bool,
}

pub(crate) struct TargetQueue {
    pub(crate) entries: VecDeque<Pending>,
    /// Bumped when an entry is added or removed, or waiters must re-check
    /// their gate. Releasing an in-process marker does not count.
    pub(crate) epoch: u64,
    next_seq: u64,
    pub(crate) disabled: u32,
    pub(crate) observer: Option<Arc<dyn MessageObserver>>,
    /// Registered by the application, as opposed to created by an inbound message.
    pub(crate) defined: bool,
    pub(crate) removed: bool,
}

impl fmt::Debug for TargetQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetQueue")
            .field("pending", &self.entries.len())
            .field("disabled", &self.disabled)
            .field("has_observer", &self.observer.is_some())
            .field("defined", &self.defined)
            .field("removed", &self.removed)
            .finish()
    }
}

impl TargetQueue {
    fn observer_enabled(&self) -> bool {
        self.observer.is_some() && self.disabled == 0
    }
}

/// One target record.
#[derive(Debug)]
pub(crate) struct Target {
    pub(crate) id: TargetId,
    pub(crate) queue: Mutex<TargetQueue>,
    pub(crate) cond: Condvar,
}

impl Target {
    pub(crate) fn new(id: TargetId) -> Self {
        Self {
            id,
            queue: Mutex::new(TargetQueue {
                entries: VecDeque::new(),
                epoch: 0,
                next_seq: 0,
                disabled: 0,
                observer: None,
                defined: false,
                removed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append an envelope and wake waiters. Returns true when the observer
    /// should be kicked.
    pub(crate) fn push(&self, envelope: Envelope) -> bool {
        let mut q = self.queue.lock();
        let seq = q.next_seq;
        q.next_seq += 1;
        q.epoch += 1;
        q.entries.push_back(Pending {
            seq,
            envelope,
            in_process: false,
            contended: false,
        });
        self.cond.notify_all();
        q.observer_enabled()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Wake every waiter so it re-checks its gate.
    pub(crate) fn wake(&self) {
        let mut q = self.queue.lock();
        q.epoch += 1;
        self.cond.notify_all();
    }

    pub(crate) fn mark_removed(&self) {
        let mut q = self.queue.lock();
        q.removed = true;
        q.observer = None;
        q.epoch += 1;
        self.cond.notify_all();
    }

    /// Pop the oldest envelope not held by a waiter, if the observer is enabled.
    pub(crate) fn take_for_observer(&self) -> Option<(Arc<dyn MessageObserver>, Envelope)> {
        let mut q = self.queue.lock();
        if !q.observer_enabled() {
            return None;
        }
        let observer = q.observer.clone()?;
        let pos = q.entries.iter().position(|p| !p.in_process)?;
        let pending = q.entries.remove(pos)?;
        q.epoch += 1;
        self.cond.notify_all();
        Some((observer, pending.envelope))
    }

    /// Adjust the disabled-count. Returns true when the observer just became
    /// enabled with envelopes waiting.
    pub(crate) fn set_observer_enabled(&self, enabled: bool) -> Result<bool> {
        let mut q = self.queue.lock();
        if enabled {
            if q.disabled == 0 {
                return Err(Error::validation(format!(
                    "observer on {} is not disabled",
                    self.id
                )));
            }
            q.disabled -= 1;
            Ok(q.observer_enabled() && !q.entries.is_empty())
        } else {
            q.disabled += 1;
            Ok(false)
        }
    }

    pub(crate) fn has_pending_for_observer(&self) -> bool {
        let q = self.queue.lock();
        q.observer_enabled() && q.entries.iter().any(|p| !p.in_process)
    }
}

/// Map from target id to record.
#[derive(Debug)]
pub(crate) struct TargetRegistry {
    targets: RwLock<HashMap<TargetId, Arc<Target>>>,
    kick: mpsc::UnboundedSender<DeliveryJob>,
}

impl TargetRegistry {
    pub(crate) fn new(kick: mpsc::UnboundedSender<DeliveryJob>) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            kick,
        }
    }

    /// Register a target (or adopt a record created by an inbound message).
    pub(crate) fn define(
        &self,
        id: TargetId,
        observer: Option<Arc<dyn MessageObserver>>,
    ) -> Result<Arc<Target>> {
        let target = self.get_or_create(id);
        let kick = {
            let mut q = target.queue.lock();
            if q.defined {
                return Err(Error::validation(format!("target {} is already defined", id)));
            }
            q.defined = true;
            q.observer = observer;
            q.observer_enabled() && !q.entries.is_empty()
        };
        if kick {
            self.kick(id);
        }
        Ok(target)
    }

    pub(crate) fn undefine(&self, id: &TargetId) -> Option<Arc<Target>> {
        let target = self.targets.write().remove(id)?;
        target.mark_removed();
        Some(target)
    }

    pub(crate) fn get(&self, id: &TargetId) -> Option<Arc<Target>> {
        self.targets.read().get(id).cloned()
    }

    pub(crate) fn get_or_create(&self, id: TargetId) -> Arc<Target> {
        if let Some(t) = self.get(&id) {
            return t;
        }
        self.targets
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Target::new(id)))
            .clone()
    }

    /// Queue an inbound envelope on its target.
    pub(crate) fn enqueue(&self, envelope: Envelope) {
        let id = envelope.target;
        let target = self.get_or_create(id);
        if target.push(envelope) {
            self.kick(id);
        }
    }

    /// Push one envelope built by `make` onto every target except `skip`.
    /// Target locks are taken one at a time.
    pub(crate) fn fan_out(&self, skip: &TargetId, make: impl Fn(TargetId) -> Envelope) {
        let targets: Vec<Arc<Target>> = self.targets.read().values().cloned().collect();
        for target in targets {
            if target.id == *skip {
                continue;
            }
            if target.push(make(target.id)) {
                self.kick(target.id);
            }
        }
    }

    pub(crate) fn set_observer_enabled(&self, id: &TargetId, enabled: bool) -> Result<()> {
        let target = self
            .get(id)
            .ok_or_else(|| Error::not_found(format!("target {}", id)))?;
        if target.set_observer_enabled(enabled)? {
            self.kick(*id);
        }
        Ok(())
    }

    pub(crate) fn wake_all(&self) {
        let targets: Vec<Arc<Target>> = self.targets.read().values().cloned().collect();
        for target in targets {
            target.wake();
        }
    }

    pub(crate) fn ids(&self) -> Vec<TargetId> {
        self.targets.read().keys().copied().collect()
    }

    pub(crate) fn kick(&self, id: TargetId) {
        // Receiver only goes away with the bus itself.
        let _ = self.kick.send(DeliveryJob::Kick(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientId;
    use bytes::Bytes;

    struct Sink;
    impl MessageObserver for Sink {
        fn on_message(&self, _envelope: &Envelope) {}
    }

    fn registry() -> (TargetRegistry, mpsc::UnboundedReceiver<DeliveryJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TargetRegistry::new(tx), rx)
    }

    fn env(id: TargetId) -> Envelope {
        Envelope::data(ClientId::new(1), id, Bytes::from_static(b"m"))
    }

    #[test]
    fn test_define_twice_fails_but_adopts_inbound_record() {
        let (reg, _rx) = registry();
        let id = TargetId::from_u128(10);
        reg.enqueue(env(id));
        assert!(reg.get(&id).is_some());
        reg.define(id, None).unwrap();
        assert!(reg.define(id, None).is_err());
        assert_eq!(reg.get(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_reenable_with_backlog_kicks_delivery() {
        let (reg, mut rx) = registry();
        let id = TargetId::from_u128(11);
        reg.define(id, Some(Arc::new(Sink))).unwrap();
        reg.set_observer_enabled(&id, false).unwrap();

        reg.enqueue(env(id));
        assert!(rx.try_recv().is_err(), "no kick while disabled");

        reg.set_observer_enabled(&id, true).unwrap();
        assert!(matches!(rx.try_recv(), Ok(DeliveryJob::Kick(k)) if k == id));
        let target = reg.get(&id).unwrap();
        assert!(target.take_for_observer().is_some());
        assert!(target.take_for_observer().is_none());
    }

    #[test]
    fn test_enable_without_disable_is_rejected() {
        let (reg, _rx) = registry();
        let id = TargetId::from_u128(12);
        reg.define(id, Some(Arc::new(Sink))).unwrap();
        assert!(reg.set_observer_enabled(&id, true).is_err());
    }

    #[test]
    fn test_undefine_keeps_handle_usable() {
        let (reg, _rx) = registry();
        let id = TargetId::from_u128(13);
        let handle = reg.define(id, None).unwrap();
        reg.undefine(&id).unwrap();
        assert!(reg.get(&id).is_none());
        assert!(handle.queue.lock().removed);
        handle.push(env(id));
        assert_eq!(handle.len(), 1);
    }

    #[test]
    fn test_fan_out_skips_excluded_target() {
        let (reg, _rx) = registry();
        let a = TargetId::from_u128(20);
        let b = TargetId::from_u128(21);
        reg.define(a, None).unwrap();
        reg.define(b, None).unwrap();
        reg.fan_out(&a, env);
        assert_eq!(reg.get(&a).unwrap().len(), 0);
        assert_eq!(reg.get(&b).unwrap().len(), 1);
    }
}
