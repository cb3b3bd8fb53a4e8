//! Bus client: one process's connection to the broker.
//!
//! Connection state machine:
//! ```text
//! Disconnected -> Connecting -> Connected -> ShuttingDown -> Disconnected
//! ```
//! - `Connecting`: transport is up, the control target exists, HELLO is in flight
//! - `Connected`: targets can be defined, messages forwarded and awaited
//! - `ShuttingDown`: the control target still works; every other wait fails
//!
//! Control requests (HELLO, AddTarget, DelTarget, Forward, Ping) are
//! correlated with the broker's reply by request index through the same
//! wait engine applications use.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::control::ControlMessage;
use super::delivery::{self, DeliveryJob};
use super::envelope::{ClientState, Envelope};
use super::target::{MessageObserver, Target, TargetQueue, TargetRegistry};
use super::wait::{Admit, Selector};
use crate::transport::{LocalBroker, Transport, TransportHandler};
use crate::types::{
    status, BusConfig, ClientId, Error, RequestCounter, RequestIndex, Result, TargetId,
};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    ShuttingDown = 3,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::ShuttingDown,
            _ => LinkState::Disconnected,
        }
    }
}

/// Notified when the broker reports a client coming up or going down.
///
/// A `Down` for [`ClientId::ANY`] means this process lost its own bus
/// connection. Called on the delivery thread.
pub trait ClientObserver: Send + Sync {
    fn on_client_state(&self, client: ClientId, state: ClientState);
}

pub(crate) struct BusInner {
    config: BusConfig,
    registry: TargetRegistry,
    link: AtomicU8,
    client_id: AtomicU32,
    requests: RequestCounter,
    /// Control requests still waiting for the broker's reply.
    awaiting: Mutex<HashSet<RequestIndex>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    client_observers: RwLock<Vec<(u64, Arc<dyn ClientObserver>)>>,
    next_observer: AtomicU64,
    jobs: mpsc::UnboundedSender<DeliveryJob>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner")
            .field("client_id", &self.client_id.load(Ordering::Relaxed))
            .field("link", &self.link())
            .field("targets", &self.registry.ids().len())
            .finish()
    }
}

impl BusInner {
    fn link(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::Acquire))
    }

    fn set_link(&self, state: LinkState) -> LinkState {
        LinkState::from_u8(self.link.swap(state as u8, Ordering::AcqRel))
    }

    fn gate(&self, target: &TargetId, q: &TargetQueue) -> Result<()> {
        match self.link() {
            LinkState::Disconnected => Err(Error::peer_gone("bus connection lost")),
            LinkState::ShuttingDown if *target != TargetId::CONTROL => {
                Err(Error::disconnected("bus is shutting down"))
            }
            _ if q.removed => Err(Error::not_found(format!("target {} was undefined", target))),
            _ => Ok(()),
        }
    }

    fn wait_on(
        &self,
        target: &Target,
        deadline: Option<Instant>,
        selector: &mut dyn Selector,
    ) -> Result<Envelope> {
        let id = target.id;
        let result = target.wait(deadline, selector, &|q: &TargetQueue| self.gate(&id, q));
        // Whatever this waiter left behind may belong to the observer.
        if target.has_pending_for_observer() {
            self.registry.kick(id);
        }
        result
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| Error::disconnected("no transport"))
    }

    pub(crate) fn drain_to_observer(&self, id: &TargetId) {
        let Some(target) = self.registry.get(id) else {
            return;
        };
        while let Some((observer, envelope)) = target.take_for_observer() {
            observer.on_message(&envelope);
        }
    }

    pub(crate) fn notify_client_observers(&self, client: ClientId, state: ClientState) {
        let observers: Vec<Arc<dyn ClientObserver>> = self
            .client_observers
            .read()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer.on_client_state(client, state);
        }
    }

    fn mark_disconnected(&self) {
        let prev = self.set_link(LinkState::Disconnected);
        self.registry.wake_all();
        if prev != LinkState::Disconnected {
            tracing::info!(
                "bus: client {} disconnected (was {:?})",
                self.client_id.load(Ordering::Relaxed),
                prev
            );
            let _ = self
                .jobs
                .send(DeliveryJob::ClientState(ClientId::ANY, ClientState::Down));
        }
    }

    fn on_control(&self, sender: ClientId, payload: Bytes) {
        if sender != ClientId::BROKER {
            tracing::warn!("bus: control frame from {} instead of broker; dropped", sender);
            return;
        }
        match ControlMessage::decode(payload.clone()) {
            Ok(ControlMessage::ClientState { client, state }) => {
                tracing::debug!("bus: {} is {:?}", client, state);
                self.registry.fan_out(&TargetId::CONTROL, |target| {
                    Envelope::client_state(client, target, state)
                });
                let _ = self.jobs.send(DeliveryJob::ClientState(client, state));
            }
            Ok(msg) if msg.is_reply() => {
                let awaited = msg.request().is_some_and(|r| self.awaiting.lock().contains(&r));
                if awaited {
                    self.registry
                        .enqueue(Envelope::data(sender, TargetId::CONTROL, payload));
                } else {
                    tracing::debug!("bus: late control reply {:?}; dropped", msg);
                }
            }
            Ok(other) => {
                tracing::warn!("bus: unexpected control message {:?}; dropped", other);
            }
            Err(e) => {
                tracing::warn!("bus: malformed control frame: {}", e);
            }
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.get_mut().take() {
            transport.close();
        }
    }
}

/// Handed to the transport; holds the bus weakly so the two do not keep
/// each other alive.
struct HandlerLink {
    inner: Weak<BusInner>,
}

impl TransportHandler for HandlerLink {
    fn on_message(&self, sender: ClientId, target: TargetId, payload: Bytes) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if payload.len() > inner.config.max_message_bytes {
            tracing::warn!(
                "bus: dropping {} byte message from {} on {} (limit {})",
                payload.len(),
                sender,
                target,
                inner.config.max_message_bytes
            );
            return;
        }
        if target == TargetId::CONTROL {
            inner.on_control(sender, payload);
        } else {
            inner.registry.enqueue(Envelope::data(sender, target, payload));
        }
    }

    fn on_disconnect(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.mark_disconnected();
        }
    }
}

/// Re-enables a target's observer when dropped.
#[derive(Debug)]
pub struct ObserverGuard {
    inner: Arc<BusInner>,
    target: TargetId,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Err(e) = self.inner.registry.set_observer_enabled(&self.target, true) {
            tracing::debug!("bus: re-enabling observer on {}: {}", self.target, e);
        }
    }
}

/// A process's handle on the message bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BusClient {
    inner: Arc<BusInner>,
}

impl BusClient {
    /// Connect through `connector`, which receives the callback sink the
    /// transport must drive, then run the HELLO handshake.
    pub fn connect<F>(config: BusConfig, connector: F) -> Result<Self>
    where
        F: FnOnce(Arc<dyn TransportHandler>) -> Result<Arc<dyn Transport>>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner {
            config,
            registry: TargetRegistry::new(tx.clone()),
            link: AtomicU8::new(LinkState::Connecting as u8),
            client_id: AtomicU32::new(0),
            requests: RequestCounter::new(),
            awaiting: Mutex::new(HashSet::new()),
            transport: RwLock::new(None),
            client_observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            jobs: tx,
            delivery: Mutex::new(None),
        });
        let handle = delivery::spawn(
            "objbroker-delivery".to_string(),
            Arc::downgrade(&inner),
            rx,
        )?;
        *inner.delivery.lock() = Some(handle);
        inner.registry.define(TargetId::CONTROL, None)?;

        let link: Arc<dyn TransportHandler> = Arc::new(HandlerLink {
            inner: Arc::downgrade(&inner),
        });
        let transport = match connector(link) {
            Ok(t) => t,
            Err(e) => {
                inner.set_link(LinkState::Disconnected);
                return Err(e);
            }
        };
        *inner.transport.write() = Some(transport);

        let client = BusClient { inner };
        match client.control_request(|request| ControlMessage::Hello { request }) {
            Ok(ControlMessage::ClientId { client: id, .. }) => {
                client.inner.client_id.store(id.get(), Ordering::Release);
                client.inner.set_link(LinkState::Connected);
                tracing::info!("bus: connected as {}", id);
                Ok(client)
            }
            Ok(other) => {
                client.abort();
                Err(Error::protocol(format!("unexpected HELLO reply {:?}", other)))
            }
            Err(e) => {
                client.abort();
                Err(e)
            }
        }
    }

    /// Connect to an in-process broker.
    pub fn connect_local(broker: &LocalBroker, config: BusConfig) -> Result<Self> {
        Self::connect(config, |handler| {
            let transport: Arc<dyn Transport> = broker.connect(handler)?;
            Ok(transport)
        })
    }

    /// Connect to a broker daemon over TCP.
    pub fn connect_tcp(addr: &str, config: BusConfig, max_frame_bytes: u32) -> Result<Self> {
        Self::connect(config, |handler| {
            let transport: Arc<dyn Transport> =
                crate::ipc::TcpTransport::connect(addr, handler, max_frame_bytes)?;
            Ok(transport)
        })
    }

    pub fn client_id(&self) -> ClientId {
        ClientId::new(self.inner.client_id.load(Ordering::Acquire))
    }

    pub fn state(&self) -> LinkState {
        self.inner.link()
    }

    fn require_link(&self, allow_shutting_down: bool) -> Result<()> {
        match self.inner.link() {
            LinkState::Connected => Ok(()),
            LinkState::ShuttingDown if allow_shutting_down => Ok(()),
            other => Err(Error::disconnected(format!("bus is {:?}", other))),
        }
    }

    /// Send a control request and wait for the broker's correlated reply.
    fn control_request(
        &self,
        build: impl FnOnce(RequestIndex) -> ControlMessage,
    ) -> Result<ControlMessage> {
        let request = self.inner.requests.next();
        let msg = build(request);
        let target = self
            .inner
            .registry
            .get(&TargetId::CONTROL)
            .ok_or_else(|| Error::internal("control target missing"))?;

        self.inner.awaiting.lock().insert(request);
        let result = self.exchange_control(&target, request, msg);
        self.inner.awaiting.lock().remove(&request);
        let envelope = result?;

        let payload = envelope
            .payload()
            .cloned()
            .ok_or_else(|| Error::internal("control reply without payload"))?;
        let reply = ControlMessage::decode(payload)?;
        if let ControlMessage::Ack { status: code, .. } = reply {
            if status::failed(code) {
                return Err(Error::from_status(code, format!("broker rejected {}", request)));
            }
        }
        Ok(reply)
    }

    fn exchange_control(
        &self,
        target: &Target,
        request: RequestIndex,
        msg: ControlMessage,
    ) -> Result<Envelope> {
        self.inner.transport()?.send(TargetId::CONTROL, msg.encode())?;

        let awaiting = &self.inner.awaiting;
        let mut selector = |env: Option<&Envelope>| match env.and_then(Envelope::payload) {
            Some(payload) => match ControlMessage::decode(payload.clone()) {
                Ok(reply) if reply.is_reply() && reply.request() == Some(request) => Admit::Accept,
                // A reply nobody waits for any more would sit on the queue forever.
                Ok(reply) if reply.request().is_some_and(|r| !awaiting.lock().contains(&r)) => {
                    Admit::Discard
                }
                Ok(_) => Admit::Continue,
                Err(_) => Admit::Discard,
            },
            None => Admit::Discard,
        };
        let deadline = Instant::now() + self.inner.config.control_timeout;
        self.inner
            .wait_on(target, Some(deadline), &mut selector)
            .map_err(|e| match e {
                Error::Timeout(_) => Error::timeout(format!("broker did not answer {}", request)),
                other => other,
            })
    }

    /// Register a target and tell the broker this process is interested in it.
    pub fn define_target(
        &self,
        id: TargetId,
        observer: Option<Arc<dyn MessageObserver>>,
    ) -> Result<()> {
        if id == TargetId::CONTROL {
            return Err(Error::already_reserved("the control target is reserved"));
        }
        self.require_link(false)?;
        self.inner.registry.define(id, observer)?;
        if let Err(e) = self.control_request(|request| ControlMessage::AddTarget { request, target: id }) {
            self.inner.registry.undefine(&id);
            return Err(e);
        }
        tracing::debug!("bus: defined target {}", id);
        Ok(())
    }

    /// Remove a target. Threads still waiting on it fail with `NotFound`.
    pub fn undefine_target(&self, id: TargetId) -> Result<()> {
        if id == TargetId::CONTROL {
            return Err(Error::already_reserved("the control target is reserved"));
        }
        self.inner
            .registry
            .undefine(&id)
            .ok_or_else(|| Error::not_found(format!("target {}", id)))?;
        if self.require_link(true).is_ok() {
            self.control_request(|request| ControlMessage::DelTarget { request, target: id })?;
        }
        tracing::debug!("bus: undefined target {}", id);
        Ok(())
    }

    pub fn set_observer_enabled(&self, id: TargetId, enabled: bool) -> Result<()> {
        self.inner.registry.set_observer_enabled(&id, enabled)
    }

    /// Disable a target's observer until the guard drops.
    pub fn disable_observer(&self, id: TargetId) -> Result<ObserverGuard> {
        self.inner.registry.set_observer_enabled(&id, false)?;
        Ok(ObserverGuard {
            inner: self.inner.clone(),
            target: id,
        })
    }

    /// Deliver `payload` on `target` to one live peer.
    pub fn send(&self, peer: ClientId, target: TargetId, payload: Bytes) -> Result<()> {
        if peer.is_any() {
            return Err(Error::validation("send needs a concrete peer; use broadcast"));
        }
        self.forward(peer, target, payload)
    }

    /// Deliver `payload` to every other client that defined `target`.
    pub fn broadcast(&self, target: TargetId, payload: Bytes) -> Result<()> {
        self.forward(ClientId::ANY, target, payload)
    }

    fn forward(&self, dest: ClientId, target: TargetId, payload: Bytes) -> Result<()> {
        if payload.len() > self.inner.config.max_message_bytes {
            return Err(Error::validation(format!(
                "message of {} bytes exceeds limit {}",
                payload.len(),
                self.inner.config.max_message_bytes
            )));
        }
        self.require_link(true)?;
        self.control_request(|request| ControlMessage::Forward {
            request,
            dest,
            target,
            payload,
        })
        .map(|_| ())
    }

    /// Block until `selector` accepts an envelope on `target`.
    pub fn wait_message(
        &self,
        target: TargetId,
        timeout: Option<Duration>,
        selector: &mut dyn Selector,
    ) -> Result<Envelope> {
        let record = self
            .inner
            .registry
            .get(&target)
            .ok_or_else(|| Error::not_found(format!("target {}", target)))?;
        let deadline = timeout.map(|d| Instant::now() + d);
        self.inner.wait_on(&record, deadline, selector)
    }

    /// Number of envelopes queued on `target`.
    pub fn pending(&self, target: TargetId) -> usize {
        self.inner.registry.get(&target).map(|t| t.len()).unwrap_or(0)
    }

    /// Round trip to the broker.
    pub fn ping(&self) -> Result<()> {
        self.control_request(|request| ControlMessage::Ping { request })
            .map(|_| ())
    }

    /// Register for client up/down notices. Returns a token for removal.
    pub fn add_client_observer(&self, observer: Arc<dyn ClientObserver>) -> u64 {
        let token = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.client_observers.write().push((token, observer));
        token
    }

    pub fn remove_client_observer(&self, token: u64) {
        self.inner
            .client_observers
            .write()
            .retain(|(t, _)| *t != token);
    }

    /// Enter `ShuttingDown`: waits on every target but the control target
    /// fail at once, while `send` and `broadcast` keep working so last
    /// messages can still go out. Finish with [`BusClient::close`].
    pub fn begin_shutdown(&self) {
        let prev = self.inner.set_link(LinkState::ShuttingDown);
        if prev == LinkState::Disconnected {
            self.inner.set_link(LinkState::Disconnected);
            return;
        }
        tracing::info!("bus: {} shutting down", self.client_id());
        self.inner.registry.wake_all();
    }

    /// Tear down the transport after [`BusClient::begin_shutdown`].
    pub fn close(&self) {
        if self.inner.link() == LinkState::Connected {
            tracing::debug!("bus: {} closed without a shutdown phase", self.client_id());
        }
        self.abort();
    }

    /// Graceful shutdown with nothing left to send: `begin_shutdown`
    /// followed directly by `close`.
    pub fn shutdown(&self) {
        self.begin_shutdown();
        self.close();
    }

    /// Drop the connection without the shutdown phase, as a crash would.
    pub fn abort(&self) {
        let transport = self.inner.transport.read().clone();
        if let Some(transport) = transport {
            transport.close();
        }
        self.inner.mark_disconnected();
    }

    /// Wait for the delivery thread to exit. Only meaningful after shutdown
    /// and once every other clone of this client has been dropped.
    pub fn join(self) {
        let handle = self.inner.delivery.lock().take();
        drop(self);
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("bus delivery thread panicked");
            }
        }
    }
}
