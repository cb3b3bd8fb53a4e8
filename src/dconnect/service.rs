//! The object-proxy service: one per process, bound to one bus client.
//!
//! Outbound calls send a request on [`DCONNECT_TARGET`] and block on the bus
//! wait engine for the matching reply. While a call is in flight the
//! target's observer is disabled, so the waiting threads themselves pick up
//! inbound requests and hand them to the worker pool; a caller blocked on
//! peer B can therefore still serve a nested call from B.
//!
//! With no call in flight, inbound traffic reaches the observer on the bus
//! delivery thread, which only queues requests to the pool.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::arena::InstanceHandle;
use super::exception::{
    clear_current_exception, read_exception, set_current_exception, take_current_exception, write_exception,
};
use super::instance::{InstanceTable, InstanceWrapper};
use super::interface::{InterfaceRepository, MethodInfo};
use super::marshal::{read_params, write_params, Limits, ObjectCodec, Side};
use super::object::ObjectRef;
use super::registry::ComponentRegistry;
use super::selector::{Accepted, ClientDownCache, ReplySelector};
use super::stub::{StubHost, StubRef, StubTable};
use super::value::Value;
use super::wire::{opcode, Header, Message, SetupSelector, REPLY_EXCEPTION};
use super::worker::WorkerPool;
use crate::buf::Reader;
use crate::bus::{BusClient, ClientObserver, ClientState, Envelope, MessageObserver};
use crate::types::{
    status, ClassId, ClientId, DConnectConfig, Error, InterfaceId, RequestCounter, RequestIndex, Result, TargetId,
};

/// Bus target carrying object-proxy traffic.
pub const DCONNECT_TARGET: TargetId = TargetId::from_u128(0x43ca_47ef_ebc8_47a2_9679_a470_3218_089f);

/// Point-in-time counters for one service.
#[derive(Debug, Clone, Serialize)]
pub struct DConnectStats {
    pub client_id: ClientId,
    pub wrappers: usize,
    pub stubs: usize,
    pub workers: usize,
    pub idle_workers: usize,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub down_clients: usize,
}

struct Shared {
    me: Weak<Shared>,
    bus: BusClient,
    interfaces: Arc<dyn InterfaceRepository>,
    components: Arc<ComponentRegistry>,
    config: DConnectConfig,
    instances: InstanceTable,
    stubs: StubTable,
    pool: WorkerPool,
    down: ClientDownCache,
    requests: RequestCounter,
    failed: AtomicU64,
    disconnected: AtomicBool,
    liveness_token: AtomicU64,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DConnect")
            .field("client_id", &self.bus.client_id())
            .field("wrappers", &self.instances.len())
            .field("stubs", &self.stubs.len())
            .field("disconnected", &self.disconnected.load(Ordering::Relaxed))
            .finish()
    }
}

/// Marshals object references for traffic with one peer and remembers
/// every wrapper it handed out, so a failed send can take them back.
struct PeerCodec<'a> {
    shared: &'a Shared,
    peer: ClientId,
    handed: Vec<Arc<InstanceWrapper>>,
}

impl<'a> PeerCodec<'a> {
    fn new(shared: &'a Shared, peer: ClientId) -> Self {
        Self {
            shared,
            peer,
            handed: Vec::new(),
        }
    }

    fn rollback(&mut self) {
        let handed = std::mem::take(&mut self.handed);
        if !handed.is_empty() {
            tracing::debug!("dconnect: rolling back {} handles for {}", handed.len(), self.peer);
            self.shared.instances.release_wrappers(&handed, self.peer);
        }
    }
}

impl ObjectCodec for PeerCodec<'_> {
    fn encode_object(&mut self, object: Option<&ObjectRef>, iid: &InterfaceId) -> Result<u64> {
        let Some(object) = object else {
            return Ok(0);
        };
        // The peer's own object goes back as its bare handle.
        if let Some(stub) = object.as_stub() {
            if stub.peer() == self.peer {
                return Ok(stub.handle().raw());
            }
        }
        let wrapper = self.shared.instances.acquire(self.peer, object.clone(), *iid)?;
        let raw = wrapper.handle().raw() | InstanceHandle::REMOTE_BIT;
        self.handed.push(wrapper);
        Ok(raw)
    }

    fn decode_object(&mut self, raw: u64, iid: &InterfaceId) -> Result<Option<ObjectRef>> {
        if raw == 0 {
            return Ok(None);
        }
        if raw & InstanceHandle::REMOTE_BIT != 0 {
            let handle = InstanceHandle::from_raw(raw & !InstanceHandle::REMOTE_BIT);
            let stub = self
                .shared
                .stubs
                .acquire_ipc(self.shared.host(), self.peer, handle, *iid);
            return Ok(Some(ObjectRef::Remote(stub)));
        }
        // One of our own wrappers coming back: hand out the real object.
        let handle = InstanceHandle::from_raw(raw);
        let wrapper = self
            .shared
            .instances
            .check_and_add_ref(self.peer, handle)
            .ok_or_else(|| Error::not_found(format!("{} returned unknown handle {}", self.peer, handle)))?;
        let object = wrapper.object();
        wrapper.release();
        object
            .map(Some)
            .ok_or_else(|| Error::not_found(format!("instance {} is gone", handle)))
    }
}

fn reply_payload(envelope: &Envelope) -> Result<Bytes> {
    envelope
        .payload()
        .cloned()
        .ok_or_else(|| Error::internal("reply envelope without payload"))
}

fn failure_message(what: &str, peer: ClientId) -> String {
    match super::exception::current_exception() {
        Some(exception) if !exception.info.message.is_empty() => exception.info.message,
        _ => format!("{} on {} failed", what, peer),
    }
}

impl Shared {
    fn host(&self) -> Weak<dyn StubHost> {
        self.me.clone()
    }

    fn limits(&self) -> Limits {
        Limits {
            max_array_elements: self.config.max_array_elements,
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::Acquire) {
            Err(Error::disconnected("object proxy service is shut down"))
        } else {
            Ok(())
        }
    }

    // ---- outbound ------------------------------------------------------

    /// Send a request and wait for its reply, serving inbound requests
    /// picked up along the way. `handed` is rolled back if the request never
    /// leaves this process.
    fn call(
        &self,
        peer: ClientId,
        payload: Bytes,
        request: RequestIndex,
        expect: u8,
        handed: Vec<Arc<InstanceWrapper>>,
    ) -> Result<Envelope> {
        let undo = |err: Error| {
            if !handed.is_empty() {
                self.instances.release_wrappers(&handed, peer);
            }
            err
        };
        if let Err(e) = self.check_connected() {
            return Err(undo(e));
        }
        if self.down.contains(peer) {
            return Err(undo(Error::peer_gone(format!("{} is down", peer))));
        }
        if payload.len() > self.config.max_message_bytes {
            return Err(undo(Error::validation(format!(
                "request of {} bytes exceeds limit {}",
                payload.len(),
                self.config.max_message_bytes
            ))));
        }

        let _observer_off = self.bus.disable_observer(DCONNECT_TARGET).map_err(&undo)?;
        if let Err(e) = self.bus.send(peer, DCONNECT_TARGET, payload) {
            let e = match e {
                Error::NotFound(_) => Error::peer_gone(format!("{} is not connected", peer)),
                other => other,
            };
            return Err(undo(e));
        }

        let deadline = Instant::now() + self.config.call_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(format!("no reply from {} for {}", peer, request)));
            }
            let mut selector = ReplySelector::new(peer, expect, request, &self.down);
            let envelope = self
                .bus
                .wait_message(DCONNECT_TARGET, Some(remaining), &mut selector)
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::timeout(format!("no reply from {} for {}", peer, request)),
                    Error::PeerGone(_) if self.down.contains(peer) => {
                        Error::peer_gone(format!("{} went down during {}", peer, request))
                    }
                    other => other,
                })?;
            match selector.classify(&envelope) {
                Accepted::Reply => return Ok(envelope),
                Accepted::Request => self.dispatch(envelope.sender, reply_payload(&envelope)?),
                Accepted::PeerDown => {
                    return Err(Error::peer_gone(format!("{} went down during {}", peer, request)));
                }
                Accepted::Other => {
                    tracing::debug!("dconnect: waiter for {} skipped a message from {}", request, envelope.sender);
                }
            }
        }
    }

    fn setup(&self, peer: ClientId, iid: InterfaceId, selector: SetupSelector) -> Result<ObjectRef> {
        clear_current_exception();
        if peer.is_any() {
            return Err(Error::validation("SETUP needs a concrete peer"));
        }
        let request = self.requests.next();
        let payload = Message::Setup {
            request,
            iid,
            selector,
        }
        .encode();
        let envelope = self.call(peer, payload, request, opcode::SETUP_REPLY, Vec::new())?;
        let Message::SetupReply {
            flags,
            handle,
            status: code,
            tail,
            ..
        } = Message::decode(reply_payload(&envelope)?)?
        else {
            return Err(Error::protocol("SETUP answered with another opcode"));
        };

        if flags & REPLY_EXCEPTION != 0 {
            let mut codec = PeerCodec::new(self, peer);
            let mut r = Reader::new(tail);
            set_current_exception(read_exception(&mut r, &mut codec)?);
        }
        if status::failed(code) {
            return Err(Error::from_status(code, failure_message("SETUP", peer)));
        }
        if handle.is_null() {
            return Err(Error::protocol("SETUP succeeded without an instance handle"));
        }
        let stub = self.stubs.acquire_ipc(self.host(), peer, handle, iid);
        Ok(ObjectRef::Remote(stub))
    }

    fn invoke_remote(&self, stub: &StubRef, method: u16, params: &mut [Value]) -> Result<()> {
        clear_current_exception();
        let info = self
            .interfaces
            .interface(&stub.iid())
            .ok_or_else(|| Error::no_interface(format!("no descriptor for {}", stub.iid())))?;
        let method_info = info.method_at(method)?;
        let peer = stub.peer();
        let request = self.requests.next();

        let mut codec = PeerCodec::new(self, peer);
        let mut body = BytesMut::new();
        if let Err(e) = write_params(&mut body, method_info, params, Side::Request, &mut codec, self.limits()) {
            codec.rollback();
            return Err(e);
        }
        let payload = Message::Invoke {
            request,
            handle: stub.handle(),
            method,
            params: body.freeze(),
        }
        .encode();
        let handed = std::mem::take(&mut codec.handed);
        let envelope = self.call(peer, payload, request, opcode::INVOKE_REPLY, handed)?;

        let Message::InvokeReply {
            flags,
            status: code,
            tail,
            ..
        } = Message::decode(reply_payload(&envelope)?)?
        else {
            return Err(Error::protocol("INVOKE answered with another opcode"));
        };
        let mut r = Reader::new(tail);
        if !status::failed(code) {
            read_params(&mut r, method_info, params, Side::Reply, &mut codec, self.limits())?;
        }
        if flags & REPLY_EXCEPTION != 0 {
            set_current_exception(read_exception(&mut r, &mut codec)?);
        }
        if status::failed(code) {
            return Err(Error::from_status(
                code,
                failure_message(&format!("{}::{}", info.name, method_info.name), peer),
            ));
        }
        Ok(())
    }

    // ---- inbound -------------------------------------------------------

    fn on_envelope(&self, envelope: &Envelope) {
        match envelope.client_state_change() {
            Some(ClientState::Down) => {
                if !envelope.sender.is_any() {
                    self.down.record(envelope.sender);
                }
                return;
            }
            Some(ClientState::Up) => {
                self.down.clear(envelope.sender);
                return;
            }
            None => {}
        }
        let Some(payload) = envelope.payload() else {
            return;
        };
        match Header::peek(payload) {
            Some(header) if header.is_request() => self.dispatch(envelope.sender, payload.clone()),
            Some(header) if header.is_reply() => {
                tracing::debug!(
                    "dconnect: dropping orphaned reply {} from {}",
                    header.request,
                    envelope.sender
                );
            }
            _ => {
                tracing::warn!(
                    "dconnect: dropping malformed message of {} bytes from {}",
                    payload.len(),
                    envelope.sender
                );
            }
        }
    }

    fn dispatch(&self, peer: ClientId, payload: Bytes) {
        let me = self.me.clone();
        let queued = self.pool.submit(move || {
            if let Some(shared) = me.upgrade() {
                shared.handle_request(peer, payload);
            }
        });
        if let Err(e) = queued {
            tracing::debug!("dconnect: dropping request from {}: {}", peer, e);
        }
    }

    fn handle_request(&self, peer: ClientId, payload: Bytes) {
        clear_current_exception();
        let header = Header::peek(&payload);
        let decoded = if payload.len() > self.config.max_message_bytes {
            Err(Error::protocol(format!("request of {} bytes", payload.len())))
        } else {
            Message::decode(payload)
        };
        match decoded {
            Ok(Message::Setup {
                request,
                iid,
                selector,
            }) => self.on_setup(peer, request, iid, &selector),
            Ok(Message::Release { handle }) => self.instances.release_ipc(peer, handle),
            Ok(Message::Invoke {
                request,
                handle,
                method,
                params,
            }) => self.on_invoke(peer, request, handle, method, params),
            Ok(other) => {
                tracing::debug!("dconnect: reply {:?} reached a worker; dropped", other.header());
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("dconnect: bad request from {}: {}", peer, e);
                match header {
                    Some(h) if h.major == opcode::SETUP => {
                        self.send_reply(peer, Message::SetupReply {
                            request: h.request,
                            flags: 0,
                            handle: InstanceHandle::NULL,
                            status: e.status(),
                            tail: Bytes::new(),
                        }, Vec::new());
                    }
                    Some(h) if h.major == opcode::INVOKE => {
                        self.send_reply(peer, Message::InvokeReply {
                            request: h.request,
                            flags: 0,
                            status: e.status(),
                            tail: Bytes::new(),
                        }, Vec::new());
                    }
                    _ => {}
                }
            }
        }
        clear_current_exception();
    }

    fn send_reply(&self, peer: ClientId, reply: Message, handed: Vec<Arc<InstanceWrapper>>) {
        if let Err(e) = self.bus.send(peer, DCONNECT_TARGET, reply.encode()) {
            tracing::debug!("dconnect: reply {} to {} not sent: {}", reply.header().request, peer, e);
            if !handed.is_empty() {
                self.instances.release_wrappers(&handed, peer);
            }
        }
    }

    /// Append the thread's current exception, if any, to a failing reply.
    fn attach_exception(&self, codec: &mut PeerCodec<'_>, tail: &mut BytesMut) -> u16 {
        let Some(exception) = take_current_exception() else {
            return 0;
        };
        let mark = tail.len();
        match write_exception(tail, &exception, codec) {
            Ok(()) => REPLY_EXCEPTION,
            Err(e) => {
                tracing::warn!("dconnect: could not marshal exception for {}: {}", codec.peer, e);
                tail.truncate(mark);
                0
            }
        }
    }

    fn resolve_setup(&self, peer: ClientId, iid: &InterfaceId, selector: &SetupSelector) -> Result<ObjectRef> {
        if self.interfaces.interface(iid).is_none() {
            return Err(Error::no_interface(format!("no descriptor for {}", iid)));
        }
        match selector {
            SetupSelector::NewInstanceByClass(cid) => self.components.create_instance(cid, iid),
            SetupSelector::NewInstanceByContract(name) => self.components.create_instance_by_contract(name, iid),
            SetupSelector::ServiceByClass(cid) => self.components.get_service(cid, iid),
            SetupSelector::ServiceByContract(name) => self.components.get_service_by_contract(name, iid),
            SetupSelector::QueryInterface(handle) => {
                let wrapper = self
                    .instances
                    .check_and_add_ref(peer, *handle)
                    .ok_or_else(|| Error::not_found(format!("instance {} of {}", handle, peer)))?;
                let result = wrapper
                    .object()
                    .ok_or_else(|| Error::not_found(format!("instance {} is gone", handle)))
                    .and_then(|object| object.query_interface(iid));
                wrapper.release();
                result
            }
        }
    }

    fn on_setup(&self, peer: ClientId, request: RequestIndex, iid: InterfaceId, selector: &SetupSelector) {
        let mut codec = PeerCodec::new(self, peer);
        let (code, handle) = match self
            .resolve_setup(peer, &iid, selector)
            .and_then(|object| self.instances.acquire(peer, object, iid))
        {
            Ok(wrapper) => {
                let handle = wrapper.handle();
                codec.handed.push(wrapper);
                (status::OK, handle)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dconnect: SETUP {} from {} failed: {}", request, peer, e);
                (e.status(), InstanceHandle::NULL)
            }
        };
        let mut tail = BytesMut::new();
        let flags = if status::failed(code) {
            self.attach_exception(&mut codec, &mut tail)
        } else {
            0
        };
        let handed = std::mem::take(&mut codec.handed);
        self.send_reply(
            peer,
            Message::SetupReply {
                request,
                flags,
                handle,
                status: code,
                tail: tail.freeze(),
            },
            handed,
        );
    }

    fn on_invoke(&self, peer: ClientId, request: RequestIndex, handle: InstanceHandle, method: u16, params: Bytes) {
        let mut codec = PeerCodec::new(self, peer);
        let mut tail = BytesMut::new();
        let code = match self.run_invoke(peer, handle, method, params, &mut codec, &mut tail) {
            Ok(()) => status::OK,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dconnect: INVOKE {} from {} failed: {}", request, peer, e);
                codec.rollback();
                tail.clear();
                e.status()
            }
        };
        let flags = if status::failed(code) {
            self.attach_exception(&mut codec, &mut tail)
        } else {
            0
        };
        let handed = std::mem::take(&mut codec.handed);
        self.send_reply(
            peer,
            Message::InvokeReply {
                request,
                flags,
                status: code,
                tail: tail.freeze(),
            },
            handed,
        );
    }

    fn run_invoke(
        &self,
        peer: ClientId,
        handle: InstanceHandle,
        method: u16,
        params: Bytes,
        codec: &mut PeerCodec<'_>,
        out: &mut BytesMut,
    ) -> Result<()> {
        let wrapper = self
            .instances
            .check_and_add_ref(peer, handle)
            .ok_or_else(|| Error::not_found(format!("instance {} of {}", handle, peer)))?;
        let result = self.invoke_wrapper(&wrapper, method, params, codec, out);
        wrapper.release();
        result
    }

    fn invoke_wrapper(
        &self,
        wrapper: &InstanceWrapper,
        method: u16,
        params: Bytes,
        codec: &mut PeerCodec<'_>,
        out: &mut BytesMut,
    ) -> Result<()> {
        let object = wrapper
            .object()
            .ok_or_else(|| Error::not_found(format!("instance {} is gone", wrapper.handle())))?;
        let iid = wrapper.iid();
        let info = self
            .interfaces
            .interface(&iid)
            .ok_or_else(|| Error::no_interface(format!("no descriptor for {}", iid)))?;
        let method_info: &MethodInfo = info.method_at(method)?;
        let mut values: Vec<Value> = method_info.params.iter().map(|p| Value::default_for(&p.ty)).collect();

        let mut r = Reader::new(params);
        read_params(&mut r, method_info, &mut values, Side::Request, codec, self.limits())?;
        r.expect_end("INVOKE params")?;

        object.invoke(&iid, method, &mut values)?;
        write_params(out, method_info, &values, Side::Reply, codec, self.limits())
    }

    // ---- lifecycle -----------------------------------------------------

    fn on_peer_down(&self, peer: ClientId) {
        self.down.record(peer);
        let pruned = self.instances.prune_peer(peer);
        tracing::debug!("dconnect: {} down, {} wrappers swept", peer, pruned);
    }

    fn shutdown(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("dconnect: shutting down service for {}", self.bus.client_id());
        self.bus
            .remove_client_observer(self.liveness_token.load(Ordering::Acquire));
        if let Err(e) = self.bus.undefine_target(DCONNECT_TARGET) {
            tracing::debug!("dconnect: undefining target: {}", e);
        }
        self.pool.shutdown();
        let wrappers = self.instances.drain();
        let stubs = self.stubs.clear();
        tracing::info!("dconnect: released {} wrappers, forgot {} stubs", wrappers, stubs);
    }
}

impl StubHost for Shared {
    fn stubs(&self) -> &StubTable {
        &self.stubs
    }

    fn send_release(&self, peer: ClientId, handle: InstanceHandle) {
        if self.disconnected.load(Ordering::Acquire) || self.down.contains(peer) {
            return;
        }
        let payload = Message::Release { handle }.encode();
        if let Err(e) = self.bus.send(peer, DCONNECT_TARGET, payload) {
            tracing::debug!("dconnect: RELEASE of {} to {} not sent: {}", handle, peer, e);
        }
    }

    fn invoke(&self, stub: &StubRef, method: u16, params: &mut [Value]) -> Result<()> {
        self.invoke_remote(stub, method, params)
    }

    fn query_interface(&self, stub: &StubRef, iid: &InterfaceId) -> Result<ObjectRef> {
        self.setup(stub.peer(), *iid, SetupSelector::QueryInterface(stub.handle()))
    }
}

/// Observer on [`DCONNECT_TARGET`].
struct Inbox {
    shared: Weak<Shared>,
}

impl MessageObserver for Inbox {
    fn on_message(&self, envelope: &Envelope) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_envelope(envelope);
        }
    }
}

/// Client up/down notices from the bus.
struct Liveness {
    shared: Weak<Shared>,
}

impl ClientObserver for Liveness {
    fn on_client_state(&self, client: ClientId, state: ClientState) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match state {
            ClientState::Down if client.is_any() => shared.shutdown(),
            ClientState::Down => shared.on_peer_down(client),
            ClientState::Up => shared.down.clear(client),
        }
    }
}

/// Handle on the object-proxy service. Shuts the service down when dropped.
pub struct DConnect {
    shared: Arc<Shared>,
}

impl fmt::Debug for DConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.shared, f)
    }
}

impl DConnect {
    /// Start the service on `bus`: define [`DCONNECT_TARGET`], start the
    /// worker pool and watch for peers going down.
    pub fn start(
        bus: BusClient,
        interfaces: Arc<dyn InterfaceRepository>,
        components: Arc<ComponentRegistry>,
        config: DConnectConfig,
    ) -> Result<Self> {
        let pool = WorkerPool::new(format!("dconnect-{}", bus.client_id().get()), config.workers.clone())?;
        let down = ClientDownCache::new(config.client_down_retention, config.client_down_capacity);
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            bus,
            interfaces,
            components,
            config,
            instances: InstanceTable::new(),
            stubs: StubTable::new(),
            pool,
            down,
            requests: RequestCounter::new(),
            failed: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            liveness_token: AtomicU64::new(0),
        });

        let inbox: Arc<dyn MessageObserver> = Arc::new(Inbox {
            shared: Arc::downgrade(&shared),
        });
        if let Err(e) = shared.bus.define_target(DCONNECT_TARGET, Some(inbox)) {
            shared.disconnected.store(true, Ordering::Release);
            shared.pool.shutdown();
            return Err(e);
        }
        let token = shared.bus.add_client_observer(Arc::new(Liveness {
            shared: Arc::downgrade(&shared),
        }));
        shared.liveness_token.store(token, Ordering::Release);
        tracing::info!("dconnect: service started for {}", shared.bus.client_id());
        Ok(Self { shared })
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.bus.client_id()
    }

    pub fn bus(&self) -> &BusClient {
        &self.shared.bus
    }

    /// Create a new instance of class `cid` in `peer`.
    pub fn create_instance(&self, peer: ClientId, cid: ClassId, iid: InterfaceId) -> Result<ObjectRef> {
        self.shared.setup(peer, iid, SetupSelector::NewInstanceByClass(cid))
    }

    pub fn create_instance_by_contract_id(
        &self,
        peer: ClientId,
        contract: &str,
        iid: InterfaceId,
    ) -> Result<ObjectRef> {
        self.shared
            .setup(peer, iid, SetupSelector::NewInstanceByContract(contract.to_string()))
    }

    /// Look up service `cid` in `peer`, creating it there on first use.
    pub fn get_service(&self, peer: ClientId, cid: ClassId, iid: InterfaceId) -> Result<ObjectRef> {
        self.shared.setup(peer, iid, SetupSelector::ServiceByClass(cid))
    }

    pub fn get_service_by_contract_id(&self, peer: ClientId, contract: &str, iid: InterfaceId) -> Result<ObjectRef> {
        self.shared
            .setup(peer, iid, SetupSelector::ServiceByContract(contract.to_string()))
    }

    pub fn stats(&self) -> DConnectStats {
        let pool = self.shared.pool.stats();
        DConnectStats {
            client_id: self.client_id(),
            wrappers: self.shared.instances.len(),
            stubs: self.shared.stubs.len(),
            workers: pool.workers,
            idle_workers: pool.idle,
            requests_processed: pool.processed,
            requests_failed: self.shared.failed.load(Ordering::Relaxed),
            down_clients: self.shared.down.len(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Stop serving: undefine the target, stop the pool, release every
    /// exported wrapper and forget every stub. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for DConnect {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dconnect::interface::{InterfaceCatalog, InterfaceInfo, MethodInfo, ParamInfo, TypeTag};
    use crate::dconnect::object::Object;
    use crate::transport::LocalBroker;
    use crate::types::{BusConfig, WorkerPoolConfig};
    use std::time::Duration;

    const IECHO: InterfaceId = InterfaceId::from_u128(0xEC40);
    const ECHO_CID: ClassId = ClassId::from_u128(0xEC41);

    struct Echo;

    impl Object for Echo {
        fn implements(&self, iid: &InterfaceId) -> bool {
            *iid == IECHO
        }

        fn call(&self, _iid: &InterfaceId, method: u16, params: &mut [Value]) -> Result<()> {
            match method {
                0 => {
                    params[1] = params[0].clone();
                    Ok(())
                }
                _ => Err(Error::not_implemented("no such method")),
            }
        }
    }

    fn catalog() -> Arc<dyn InterfaceRepository> {
        let catalog = InterfaceCatalog::new();
        catalog
            .register(
                InterfaceInfo::new(IECHO, "IEcho").method(
                    MethodInfo::new("echo")
                        .param(ParamInfo::input("text", TypeTag::CString))
                        .param(ParamInfo::retval(TypeTag::CString)),
                ),
            )
            .unwrap();
        Arc::new(catalog)
    }

    fn config() -> DConnectConfig {
        DConnectConfig {
            call_timeout: Duration::from_secs(10),
            workers: WorkerPoolConfig {
                min_workers: 1,
                max_workers: 8,
                ..WorkerPoolConfig::default()
            },
            ..DConnectConfig::default()
        }
    }

    fn service(broker: &LocalBroker) -> DConnect {
        let bus = BusClient::connect_local(broker, BusConfig::default()).unwrap();
        let components = Arc::new(ComponentRegistry::new());
        components.register_factory(ECHO_CID, || Ok(ObjectRef::local(Echo)));
        DConnect::start(bus, catalog(), components, config()).unwrap()
    }

    #[test]
    fn test_create_and_invoke() {
        let broker = LocalBroker::new();
        let server = service(&broker);
        let client = service(&broker);
        let echo = client
            .create_instance(server.client_id(), ECHO_CID, IECHO)
            .unwrap();
        let mut params = vec![Value::str("ping"), Value::Str(None)];
        echo.invoke(&IECHO, 0, &mut params).unwrap();
        assert_eq!(params[1].as_str(), Some("ping"));
        assert_eq!(server.stats().wrappers, 1);
        assert_eq!(client.stats().stubs, 1);
    }

    #[test]
    fn test_unknown_class_is_not_found() {
        let broker = LocalBroker::new();
        let server = service(&broker);
        let client = service(&broker);
        let err = client
            .create_instance(server.client_id(), ClassId::from_u128(0xDEAD), IECHO)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{:?}", err);
        assert_eq!(server.stats().wrappers, 0);
    }

    #[test]
    fn test_unknown_interface_is_no_interface() {
        let broker = LocalBroker::new();
        let server = service(&broker);
        let client = service(&broker);
        let err = client
            .create_instance(server.client_id(), ECHO_CID, InterfaceId::from_u128(0xBAD))
            .unwrap_err();
        assert!(matches!(err, Error::NoInterface(_)), "{:?}", err);
    }

    #[test]
    fn test_call_to_unknown_peer_is_peer_gone() {
        let broker = LocalBroker::new();
        let client = service(&broker);
        let err = client
            .create_instance(ClientId::new(999), ECHO_CID, IECHO)
            .unwrap_err();
        assert!(err.is_peer_gone(), "{:?}", err);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_calls() {
        let broker = LocalBroker::new();
        let server = service(&broker);
        let client = service(&broker);
        client.shutdown();
        client.shutdown();
        assert!(client.is_shut_down());
        let err = client
            .create_instance(server.client_id(), ECHO_CID, IECHO)
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }
}
