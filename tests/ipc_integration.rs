//! TCP integration tests: raw frames against the broker daemon, then full
//! bus clients and object proxies over real sockets.

use bytes::Bytes;
use objbroker::broker::Broker;
use objbroker::bus::{AnyMessage, BusClient, ClientState, ControlMessage};
use objbroker::dconnect::{
    ComponentRegistry, DConnect, InterfaceCatalog, InterfaceInfo, InterfaceRepository, MethodInfo, Object,
    ObjectRef, ParamInfo, TypeTag, Value,
};
use objbroker::ipc::codec::{decode_envelope, encode_envelope, read_frame, write_frame, MSG_ENVELOPE};
use objbroker::ipc::BrokerServer;
use objbroker::types::{
    BrokerConfig, BusConfig, ClassId, ClientId, DConnectConfig, InterfaceId, RequestIndex, TargetId,
};
use objbroker::Result;
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const MAX_FRAME: u32 = 1 << 20;
const TOPIC: TargetId = TargetId::from_u128(0x1c00_0001);

fn test_config() -> BrokerConfig {
    BrokerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        max_frame_bytes: MAX_FRAME,
        ..BrokerConfig::default()
    }
}

/// Bind on a free port and serve in the background.
async fn start_server() -> (SocketAddr, Arc<BrokerServer>) {
    let server = Arc::new(
        BrokerServer::bind(Arc::new(Broker::new()), test_config())
            .await
            .unwrap(),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    (server.local_addr(), server)
}

async fn send_control(stream: &mut TcpStream, msg: ControlMessage) {
    let frame = encode_envelope(ClientId::ANY, TargetId::CONTROL, &msg.encode());
    write_frame(stream, &frame).await.unwrap();
}

async fn next_envelope(stream: &mut TcpStream) -> (ClientId, TargetId, Bytes) {
    let (msg_type, body) = tokio::time::timeout(Duration::from_secs(5), read_frame(stream, MAX_FRAME))
        .await
        .expect("frame within timeout")
        .unwrap()
        .expect("connection still open");
    assert_eq!(msg_type, MSG_ENVELOPE);
    decode_envelope(body).unwrap()
}

async fn next_control(stream: &mut TcpStream) -> ControlMessage {
    let (sender, target, payload) = next_envelope(stream).await;
    assert_eq!(sender, ClientId::BROKER);
    assert_eq!(target, TargetId::CONTROL);
    ControlMessage::decode(payload).unwrap()
}

async fn hello(stream: &mut TcpStream) -> ClientId {
    send_control(stream, ControlMessage::Hello { request: RequestIndex(1) }).await;
    match next_control(stream).await {
        ControlMessage::ClientId { request, client } => {
            assert_eq!(request, RequestIndex(1));
            client
        }
        other => panic!("expected ClientId, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hello_assigns_client_id() {
    let (addr, server) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let id = hello(&mut stream).await;
    assert!(!id.is_any());

    send_control(&mut stream, ControlMessage::Ping { request: RequestIndex(2) }).await;
    assert_eq!(
        next_control(&mut stream).await,
        ControlMessage::Ack {
            request: RequestIndex(2),
            status: 0
        }
    );
    assert_eq!(server.broker().stats().connected_clients, 1);
    server.shutdown();
}

#[tokio::test]
async fn test_forward_between_two_connections() {
    let (addr, server) = start_server().await;
    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    let a_id = hello(&mut a).await;
    let b_id = hello(&mut b).await;
    assert_ne!(a_id, b_id);

    // `a` hears about `b` coming up.
    assert_eq!(
        next_control(&mut a).await,
        ControlMessage::ClientState {
            client: b_id,
            state: ClientState::Up
        }
    );

    send_control(
        &mut a,
        ControlMessage::Forward {
            request: RequestIndex(2),
            dest: b_id,
            target: TOPIC,
            payload: Bytes::from_static(b"over tcp"),
        },
    )
    .await;
    assert_eq!(
        next_control(&mut a).await,
        ControlMessage::Ack {
            request: RequestIndex(2),
            status: 0
        }
    );

    let (sender, target, payload) = next_envelope(&mut b).await;
    assert_eq!(sender, a_id);
    assert_eq!(target, TOPIC);
    assert_eq!(payload.as_ref(), b"over tcp");

    // Closing `b` is announced to `a`.
    drop(b);
    assert_eq!(
        next_control(&mut a).await,
        ControlMessage::ClientState {
            client: b_id,
            state: ClientState::Down
        }
    );
    server.shutdown();
}

#[tokio::test]
async fn test_frame_on_data_target_is_dropped_and_connection_survives() {
    let (addr, server) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    hello(&mut stream).await;

    let stray = encode_envelope(ClientId::ANY, TOPIC, b"not for the broker");
    write_frame(&mut stream, &stray).await.unwrap();

    send_control(&mut stream, ControlMessage::Ping { request: RequestIndex(3) }).await;
    assert_eq!(
        next_control(&mut stream).await,
        ControlMessage::Ack {
            request: RequestIndex(3),
            status: 0
        }
    );
    server.shutdown();
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (addr, server) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    hello(&mut stream).await;

    stream.write_all(&(MAX_FRAME + 1).to_be_bytes()).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream, MAX_FRAME))
        .await
        .expect("server reacts within timeout");
    assert!(matches!(closed, Ok(None) | Err(_)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.broker().stats().connected_clients != 0 {
        assert!(Instant::now() < deadline, "connection never detached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.shutdown();
}

// ---- blocking clients over TCP --------------------------------------------

/// A daemon on its own runtime, so blocking bus clients can run on the
/// test thread.
struct Daemon {
    addr: String,
    server: Arc<BrokerServer>,
    _runtime: tokio::runtime::Runtime,
}

impl Daemon {
    fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let server = Arc::new(
            runtime
                .block_on(BrokerServer::bind(Arc::new(Broker::new()), test_config()))
                .unwrap(),
        );
        let serving = server.clone();
        runtime.spawn(async move {
            let _ = serving.serve().await;
        });
        Self {
            addr: server.local_addr().to_string(),
            server,
            _runtime: runtime,
        }
    }

    fn connect(&self) -> BusClient {
        BusClient::connect_tcp(&self.addr, BusConfig::default(), MAX_FRAME).unwrap()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

#[test]
fn test_bus_clients_exchange_messages_over_tcp() {
    let daemon = Daemon::start();
    let a = daemon.connect();
    let b = daemon.connect();
    assert_ne!(a.client_id(), b.client_id());
    b.define_target(TOPIC, None).unwrap();

    a.send(b.client_id(), TOPIC, Bytes::from_static(b"hello")).unwrap();
    let env = b
        .wait_message(TOPIC, Some(Duration::from_secs(5)), &mut AnyMessage::default())
        .unwrap();
    assert_eq!(env.sender, a.client_id());
    assert_eq!(env.payload().unwrap().as_ref(), b"hello");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_abort_over_tcp_is_seen_as_peer_down() {
    let daemon = Daemon::start();
    let watcher = daemon.connect();
    watcher.define_target(TOPIC, None).unwrap();
    let victim = daemon.connect();
    let victim_id = victim.client_id();
    victim.abort();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "down notice never arrived");
        let Ok(env) = watcher.wait_message(TOPIC, Some(Duration::from_millis(100)), &mut AnyMessage::with_notices())
        else {
            continue;
        };
        if env.sender == victim_id && env.client_state_change() == Some(ClientState::Down) {
            break;
        }
    }
    watcher.shutdown();
}

const IECHO: InterfaceId = InterfaceId::from_u128(0x1c00_0002);
const ECHO_CID: ClassId = ClassId::from_u128(0x1c00_0003);

struct Echo;

impl Object for Echo {
    fn implements(&self, iid: &InterfaceId) -> bool {
        *iid == IECHO
    }

    fn call(&self, _iid: &InterfaceId, _method: u16, params: &mut [Value]) -> Result<()> {
        params[1] = params[0].clone();
        Ok(())
    }
}

fn catalog() -> Arc<dyn InterfaceRepository> {
    let catalog = InterfaceCatalog::new();
    catalog
        .register(
            InterfaceInfo::new(IECHO, "IEcho").method(
                MethodInfo::new("echo")
                    .param(ParamInfo::input("text", TypeTag::AString))
                    .param(ParamInfo::retval(TypeTag::AString)),
            ),
        )
        .unwrap();
    Arc::new(catalog)
}

#[test]
fn test_object_invocation_over_tcp() {
    let daemon = Daemon::start();
    let components = Arc::new(ComponentRegistry::new());
    components.register_factory(ECHO_CID, || Ok(ObjectRef::local(Echo)));
    let server = DConnect::start(daemon.connect(), catalog(), components, DConnectConfig::default()).unwrap();
    let client = DConnect::start(
        daemon.connect(),
        catalog(),
        Arc::new(ComponentRegistry::new()),
        DConnectConfig::default(),
    )
    .unwrap();

    let echo = client.create_instance(server.client_id(), ECHO_CID, IECHO).unwrap();
    let mut params = vec![Value::wstr("grüße über tcp"), Value::WStr(None)];
    echo.invoke(&IECHO, 0, &mut params).unwrap();
    assert_eq!(params[1].as_str(), Some("grüße über tcp"));

    drop(echo);
    client.shutdown();
    server.shutdown();
}
