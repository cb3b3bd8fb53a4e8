//! Message bus behavior across several clients of one in-process broker.

use bytes::Bytes;
use objbroker::bus::{Admit, AnyMessage, BusClient, ClientState, Envelope, LinkState};
use objbroker::transport::LocalBroker;
use objbroker::types::{BusConfig, ClientId, TargetId};
use objbroker::Error;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

const TOPIC: TargetId = TargetId::from_u128(0x7000_0001);

fn connect(broker: &LocalBroker) -> BusClient {
    BusClient::connect_local(broker, BusConfig::default()).unwrap()
}

fn wait_any(bus: &BusClient, target: TargetId) -> objbroker::Result<Envelope> {
    bus.wait_message(target, Some(Duration::from_secs(5)), &mut AnyMessage::default())
}

#[test]
fn test_messages_from_one_sender_arrive_in_order() {
    let broker = LocalBroker::new();
    let sender = connect(&broker);
    let receiver = connect(&broker);
    receiver.define_target(TOPIC, None).unwrap();

    for i in 0..50u8 {
        sender.send(receiver.client_id(), TOPIC, Bytes::from(vec![i])).unwrap();
    }
    let got: Vec<u8> = (0..50)
        .map(|_| wait_any(&receiver, TOPIC).unwrap().payload().unwrap()[0])
        .collect();
    assert_eq!(got, (0..50u8).collect::<Vec<_>>());
}

#[test]
fn test_selector_picks_by_sender_and_leaves_the_rest() {
    let broker = LocalBroker::new();
    let alice = connect(&broker);
    let bob = connect(&broker);
    let receiver = connect(&broker);
    receiver.define_target(TOPIC, None).unwrap();

    alice.send(receiver.client_id(), TOPIC, Bytes::from_static(b"from alice")).unwrap();
    bob.send(receiver.client_id(), TOPIC, Bytes::from_static(b"from bob")).unwrap();

    let bob_id = bob.client_id();
    let env = receiver
        .wait_message(
            TOPIC,
            Some(Duration::from_secs(5)),
            &mut |e: Option<&Envelope>| match e {
                Some(e) if e.sender == bob_id => Admit::Accept,
                _ => Admit::Continue,
            },
        )
        .unwrap();
    assert_eq!(env.payload().unwrap().as_ref(), b"from bob");

    let env = wait_any(&receiver, TOPIC).unwrap();
    assert_eq!(env.sender, alice.client_id());
    assert_eq!(receiver.pending(TOPIC), 0);
}

#[test]
fn test_each_message_goes_to_exactly_one_waiter() {
    let broker = LocalBroker::new();
    let sender = connect(&broker);
    let receiver = connect(&broker);
    receiver.define_target(TOPIC, None).unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let bus = receiver.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(env) = bus.wait_message(TOPIC, Some(Duration::from_millis(300)), &mut AnyMessage::default()) {
                    seen.push(env.payload().unwrap()[0]);
                }
                seen
            })
        })
        .collect();

    for i in 0..40u8 {
        sender.send(receiver.client_id(), TOPIC, Bytes::from(vec![i])).unwrap();
    }

    let mut all = Vec::new();
    for waiter in waiters {
        all.extend(waiter.join().unwrap());
    }
    let unique: HashSet<u8> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[test]
fn test_wait_times_out_when_nothing_arrives() {
    let broker = LocalBroker::new();
    let bus = connect(&broker);
    bus.define_target(TOPIC, None).unwrap();

    let started = Instant::now();
    let err = bus
        .wait_message(TOPIC, Some(Duration::from_millis(100)), &mut AnyMessage::default())
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_wait_on_unknown_target_is_not_found() {
    let broker = LocalBroker::new();
    let bus = connect(&broker);
    let err = wait_any(&bus, TargetId::from_u128(0xDEAD)).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{:?}", err);
}

#[test]
fn test_broadcast_skips_sender_and_uninterested_clients() {
    let broker = LocalBroker::new();
    let a = connect(&broker);
    let b = connect(&broker);
    let c = connect(&broker);
    a.define_target(TOPIC, None).unwrap();
    b.define_target(TOPIC, None).unwrap();

    a.broadcast(TOPIC, Bytes::from_static(b"news")).unwrap();
    let env = wait_any(&b, TOPIC).unwrap();
    assert_eq!(env.sender, a.client_id());
    assert_eq!(env.payload().unwrap().as_ref(), b"news");

    // Round trip so anything still in flight to `a` would have landed.
    a.ping().unwrap();
    let data = |bus: &BusClient| {
        bus.wait_message(
            TOPIC,
            Some(Duration::from_millis(50)),
            &mut |e: Option<&Envelope>| match e {
                Some(e) if e.payload().is_some() => Admit::Accept,
                _ => Admit::Continue,
            },
        )
    };
    assert!(data(&a).is_err());
    assert_eq!(c.pending(TOPIC), 0);
}

#[test]
fn test_message_before_define_is_kept_for_the_target() {
    let broker = LocalBroker::new();
    let a = connect(&broker);
    let b = connect(&broker);

    a.send(b.client_id(), TOPIC, Bytes::from_static(b"early")).unwrap();
    b.ping().unwrap();
    assert_eq!(b.pending(TOPIC), 1);

    b.define_target(TOPIC, None).unwrap();
    let env = wait_any(&b, TOPIC).unwrap();
    assert_eq!(env.payload().unwrap().as_ref(), b"early");

    b.undefine_target(TOPIC).unwrap();
    assert!(matches!(b.undefine_target(TOPIC), Err(Error::NotFound(_))));
}

#[test]
fn test_oversized_message_is_rejected_locally() {
    let broker = LocalBroker::new();
    let config = BusConfig {
        max_message_bytes: 16,
        ..BusConfig::default()
    };
    let a = BusClient::connect_local(&broker, config).unwrap();
    let b = connect(&broker);
    let err = a
        .send(b.client_id(), TOPIC, Bytes::from(vec![0u8; 17]))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{:?}", err);
}

#[test]
fn test_send_to_any_is_rejected() {
    let broker = LocalBroker::new();
    let a = connect(&broker);
    let err = a.send(ClientId::ANY, TOPIC, Bytes::new()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{:?}", err);
}

#[test]
fn test_broker_tracks_clients_and_targets() {
    let broker = LocalBroker::new();
    let a = connect(&broker);
    let b = connect(&broker);
    a.define_target(TOPIC, None).unwrap();
    b.define_target(TOPIC, None).unwrap();
    b.send(a.client_id(), TOPIC, Bytes::from_static(b"x")).unwrap();

    let stats = broker.broker().stats();
    assert_eq!(stats.connected_clients, 2);
    assert!(stats.messages_forwarded >= 1);
    let ids: HashSet<ClientId> = broker.broker().clients().iter().map(|c| c.id).collect();
    assert!(ids.contains(&a.client_id()));
    assert!(ids.contains(&b.client_id()));

    b.shutdown();
    let deadline = Instant::now() + Duration::from_secs(5);
    while broker.broker().stats().connected_clients != 1 {
        assert!(Instant::now() < deadline, "broker never dropped the client");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(b.state(), LinkState::Disconnected);
}

#[test]
fn test_late_joiner_sees_only_later_departures() {
    let broker = LocalBroker::new();
    let early = connect(&broker);
    let observer = connect(&broker);
    observer.define_target(TOPIC, None).unwrap();
    let late = connect(&broker);
    let late_id = late.client_id();
    let early_id = early.client_id();

    late.abort();
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !seen.contains(&(late_id, ClientState::Down)) {
        assert!(Instant::now() < deadline, "down notice never arrived");
        if let Ok(env) = observer.wait_message(
            TOPIC,
            Some(Duration::from_millis(50)),
            &mut |e: Option<&Envelope>| match e {
                Some(e) if e.client_state_change().is_some() => Admit::Accept,
                _ => Admit::Continue,
            },
        ) {
            if let Some(state) = env.client_state_change() {
                seen.push((env.sender, state));
            }
        }
    }
    assert!(!seen.iter().any(|(id, _)| *id == early_id));
}
