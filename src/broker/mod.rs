//! Broker routing core.
//!
//! The broker owns the table of connected clients and the targets each one
//! registered. It is transport agnostic: connections are attached as
//! [`ClientSink`]s and their inbound frames are fed to [`Broker::handle_frame`].
//!
//! Responsibilities:
//!   - assign client ids (from 1; 0 is the broker and the "any" sender)
//!   - answer HELLO with the assigned id and announce the newcomer
//!   - track AddTarget / DelTarget interest
//!   - Forward to a named peer, or fan out to every interested client
//!   - broadcast a client's death exactly once when it detaches

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::bus::control::ControlMessage;
use crate::bus::envelope::ClientState;
use crate::types::{status, ClientId, Error, RequestIndex, Result, TargetId};

/// Outbound half of one attached client connection.
pub trait ClientSink: Send + Sync + fmt::Debug {
    /// Queue a frame for the client. Must not block.
    fn deliver(&self, sender: ClientId, target: TargetId, payload: Bytes) -> Result<()>;
}

#[derive(Debug)]
struct ClientEntry {
    sink: Arc<dyn ClientSink>,
    targets: HashSet<TargetId>,
    greeted: bool,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BrokerState {
    clients: HashMap<ClientId, ClientEntry>,
    next_id: u32,
    forwarded: u64,
    rejected: u64,
}

/// Statistics about broker usage.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BrokerStats {
    pub connected_clients: usize,
    pub registered_targets: usize,
    pub messages_forwarded: u64,
    pub forwards_rejected: u64,
}

/// Snapshot of one connected client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub targets: Vec<TargetId>,
    pub connected_at: DateTime<Utc>,
}

/// A frame queued for delivery once the state lock is released.
type Outbound = (Arc<dyn ClientSink>, ClientId, TargetId, Bytes);

#[derive(Debug, Default)]
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and assign its client id.
    pub fn attach(&self, sink: Arc<dyn ClientSink>) -> Result<ClientId> {
        let mut state = self.state.lock();
        let raw = state
            .next_id
            .checked_add(1)
            .ok_or_else(|| Error::out_of_resources("client id space exhausted"))?;
        state.next_id = raw;
        let id = ClientId::new(raw);
        state.clients.insert(
            id,
            ClientEntry {
                sink,
                targets: HashSet::new(),
                greeted: false,
                connected_at: Utc::now(),
            },
        );
        tracing::debug!("broker: attached {}", id);
        Ok(id)
    }

    /// Drop a connection and tell every remaining client it is gone.
    ///
    /// Only the first call for an id broadcasts.
    pub fn detach(&self, id: ClientId) {
        let outbound: Vec<Outbound> = {
            let mut state = self.state.lock();
            if state.clients.remove(&id).is_none() {
                return;
            }
            let notice = ControlMessage::ClientState {
                client: id,
                state: ClientState::Down,
            }
            .encode();
            state
                .clients
                .values()
                .map(|c| (c.sink.clone(), ClientId::BROKER, TargetId::CONTROL, notice.clone()))
                .collect()
        };
        tracing::info!("broker: {} detached, notifying {} clients", id, outbound.len());
        flush(outbound);
    }

    /// Process one frame received from `from`.
    ///
    /// Malformed frames are logged and dropped; the connection stays up.
    pub fn handle_frame(&self, from: ClientId, target: TargetId, payload: Bytes) {
        if target != TargetId::CONTROL {
            tracing::warn!(
                "broker: {} sent {} bytes on non-control target {}; dropped",
                from,
                payload.len(),
                target
            );
            return;
        }
        let msg = match ControlMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("broker: malformed control frame from {}: {}", from, e);
                return;
            }
        };

        let outbound = {
            let mut state = self.state.lock();
            self.apply(&mut state, from, msg)
        };
        flush(outbound);
    }

    fn apply(&self, state: &mut BrokerState, from: ClientId, msg: ControlMessage) -> Vec<Outbound> {
        let Some(sender) = state.clients.get(&from).map(|c| c.sink.clone()) else {
            tracing::debug!("broker: frame from detached {}; dropped", from);
            return Vec::new();
        };
        let reply = |request: RequestIndex, code: u32| -> Outbound {
            (
                sender.clone(),
                ClientId::BROKER,
                TargetId::CONTROL,
                ControlMessage::Ack {
                    request,
                    status: code,
                }
                .encode(),
            )
        };

        match msg {
            ControlMessage::Hello { request } => {
                let mut out = vec![(
                    sender.clone(),
                    ClientId::BROKER,
                    TargetId::CONTROL,
                    ControlMessage::ClientId {
                        request,
                        client: from,
                    }
                    .encode(),
                )];
                let first = state
                    .clients
                    .get_mut(&from)
                    .map(|c| !std::mem::replace(&mut c.greeted, true))
                    .unwrap_or(false);
                if first {
                    let notice = ControlMessage::ClientState {
                        client: from,
                        state: ClientState::Up,
                    }
                    .encode();
                    out.extend(
                        state
                            .clients
                            .iter()
                            .filter(|(id, _)| **id != from)
                            .map(|(_, c)| {
                                (c.sink.clone(), ClientId::BROKER, TargetId::CONTROL, notice.clone())
                            }),
                    );
                }
                out
            }
            ControlMessage::AddTarget { request, target } => {
                if let Some(c) = state.clients.get_mut(&from) {
                    c.targets.insert(target);
                }
                vec![reply(request, status::OK)]
            }
            ControlMessage::DelTarget { request, target } => {
                if let Some(c) = state.clients.get_mut(&from) {
                    c.targets.remove(&target);
                }
                vec![reply(request, status::OK)]
            }
            ControlMessage::Forward {
                request,
                dest,
                target,
                payload,
            } => {
                if dest.is_any() {
                    let mut out: Vec<Outbound> = state
                        .clients
                        .iter()
                        .filter(|(id, c)| **id != from && c.targets.contains(&target))
                        .map(|(_, c)| (c.sink.clone(), from, target, payload.clone()))
                        .collect();
                    state.forwarded += out.len() as u64;
                    out.push(reply(request, status::OK));
                    return out;
                }
                match state.clients.get(&dest) {
                    Some(c) => {
                        let delivery = (c.sink.clone(), from, target, payload);
                        state.forwarded += 1;
                        vec![delivery, reply(request, status::OK)]
                    }
                    None => {
                        state.rejected += 1;
                        tracing::debug!("broker: forward from {} to unknown {}", from, dest);
                        vec![reply(request, status::FACTORY_NOT_REGISTERED)]
                    }
                }
            }
            ControlMessage::Ping { request } => vec![reply(request, status::OK)],
            other => {
                tracing::warn!("broker: unexpected control message from {}: {:?}", from, other);
                Vec::new()
            }
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            connected_clients: state.clients.len(),
            registered_targets: state.clients.values().map(|c| c.targets.len()).sum(),
            messages_forwarded: state.forwarded,
            forwards_rejected: state.rejected,
        }
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let state = self.state.lock();
        let mut out: Vec<ClientInfo> = state
            .clients
            .iter()
            .map(|(id, c)| ClientInfo {
                id: *id,
                targets: c.targets.iter().copied().collect(),
                connected_at: c.connected_at,
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }
}

fn flush(outbound: Vec<Outbound>) {
    for (sink, sender, target, payload) in outbound {
        if let Err(e) = sink.deliver(sender, target, payload) {
            tracing::debug!("broker: delivery to closed sink failed: {}", e);
        }
    }
}
