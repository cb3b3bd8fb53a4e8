//! Reply selection and the client-down cache.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::wire::Header;
use crate::bus::{Admit, ClientState, Envelope, Selector};
use crate::types::{ClientId, RequestIndex};

#[derive(Debug, Default)]
struct DownEntries {
    by_client: HashMap<ClientId, Instant>,
    order: VecDeque<(ClientId, Instant)>,
}

/// Clients recently reported down. Bounded in age and size.
#[derive(Debug)]
pub(crate) struct ClientDownCache {
    entries: Mutex<DownEntries>,
    retention: Duration,
    capacity: usize,
}

impl ClientDownCache {
    pub(crate) fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(DownEntries::default()),
            retention,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn record(&self, client: ClientId) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, now, self.retention);
        if entries.by_client.insert(client, now).is_none() {
            while entries.by_client.len() > self.capacity {
                let Some((oldest, at)) = entries.order.pop_front() else {
                    break;
                };
                if entries.by_client.get(&oldest) == Some(&at) {
                    entries.by_client.remove(&oldest);
                }
            }
        }
        entries.order.push_back((client, now));
    }

    pub(crate) fn clear(&self, client: ClientId) {
        self.entries.lock().by_client.remove(&client);
    }

    pub(crate) fn contains(&self, client: ClientId) -> bool {
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, Instant::now(), self.retention);
        entries.by_client.contains_key(&client)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().by_client.len()
    }

    fn expire(entries: &mut DownEntries, now: Instant, retention: Duration) {
        while let Some(&(client, at)) = entries.order.front() {
            if now.duration_since(at) < retention {
                break;
            }
            entries.order.pop_front();
            if entries.by_client.get(&client) == Some(&at) {
                entries.by_client.remove(&client);
            }
        }
    }
}

/// What a waiter accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accepted {
    /// The reply this waiter is waiting for.
    Reply,
    /// A request from some peer; the waiter hands it to the pool.
    Request,
    /// The awaited peer went down.
    PeerDown,
    Other,
}

/// Waits for one reply from one peer while letting the waiter pick up
/// inbound requests, so a blocked caller can still serve nested calls.
#[derive(Debug)]
pub(crate) struct ReplySelector<'a> {
    peer: ClientId,
    opcode: u8,
    request: RequestIndex,
    down: &'a ClientDownCache,
}

impl<'a> ReplySelector<'a> {
    pub(crate) fn new(peer: ClientId, opcode: u8, request: RequestIndex, down: &'a ClientDownCache) -> Self {
        Self {
            peer,
            opcode,
            request,
            down,
        }
    }

    pub(crate) fn classify(&self, envelope: &Envelope) -> Accepted {
        if let Some(ClientState::Down) = envelope.client_state_change() {
            return if envelope.sender == self.peer {
                Accepted::PeerDown
            } else {
                Accepted::Other
            };
        }
        let Some(header) = envelope.payload().and_then(|p| Header::peek(p)) else {
            return Accepted::Other;
        };
        if header.is_request() {
            Accepted::Request
        } else if envelope.sender == self.peer && header.major == self.opcode && header.request == self.request {
            Accepted::Reply
        } else {
            Accepted::Other
        }
    }
}

impl Selector for ReplySelector<'_> {
    fn admit(&mut self, envelope: Option<&Envelope>) -> Admit {
        let Some(envelope) = envelope else {
            return if self.down.contains(self.peer) {
                Admit::Accept
            } else {
                Admit::Continue
            };
        };
        match envelope.client_state_change() {
            Some(ClientState::Down) => {
                self.down.record(envelope.sender);
                return if envelope.sender == self.peer {
                    Admit::Accept
                } else {
                    Admit::Discard
                };
            }
            Some(ClientState::Up) => {
                self.down.clear(envelope.sender);
                return Admit::Discard;
            }
            None => {}
        }
        match self.classify(envelope) {
            Accepted::Reply | Accepted::Request => Admit::Accept,
            Accepted::PeerDown | Accepted::Other => Admit::Continue,
        }
    }
}
