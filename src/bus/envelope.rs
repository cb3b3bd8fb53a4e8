//! Envelopes queued on targets.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ClientId, TargetId};

/// Liveness state of a client as announced by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientState {
    Up,
    Down,
}

/// What an envelope carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Opaque application payload.
    Data(Bytes),
    /// Synthetic liveness notice fanned out into every target queue.
    /// The envelope's `sender` is the client whose state changed.
    ClientState(ClientState),
}

/// One message on a target. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: ClientId,
    pub target: TargetId,
    pub body: Body,
}

impl Envelope {
    pub fn data(sender: ClientId, target: TargetId, payload: Bytes) -> Self {
        Self {
            sender,
            target,
            body: Body::Data(payload),
        }
    }

    pub fn client_state(client: ClientId, target: TargetId, state: ClientState) -> Self {
        Self {
            sender: client,
            target,
            body: Body::ClientState(state),
        }
    }

    /// The payload, if this is a data envelope.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Data(p) => Some(p),
            Body::ClientState(_) => None,
        }
    }

    pub fn client_state_change(&self) -> Option<ClientState> {
        match &self.body {
            Body::ClientState(s) => Some(*s),
            Body::Data(_) => None,
        }
    }
}
