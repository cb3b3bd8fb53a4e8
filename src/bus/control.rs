//! Control protocol spoken on [`TargetId::CONTROL`] between a client and the broker.
//!
//! Layout: one tag byte followed by little-endian fields.
//! ```text
//! Hello       0x01  request:u32
//! ClientId    0x02  request:u32 client:u32
//! AddTarget   0x03  request:u32 target:16
//! DelTarget   0x04  request:u32 target:16
//! Forward     0x05  request:u32 dest:u32 target:16 payload:*
//! ClientState 0x06  client:u32 state:u8 (0 = down, 1 = up)
//! Ping        0x07  request:u32
//! Ack         0x08  request:u32 status:u32
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::buf::Reader;
use crate::bus::envelope::ClientState;
use crate::types::{ClientId, Error, RequestIndex, Result, TargetId};

const TAG_HELLO: u8 = 0x01;
const TAG_CLIENT_ID: u8 = 0x02;
const TAG_ADD_TARGET: u8 = 0x03;
const TAG_DEL_TARGET: u8 = 0x04;
const TAG_FORWARD: u8 = 0x05;
const TAG_CLIENT_STATE: u8 = 0x06;
const TAG_PING: u8 = 0x07;
const TAG_ACK: u8 = 0x08;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Hello {
        request: RequestIndex,
    },
    ClientId {
        request: RequestIndex,
        client: ClientId,
    },
    AddTarget {
        request: RequestIndex,
        target: TargetId,
    },
    DelTarget {
        request: RequestIndex,
        target: TargetId,
    },
    /// Deliver `payload` on `target` to `dest`; `ClientId::ANY` fans out to
    /// every other client that registered `target`.
    Forward {
        request: RequestIndex,
        dest: ClientId,
        target: TargetId,
        payload: Bytes,
    },
    ClientState {
        client: ClientId,
        state: ClientState,
    },
    Ping {
        request: RequestIndex,
    },
    Ack {
        request: RequestIndex,
        status: u32,
    },
}

impl ControlMessage {
    /// Request index this message answers or carries, if any.
    pub fn request(&self) -> Option<RequestIndex> {
        match self {
            ControlMessage::Hello { request }
            | ControlMessage::ClientId { request, .. }
            | ControlMessage::AddTarget { request, .. }
            | ControlMessage::DelTarget { request, .. }
            | ControlMessage::Forward { request, .. }
            | ControlMessage::Ping { request }
            | ControlMessage::Ack { request, .. } => Some(*request),
            ControlMessage::ClientState { .. } => None,
        }
    }

    /// True for broker-to-client answers that a waiter correlates by index.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            ControlMessage::ClientId { .. } | ControlMessage::Ack { .. }
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(32);
        match self {
            ControlMessage::Hello { request } => {
                out.put_u8(TAG_HELLO);
                out.put_u32_le(request.0);
            }
            ControlMessage::ClientId { request, client } => {
                out.put_u8(TAG_CLIENT_ID);
                out.put_u32_le(request.0);
                out.put_u32_le(client.get());
            }
            ControlMessage::AddTarget { request, target } => {
                out.put_u8(TAG_ADD_TARGET);
                out.put_u32_le(request.0);
                out.put_slice(target.as_bytes());
            }
            ControlMessage::DelTarget { request, target } => {
                out.put_u8(TAG_DEL_TARGET);
                out.put_u32_le(request.0);
                out.put_slice(target.as_bytes());
            }
            ControlMessage::Forward {
                request,
                dest,
                target,
                payload,
            } => {
                out.reserve(payload.len());
                out.put_u8(TAG_FORWARD);
                out.put_u32_le(request.0);
                out.put_u32_le(dest.get());
                out.put_slice(target.as_bytes());
                out.put_slice(payload);
            }
            ControlMessage::ClientState { client, state } => {
                out.put_u8(TAG_CLIENT_STATE);
                out.put_u32_le(client.get());
                out.put_u8(match state {
                    ClientState::Down => 0,
                    ClientState::Up => 1,
                });
            }
            ControlMessage::Ping { request } => {
                out.put_u8(TAG_PING);
                out.put_u32_le(request.0);
            }
            ControlMessage::Ack { request, status } => {
                out.put_u8(TAG_ACK);
                out.put_u32_le(request.0);
                out.put_u32_le(*status);
            }
        }
        out.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut r = Reader::new(payload);
        let tag = r.u8("control tag")?;
        let msg = match tag {
            TAG_HELLO => ControlMessage::Hello {
                request: RequestIndex(r.u32("request")?),
            },
            TAG_CLIENT_ID => ControlMessage::ClientId {
                request: RequestIndex(r.u32("request")?),
                client: ClientId::new(r.u32("client id")?),
            },
            TAG_ADD_TARGET => ControlMessage::AddTarget {
                request: RequestIndex(r.u32("request")?),
                target: TargetId::from_bytes(r.id16("target")?),
            },
            TAG_DEL_TARGET => ControlMessage::DelTarget {
                request: RequestIndex(r.u32("request")?),
                target: TargetId::from_bytes(r.id16("target")?),
            },
            TAG_FORWARD => {
                let request = RequestIndex(r.u32("request")?);
                let dest = ClientId::new(r.u32("dest")?);
                let target = TargetId::from_bytes(r.id16("target")?);
                return Ok(ControlMessage::Forward {
                    request,
                    dest,
                    target,
                    payload: r.rest(),
                });
            }
            TAG_CLIENT_STATE => {
                let client = ClientId::new(r.u32("client id")?);
                let state = match r.u8("client state")? {
                    0 => ClientState::Down,
                    1 => ClientState::Up,
                    other => {
                        return Err(Error::protocol(format!("bad client state {}", other)))
                    }
                };
                ControlMessage::ClientState { client, state }
            }
            TAG_PING => ControlMessage::Ping {
                request: RequestIndex(r.u32("request")?),
            },
            TAG_ACK => ControlMessage::Ack {
                request: RequestIndex(r.u32("request")?),
                status: r.u32("status")?,
            },
            other => {
                return Err(Error::protocol(format!(
                    "unknown control tag 0x{:02X}",
                    other
                )))
            }
        };
        r.expect_end("control message")?;
        Ok(msg)
    }
}
