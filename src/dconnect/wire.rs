//! Object-proxy wire messages.
//!
//! Every message starts with an 8-byte little-endian header:
//! ```text
//! major:u8 minor:u8 flags:u16 request_index:u32
//! ```
//! Bodies:
//! ```text
//! SETUP         iid:16 selector-body
//! SETUP_REPLY   handle:u64 status:u32 [exception]
//! RELEASE       handle:u64
//! INVOKE        handle:u64 method:u16 in-params
//! INVOKE_REPLY  status:u32 [out-params] [exception]
//! ```
//! Parameter and exception bytes are left opaque here; see `marshal` and
//! `exception`.

use bytes::{BufMut, Bytes, BytesMut};

use super::arena::InstanceHandle;
use crate::buf::Reader;
use crate::types::{ClassId, Error, InterfaceId, RequestIndex, Result};

pub const HEADER_LEN: usize = 8;

/// Major opcodes.
pub mod opcode {
    pub const SETUP: u8 = 1;
    pub const RELEASE: u8 = 2;
    pub const INVOKE: u8 = 3;
    pub const SETUP_REPLY: u8 = 4;
    pub const INVOKE_REPLY: u8 = 5;
}

/// SETUP minor opcodes.
pub mod setup_minor {
    pub const NEW_INST_CLASSID: u8 = 1;
    pub const NEW_INST_CONTRACTID: u8 = 2;
    pub const GET_SERV_CLASSID: u8 = 3;
    pub const GET_SERV_CONTRACTID: u8 = 4;
    pub const QUERY_INTERFACE: u8 = 5;
}

/// Reply flag: an exception follows the body.
pub const REPLY_EXCEPTION: u16 = 0x0001;

/// Longest contract name accepted in a SETUP.
const MAX_CONTRACT_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
    pub flags: u16,
    pub request: RequestIndex,
}

impl Header {
    pub fn new(major: u8, minor: u8, flags: u16, request: RequestIndex) -> Self {
        Self {
            major,
            minor,
            flags,
            request,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.major);
        out.put_u8(self.minor);
        out.put_u16_le(self.flags);
        out.put_u32_le(self.request.0);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            major: r.u8("opcode")?,
            minor: r.u8("minor opcode")?,
            flags: r.u16("flags")?,
            request: RequestIndex(r.u32("request index")?),
        })
    }

    /// Read the header without consuming or copying the payload.
    pub fn peek(payload: &[u8]) -> Option<Self> {
        let head: &[u8; HEADER_LEN] = payload.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            major: head[0],
            minor: head[1],
            flags: u16::from_le_bytes([head[2], head[3]]),
            request: RequestIndex(u32::from_le_bytes([head[4], head[5], head[6], head[7]])),
        })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.major, opcode::SETUP_REPLY | opcode::INVOKE_REPLY)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.major, opcode::SETUP | opcode::RELEASE | opcode::INVOKE)
    }

    pub fn has_exception(&self) -> bool {
        self.flags & REPLY_EXCEPTION != 0
    }
}

/// How a SETUP names the object it wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupSelector {
    NewInstanceByClass(ClassId),
    NewInstanceByContract(String),
    ServiceByClass(ClassId),
    ServiceByContract(String),
    /// Ask an already exported instance for another interface.
    QueryInterface(InstanceHandle),
}

impl SetupSelector {
    pub fn minor(&self) -> u8 {
        match self {
            SetupSelector::NewInstanceByClass(_) => setup_minor::NEW_INST_CLASSID,
            SetupSelector::NewInstanceByContract(_) => setup_minor::NEW_INST_CONTRACTID,
            SetupSelector::ServiceByClass(_) => setup_minor::GET_SERV_CLASSID,
            SetupSelector::ServiceByContract(_) => setup_minor::GET_SERV_CONTRACTID,
            SetupSelector::QueryInterface(_) => setup_minor::QUERY_INTERFACE,
        }
    }

    fn encode_body(&self, out: &mut BytesMut) {
        match self {
            SetupSelector::NewInstanceByClass(cid) | SetupSelector::ServiceByClass(cid) => {
                out.put_slice(cid.as_bytes());
            }
            SetupSelector::NewInstanceByContract(name) | SetupSelector::ServiceByContract(name) => {
                out.put_u32_le(name.len() as u32);
                out.put_slice(name.as_bytes());
            }
            SetupSelector::QueryInterface(handle) => out.put_u64_le(handle.raw()),
        }
    }

    fn decode_body(minor: u8, r: &mut Reader) -> Result<Self> {
        let contract = |r: &mut Reader| -> Result<String> {
            let len = r.u32("contract length")? as usize;
            if len > MAX_CONTRACT_LEN {
                return Err(Error::protocol(format!("contract name of {} bytes", len)));
            }
            let raw = r.bytes(len, "contract name")?;
            String::from_utf8(raw.to_vec())
                .map_err(|_| Error::protocol("contract name is not utf-8"))
        };
        Ok(match minor {
            setup_minor::NEW_INST_CLASSID => {
                SetupSelector::NewInstanceByClass(ClassId::from_bytes(r.id16("class id")?))
            }
            setup_minor::NEW_INST_CONTRACTID => SetupSelector::NewInstanceByContract(contract(r)?),
            setup_minor::GET_SERV_CLASSID => {
                SetupSelector::ServiceByClass(ClassId::from_bytes(r.id16("class id")?))
            }
            setup_minor::GET_SERV_CONTRACTID => SetupSelector::ServiceByContract(contract(r)?),
            setup_minor::QUERY_INTERFACE => {
                SetupSelector::QueryInterface(InstanceHandle::from_raw(r.u64("instance handle")?))
            }
            other => return Err(Error::protocol(format!("unknown SETUP minor {}", other))),
        })
    }
}

/// One decoded object-proxy message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Setup {
        request: RequestIndex,
        iid: InterfaceId,
        selector: SetupSelector,
    },
    Release {
        handle: InstanceHandle,
    },
    Invoke {
        request: RequestIndex,
        handle: InstanceHandle,
        method: u16,
        params: Bytes,
    },
    SetupReply {
        request: RequestIndex,
        flags: u16,
        handle: InstanceHandle,
        status: u32,
        /// Exception bytes, present when `flags` carries [`REPLY_EXCEPTION`].
        tail: Bytes,
    },
    InvokeReply {
        request: RequestIndex,
        flags: u16,
        status: u32,
        /// Out-params on success, then the exception when flagged.
        tail: Bytes,
    },
}

impl Message {
    pub fn header(&self) -> Header {
        match self {
            Message::Setup {
                request, selector, ..
            } => Header::new(opcode::SETUP, selector.minor(), 0, *request),
            Message::Release { .. } => Header::new(opcode::RELEASE, 0, 0, RequestIndex(0)),
            Message::Invoke { request, .. } => Header::new(opcode::INVOKE, 0, 0, *request),
            Message::SetupReply { request, flags, .. } => {
                Header::new(opcode::SETUP_REPLY, 0, *flags, *request)
            }
            Message::InvokeReply { request, flags, .. } => {
                Header::new(opcode::INVOKE_REPLY, 0, *flags, *request)
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64);
        self.header().encode(&mut out);
        match self {
            Message::Setup { iid, selector, .. } => {
                out.put_slice(iid.as_bytes());
                selector.encode_body(&mut out);
            }
            Message::Release { handle } => out.put_u64_le(handle.raw()),
            Message::Invoke {
                handle,
                method,
                params,
                ..
            } => {
                out.put_u64_le(handle.raw());
                out.put_u16_le(*method);
                out.put_slice(params);
            }
            Message::SetupReply {
                handle,
                status,
                tail,
                ..
            } => {
                out.put_u64_le(handle.raw());
                out.put_u32_le(*status);
                out.put_slice(tail);
            }
            Message::InvokeReply { status, tail, .. } => {
                out.put_u32_le(*status);
                out.put_slice(tail);
            }
        }
        out.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut r = Reader::new(payload);
        let header = Header::decode(&mut r)?;
        let msg = match header.major {
            opcode::SETUP => {
                let iid = InterfaceId::from_bytes(r.id16("interface id")?);
                let selector = SetupSelector::decode_body(header.minor, &mut r)?;
                r.expect_end("SETUP")?;
                Message::Setup {
                    request: header.request,
                    iid,
                    selector,
                }
            }
            opcode::RELEASE => {
                let handle = InstanceHandle::from_raw(r.u64("instance handle")?);
                r.expect_end("RELEASE")?;
                Message::Release { handle }
            }
            opcode::INVOKE => Message::Invoke {
                request: header.request,
                handle: InstanceHandle::from_raw(r.u64("instance handle")?),
                method: r.u16("method index")?,
                params: r.rest(),
            },
            opcode::SETUP_REPLY => Message::SetupReply {
                request: header.request,
                flags: header.flags,
                handle: InstanceHandle::from_raw(r.u64("instance handle")?),
                status: r.u32("status")?,
                tail: r.rest(),
            },
            opcode::INVOKE_REPLY => Message::InvokeReply {
                request: header.request,
                flags: header.flags,
                status: r.u32("status")?,
                tail: r.rest(),
            },
            other => return Err(Error::protocol(format!("unknown opcode {}", other))),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_layout_is_little_endian() {
        let mut out = BytesMut::new();
        Header::new(opcode::INVOKE_REPLY, 0, REPLY_EXCEPTION, RequestIndex(0x0102_0304)).encode(&mut out);
        assert_eq!(out.as_ref(), &[5, 0, 1, 0, 4, 3, 2, 1]);
        let peeked = Header::peek(&out).unwrap();
        assert!(peeked.is_reply());
        assert!(peeked.has_exception());
        assert_eq!(Header::peek(&out[..7]), None);
    }

    #[test]
    fn test_setup_by_contract_decodes() {
        let msg = Message::Setup {
            request: RequestIndex(9),
            iid: InterfaceId::from_u128(0x55),
            selector: SetupSelector::ServiceByContract("@example.org/echo;1".into()),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[1], setup_minor::GET_SERV_CONTRACTID);
        assert_eq!(Message::decode(bytes).unwrap(), msg);
    }

    #[test]
    fn test_release_has_no_request_index() {
        let bytes = Message::Release {
            handle: InstanceHandle::from_raw(0x42),
        }
        .encode();
        assert_eq!(bytes.len(), HEADER_LEN + 8);
        assert_eq!(Header::peek(&bytes).unwrap().request, RequestIndex(0));
    }

    #[test]
    fn test_unknown_opcode_and_minor_are_protocol_errors() {
        let mut out = BytesMut::new();
        Header::new(42, 0, 0, RequestIndex(1)).encode(&mut out);
        assert!(matches!(Message::decode(out.freeze()), Err(Error::Protocol(_))));

        let mut out = BytesMut::new();
        Header::new(opcode::SETUP, 9, 0, RequestIndex(1)).encode(&mut out);
        out.put_slice(&[0u8; 16]);
        assert!(matches!(Message::decode(out.freeze()), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_contract_length_rejected_before_read() {
        let mut out = BytesMut::new();
        Header::new(opcode::SETUP, setup_minor::NEW_INST_CONTRACTID, 0, RequestIndex(1)).encode(&mut out);
        out.put_slice(&[0u8; 16]);
        out.put_u32_le(u32::MAX);
        assert!(matches!(Message::decode(out.freeze()), Err(Error::Protocol(_))));
    }
}
