//! Exception channel.
//!
//! A failing call may leave an exception object behind as the calling
//! thread's "current exception". Across the wire it travels like a nested
//! object reference, followed (when a fresh wrapper is handed out) by the
//! common fields so the receiver can read them without a round trip.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use std::cell::RefCell;
use std::sync::Arc;

use super::arena::InstanceHandle;
use super::interface::{InterfaceInfo, MethodInfo, ParamInfo, TypeTag};
use super::marshal::ObjectCodec;
use super::object::{Object, ObjectRef};
use super::value::Value;
use crate::buf::Reader;
use crate::types::{status, Error, InterfaceId, Result};

/// Interface implemented by every exception object.
pub const EXCEPTION_IID: InterfaceId =
    InterfaceId::from_u128(0xf3a8_d3b4_c3b4_4b1c_9f5e_3c2a_1b0d_7e61);

/// Longest cached exception string accepted from a peer.
const MAX_FIELD_LEN: usize = 64 * 1024;

/// The cached fields of an exception.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub message: String,
    pub result: u32,
    pub name: String,
    pub filename: String,
    pub line_number: u32,
    pub column_number: u32,
}

impl ExceptionInfo {
    pub fn new(result: u32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            result,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_location(mut self, filename: impl Into<String>, line: u32, column: u32) -> Self {
        self.filename = filename.into();
        self.line_number = line;
        self.column_number = column;
        self
    }
}

/// An exception: its fields plus the object that carries them, which may
/// live in another process.
#[derive(Debug, Clone)]
pub struct Exception {
    pub info: ExceptionInfo,
    pub origin: ObjectRef,
}

impl Exception {
    pub fn local(info: ExceptionInfo) -> Self {
        let origin = ObjectRef::Local(Arc::new(ExceptionObject { info: info.clone() }));
        Self { info, origin }
    }

    pub fn is_remote(&self) -> bool {
        self.origin.is_remote()
    }
}

/// Local exception object backing [`Exception::local`].
#[derive(Debug)]
struct ExceptionObject {
    info: ExceptionInfo,
}

impl Object for ExceptionObject {
    fn implements(&self, iid: &InterfaceId) -> bool {
        *iid == EXCEPTION_IID
    }

    fn call(&self, iid: &InterfaceId, method: u16, params: &mut [Value]) -> Result<()> {
        if *iid != EXCEPTION_IID {
            return Err(Error::no_interface(format!("exception does not implement {}", iid)));
        }
        let value = match method {
            0 => Value::str(self.info.message.clone()),
            1 => Value::U32(self.info.result),
            2 => Value::str(self.info.name.clone()),
            3 => Value::str(self.info.filename.clone()),
            4 => Value::U32(self.info.line_number),
            5 => Value::U32(self.info.column_number),
            other => return Err(Error::validation(format!("exception has no method {}", other))),
        };
        let slot = params
            .first_mut()
            .ok_or_else(|| Error::validation("exception getter needs a result slot"))?;
        *slot = value;
        Ok(())
    }

    fn exception_info(&self) -> Option<ExceptionInfo> {
        Some(self.info.clone())
    }
}

/// Descriptor for [`EXCEPTION_IID`]: one getter per cached field.
pub fn exception_interface() -> InterfaceInfo {
    let getter = |name: &str, ty: TypeTag| MethodInfo::new(name).param(ParamInfo::retval(ty));
    InterfaceInfo::new(EXCEPTION_IID, "IException")
        .method(getter("message", TypeTag::CString))
        .method(getter("result", TypeTag::U32))
        .method(getter("name", TypeTag::CString))
        .method(getter("filename", TypeTag::CString))
        .method(getter("lineNumber", TypeTag::U32))
        .method(getter("columnNumber", TypeTag::U32))
}

thread_local! {
    static CURRENT: RefCell<Option<Exception>> = const { RefCell::new(None) };
}

/// The calling thread's current exception.
pub fn current_exception() -> Option<Exception> {
    CURRENT.with(|c| c.borrow().clone())
}

pub fn set_current_exception(exception: Option<Exception>) {
    // Swap out first so a dropped remote exception never runs under the borrow.
    let previous = CURRENT.with(|c| c.replace(exception));
    drop(previous);
}

pub fn take_current_exception() -> Option<Exception> {
    CURRENT.with(|c| c.borrow_mut().take())
}

pub fn clear_current_exception() {
    set_current_exception(None);
}

/// Install a local exception and return the error to propagate from
/// [`Object::call`].
pub fn raise(info: ExceptionInfo) -> Error {
    let code = if status::failed(info.result) {
        info.result
    } else {
        status::FAILURE
    };
    let err = Error::remote(code, info.message.clone());
    set_current_exception(Some(Exception::local(info)));
    err
}

fn put_str(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn get_str(r: &mut Reader, what: &'static str) -> Result<String> {
    let len = r.u32(what)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(Error::protocol(format!("{} of {} bytes", what, len)));
    }
    let raw = r.bytes(len, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol(format!("{} is not utf-8", what)))
}

/// Append `exception` to a reply body.
pub(crate) fn write_exception(
    out: &mut BytesMut,
    exception: &Exception,
    codec: &mut dyn ObjectCodec,
) -> Result<()> {
    let raw = codec.encode_object(Some(&exception.origin), &EXCEPTION_IID)?;
    out.put_u64_le(raw);
    if raw & InstanceHandle::REMOTE_BIT != 0 {
        let info = &exception.info;
        put_str(out, &info.message);
        out.put_u32_le(info.result);
        put_str(out, &info.name);
        put_str(out, &info.filename);
        out.put_u32_le(info.line_number);
        out.put_u32_le(info.column_number);
    }
    Ok(())
}

/// Read an exception appended by [`write_exception`]. A null reference
/// means "no exception".
pub(crate) fn read_exception(r: &mut Reader, codec: &mut dyn ObjectCodec) -> Result<Option<Exception>> {
    let raw = r.u64("exception handle")?;
    if raw == 0 {
        return Ok(None);
    }
    let cached = if raw & InstanceHandle::REMOTE_BIT != 0 {
        Some(ExceptionInfo {
            message: get_str(r, "exception message")?,
            result: r.u32("exception result")?,
            name: get_str(r, "exception name")?,
            filename: get_str(r, "exception filename")?,
            line_number: r.u32("exception line")?,
            column_number: r.u32("exception column")?,
        })
    } else {
        None
    };
    let Some(origin) = codec.decode_object(raw, &EXCEPTION_IID)? else {
        return Ok(None);
    };
    let info = cached
        .or_else(|| origin.exception_info())
        .unwrap_or_default();
    Ok(Some(Exception { info, origin }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_installs_current_exception() {
        clear_current_exception();
        let err = raise(ExceptionInfo::new(0x8055_0001, "boom").with_name("echo"));
        assert_eq!(err.status(), 0x8055_0001);
        let current = current_exception().unwrap();
        assert_eq!(current.info.message, "boom");
        assert_eq!(current.info.name, "echo");
        assert!(!current.is_remote());
        clear_current_exception();
        assert!(current_exception().is_none());
    }

    #[test]
    fn test_raise_with_success_code_still_fails() {
        let err = raise(ExceptionInfo::new(status::OK, "odd"));
        assert_eq!(err.status(), status::FAILURE);
        assert!(take_current_exception().is_some());
        assert!(take_current_exception().is_none());
    }

    #[test]
    fn test_current_exception_is_per_thread() {
        set_current_exception(Some(Exception::local(ExceptionInfo::new(status::ABORT, "main"))));
        let other = std::thread::spawn(current_exception).join().unwrap();
        assert!(other.is_none());
        assert!(current_exception().is_some());
        clear_current_exception();
    }

    #[test]
    fn test_local_exception_object_answers_getters() {
        let exc = Exception::local(ExceptionInfo::new(status::ABORT, "m").with_location("f.js", 3, 9));
        let mut slot = [Value::U32(0)];
        exc.origin.invoke(&EXCEPTION_IID, 4, &mut slot).unwrap();
        assert_eq!(slot[0], Value::U32(3));
        exc.origin.invoke(&EXCEPTION_IID, 0, &mut slot).unwrap();
        assert_eq!(slot[0], Value::str("m"));
        assert!(exception_interface().validate().is_ok());
    }
}
