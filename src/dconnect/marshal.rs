//! Parameter marshaling.
//!
//! Params travel in two groups: every non-array param in declaration order,
//! then every array param in declaration order. Object references are
//! written as 64-bit values produced by an [`ObjectCodec`]; on the way in
//! they are resolved only after all scalars are read, since `iid_is`,
//! `size_is` and `length_is` may name later params.

use bytes::{BufMut, BytesMut};

use super::interface::{MethodInfo, ParamInfo, TypeTag};
use super::object::ObjectRef;
use super::value::Value;
use crate::buf::Reader;
use crate::types::{Error, InterfaceId, Result};

const NULL_STRING: u32 = 0xFFFF_FFFF;

/// Which half of a call a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// In and in-out params.
    Request,
    /// Out, in-out and retval params.
    Reply,
}

impl Side {
    fn carries(&self, param: &ParamInfo) -> bool {
        match self {
            Side::Request => param.dir.is_in(),
            Side::Reply => param.dir.is_out(),
        }
    }
}

/// Turns object references into wire values and back, for one peer.
pub trait ObjectCodec {
    fn encode_object(&mut self, object: Option<&ObjectRef>, iid: &InterfaceId) -> Result<u64>;

    fn decode_object(&mut self, raw: u64, iid: &InterfaceId) -> Result<Option<ObjectRef>>;
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_array_elements: u32,
}

fn mismatch(param: &ParamInfo, value: &Value) -> Error {
    Error::validation(format!(
        "param {} is {:?} but holds {:?}",
        param.name, param.ty, value
    ))
}

fn iid_for(ty: &TypeTag, params: &[Value]) -> Result<InterfaceId> {
    match ty {
        TypeTag::Interface(iid) => Ok(*iid),
        TypeTag::InterfaceIs { iid_arg } => params
            .get(usize::from(*iid_arg))
            .and_then(Value::as_iid)
            .ok_or_else(|| Error::validation(format!("iid_is param {} is not an iid", iid_arg))),
        other => Err(Error::internal(format!("{:?} is not an interface", other))),
    }
}

fn count_param(params: &[Value], index: u8, what: &str) -> Result<u64> {
    params
        .get(usize::from(index))
        .and_then(Value::as_count)
        .ok_or_else(|| Error::validation(format!("{} param {} is not a count", what, index)))
}

/// `(size, length)` of an array param, with `length` clamped to `size`.
fn array_bounds(ty: &TypeTag, params: &[Value], limits: Limits) -> Result<(usize, usize)> {
    let TypeTag::Array {
        elem,
        size_is,
        length_is,
    } = ty
    else {
        return Err(Error::internal("not an array"));
    };
    if elem.is_array() {
        return Err(Error::not_implemented("multidimensional arrays"));
    }
    let size = count_param(params, *size_is, "size_is")?;
    if size > u64::from(limits.max_array_elements) {
        return Err(Error::protocol(format!(
            "array of {} elements exceeds limit {}",
            size, limits.max_array_elements
        )));
    }
    let length = match length_is {
        Some(idx) => count_param(params, *idx, "length_is")?.min(size),
        None => size,
    };
    Ok((size as usize, length as usize))
}

fn put_string(out: &mut BytesMut, value: Option<&str>, wide: bool, nullable: bool) {
    let Some(s) = value.or(if nullable { None } else { Some("") }) else {
        out.put_u32_le(NULL_STRING);
        return;
    };
    if wide {
        let units: Vec<u16> = s.encode_utf16().collect();
        out.put_u32_le((units.len() * 2) as u32);
        for unit in units {
            out.put_u16_le(unit);
        }
    } else {
        out.put_u32_le(s.len() as u32);
        out.put_slice(s.as_bytes());
    }
}

fn get_string(r: &mut Reader, wide: bool, nullable: bool) -> Result<Option<String>> {
    let len = r.u32("string length")?;
    if len == NULL_STRING {
        return Ok(if nullable { None } else { Some(String::new()) });
    }
    let raw = r.bytes(len as usize, "string data")?;
    let text = if wide {
        if raw.len() % 2 != 0 {
            return Err(Error::protocol("16-bit string with odd byte length"));
        }
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| Error::protocol("invalid utf-16 string"))?
    } else {
        String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("invalid utf-8 string"))?
    };
    Ok(Some(text))
}

/// Write one non-array value.
fn write_value(
    out: &mut BytesMut,
    param: &ParamInfo,
    ty: &TypeTag,
    value: &Value,
    params: &[Value],
    codec: &mut dyn ObjectCodec,
) -> Result<()> {
    match (ty, value) {
        (TypeTag::I8, Value::I8(v)) => out.put_i8(*v),
        (TypeTag::I16, Value::I16(v)) => out.put_i16_le(*v),
        (TypeTag::I32, Value::I32(v)) => out.put_i32_le(*v),
        (TypeTag::I64, Value::I64(v)) => out.put_i64_le(*v),
        (TypeTag::U8, Value::U8(v)) => out.put_u8(*v),
        (TypeTag::U16, Value::U16(v)) => out.put_u16_le(*v),
        (TypeTag::U32, Value::U32(v)) => out.put_u32_le(*v),
        (TypeTag::U64, Value::U64(v)) => out.put_u64_le(*v),
        (TypeTag::F32, Value::F32(v)) => out.put_f32_le(*v),
        (TypeTag::F64, Value::F64(v)) => out.put_f64_le(*v),
        (TypeTag::Bool, Value::Bool(v)) => out.put_u8(u8::from(*v)),
        (TypeTag::Char, Value::Char(v)) => out.put_u8(*v),
        (TypeTag::WChar, Value::WChar(v)) => out.put_u16_le(*v),
        (TypeTag::Iid, Value::Iid(iid)) => out.put_slice(iid.as_bytes()),
        (TypeTag::CharStr, Value::Str(s)) => put_string(out, s.as_deref(), false, true),
        (TypeTag::CString, Value::Str(s)) => put_string(out, s.as_deref(), false, false),
        (TypeTag::WCharStr, Value::WStr(s)) => put_string(out, s.as_deref(), true, true),
        (TypeTag::AString, Value::WStr(s)) => put_string(out, s.as_deref(), true, false),
        (TypeTag::Interface(_) | TypeTag::InterfaceIs { .. }, Value::Object(obj)) => {
            let iid = iid_for(ty, params)?;
            out.put_u64_le(codec.encode_object(obj.as_ref(), &iid)?);
        }
        _ => return Err(mismatch(param, value)),
    }
    Ok(())
}

/// A non-array value as read, with object references still raw.
enum Pending {
    Ready(Value),
    Object(u64),
}

fn read_value(r: &mut Reader, ty: &TypeTag) -> Result<Pending> {
    let value = match ty {
        TypeTag::I8 => Value::I8(r.i8("i8")?),
        TypeTag::I16 => Value::I16(r.i16("i16")?),
        TypeTag::I32 => Value::I32(r.i32("i32")?),
        TypeTag::I64 => Value::I64(r.i64("i64")?),
        TypeTag::U8 => Value::U8(r.u8("u8")?),
        TypeTag::U16 => Value::U16(r.u16("u16")?),
        TypeTag::U32 => Value::U32(r.u32("u32")?),
        TypeTag::U64 => Value::U64(r.u64("u64")?),
        TypeTag::F32 => Value::F32(r.f32("f32")?),
        TypeTag::F64 => Value::F64(r.f64("f64")?),
        TypeTag::Bool => Value::Bool(r.u8("bool")? != 0),
        TypeTag::Char => Value::Char(r.u8("char")?),
        TypeTag::WChar => Value::WChar(r.u16("wchar")?),
        TypeTag::Iid => Value::Iid(InterfaceId::from_bytes(r.id16("iid")?)),
        TypeTag::CharStr => Value::Str(get_string(r, false, true)?),
        TypeTag::CString => Value::Str(get_string(r, false, false)?),
        TypeTag::WCharStr => Value::WStr(get_string(r, true, true)?),
        TypeTag::AString => Value::WStr(get_string(r, true, false)?),
        TypeTag::Interface(_) | TypeTag::InterfaceIs { .. } => {
            return Ok(Pending::Object(r.u64("object reference")?))
        }
        TypeTag::Array { .. } => return Err(Error::internal("array read as scalar")),
    };
    Ok(Pending::Ready(value))
}

fn check_arity(method: &MethodInfo, params: &[Value]) -> Result<()> {
    if method.params.len() != params.len() {
        return Err(Error::validation(format!(
            "{} takes {} params, got {}",
            method.name,
            method.params.len(),
            params.len()
        )));
    }
    Ok(())
}

fn carried<'a>(
    method: &'a MethodInfo,
    params: &'a [Value],
    side: Side,
) -> impl Iterator<Item = (&'a ParamInfo, &'a Value)> + 'a {
    method
        .params
        .iter()
        .zip(params)
        .filter(move |(info, _)| side.carries(info))
}

/// Serialize the params `side` carries.
pub fn write_params(
    out: &mut BytesMut,
    method: &MethodInfo,
    params: &[Value],
    side: Side,
    codec: &mut dyn ObjectCodec,
    limits: Limits,
) -> Result<()> {
    check_arity(method, params)?;

    for (info, value) in carried(method, params, side).filter(|(info, _)| !info.ty.is_array()) {
        write_value(out, info, &info.ty, value, params, codec)?;
    }

    for (info, value) in carried(method, params, side).filter(|(info, _)| info.ty.is_array()) {
        let TypeTag::Array { elem, .. } = &info.ty else {
            continue;
        };
        let (size, length) = array_bounds(&info.ty, params, limits)?;
        let Value::Array(items) = value else {
            return Err(mismatch(info, value));
        };
        let Some(items) = items else {
            out.put_u8(0);
            continue;
        };
        if items.len() < length {
            return Err(Error::validation(format!(
                "array {} holds {} elements, length is {}",
                info.name,
                items.len(),
                length
            )));
        }
        out.put_u8(1);
        for item in &items[..length] {
            write_value(out, info, elem, item, params, codec)?;
        }
        tracing::trace!("marshal: wrote {}/{} elements of {}", length, size, info.name);
    }
    Ok(())
}

/// Deserialize the params `side` carries into `params`, leaving the others
/// untouched.
pub(crate) fn read_params(
    r: &mut Reader,
    method: &MethodInfo,
    params: &mut [Value],
    side: Side,
    codec: &mut dyn ObjectCodec,
    limits: Limits,
) -> Result<()> {
    check_arity(method, params)?;
    // (param index, element index, raw reference)
    let mut objects: Vec<(usize, Option<usize>, u64)> = Vec::new();

    for (idx, info) in method.params.iter().enumerate() {
        if !side.carries(info) || info.ty.is_array() {
            continue;
        }
        match read_value(r, &info.ty)? {
            Pending::Ready(v) => params[idx] = v,
            Pending::Object(raw) => {
                params[idx] = Value::Object(None);
                objects.push((idx, None, raw));
            }
        }
    }

    for (idx, info) in method.params.iter().enumerate() {
        if !side.carries(info) || !info.ty.is_array() {
            continue;
        }
        let TypeTag::Array { elem, .. } = &info.ty else {
            continue;
        };
        let (size, length) = array_bounds(&info.ty, params, limits)?;
        if r.u8("array prefix")? == 0 {
            params[idx] = Value::Array(None);
            continue;
        }
        let mut items = Vec::with_capacity(length.min(r.remaining()));
        for pos in 0..length {
            match read_value(r, elem)? {
                Pending::Ready(v) => items.push(v),
                Pending::Object(raw) => {
                    items.push(Value::Object(None));
                    objects.push((idx, Some(pos), raw));
                }
            }
        }
        items.resize(size, Value::default_for(elem));
        params[idx] = Value::Array(Some(items));
    }

    for (idx, pos, raw) in objects {
        let ty = match (&method.params[idx].ty, pos) {
            (TypeTag::Array { elem, .. }, Some(_)) => elem.as_ref(),
            (ty, _) => ty,
        };
        let iid = iid_for(ty, params)?;
        let object = codec.decode_object(raw, &iid)?;
        match (pos, &mut params[idx]) {
            (None, slot) => *slot = Value::Object(object),
            (Some(pos), Value::Array(Some(items))) => {
                if let Some(slot) = items.get_mut(pos) {
                    *slot = Value::Object(object);
                }
            }
            _ => return Err(Error::internal("array slot vanished")),
        }
    }
    Ok(())
}
