//! Parameter values passed through a method call.

use super::interface::TypeTag;
use super::object::ObjectRef;
use crate::types::InterfaceId;

/// One parameter slot. Out parameters start at [`Value::default_for`] and
/// are overwritten by the callee (or by the reply decoder on the caller side).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(u8),
    WChar(u16),
    Iid(InterfaceId),
    /// 8-bit string; `None` is the null string.
    Str(Option<String>),
    /// 16-bit string; `None` is the null string.
    WStr(Option<String>),
    Object(Option<ObjectRef>),
    Array(Option<Vec<Value>>),
}

impl Value {
    pub fn default_for(ty: &TypeTag) -> Value {
        match ty {
            TypeTag::I8 => Value::I8(0),
            TypeTag::I16 => Value::I16(0),
            TypeTag::I32 => Value::I32(0),
            TypeTag::I64 => Value::I64(0),
            TypeTag::U8 => Value::U8(0),
            TypeTag::U16 => Value::U16(0),
            TypeTag::U32 => Value::U32(0),
            TypeTag::U64 => Value::U64(0),
            TypeTag::F32 => Value::F32(0.0),
            TypeTag::F64 => Value::F64(0.0),
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Char => Value::Char(0),
            TypeTag::WChar => Value::WChar(0),
            TypeTag::Iid => Value::Iid(InterfaceId::from_u128(0)),
            TypeTag::CharStr => Value::Str(None),
            TypeTag::CString => Value::Str(Some(String::new())),
            TypeTag::WCharStr => Value::WStr(None),
            TypeTag::AString => Value::WStr(Some(String::new())),
            TypeTag::Interface(_) | TypeTag::InterfaceIs { .. } => Value::Object(None),
            TypeTag::Array { .. } => Value::Array(None),
        }
    }

    /// Shorthand for a non-null 8-bit string.
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Some(s.into()))
    }

    /// Shorthand for a non-null 16-bit string.
    pub fn wstr(s: impl Into<String>) -> Value {
        Value::WStr(Some(s.into()))
    }

    /// Integer value usable as an array count.
    pub fn as_count(&self) -> Option<u64> {
        match *self {
            Value::I8(v) => u64::try_from(v).ok(),
            Value::I16(v) => u64::try_from(v).ok(),
            Value::I32(v) => u64::try_from(v).ok(),
            Value::I64(v) => u64::try_from(v).ok(),
            Value::U8(v) => Some(u64::from(v)),
            Value::U16(v) => Some(u64::from(v)),
            Value::U32(v) => Some(u64::from(v)),
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(Some(s)) | Value::WStr(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_iid(&self) -> Option<InterfaceId> {
        match *self {
            Value::Iid(iid) => Some(iid),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(Some(obj)) => Some(obj),
            _ => None,
        }
    }

    pub fn take_object(&mut self) -> Option<ObjectRef> {
        match self {
            Value::Object(obj) => obj.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_nullability() {
        assert_eq!(Value::default_for(&TypeTag::CharStr), Value::Str(None));
        assert_eq!(Value::default_for(&TypeTag::AString), Value::wstr(""));
        assert_eq!(Value::default_for(&TypeTag::array(TypeTag::U8, 0)), Value::Array(None));
    }

    #[test]
    fn test_negative_count_is_rejected() {
        assert_eq!(Value::I32(-1).as_count(), None);
        assert_eq!(Value::U16(7).as_count(), Some(7));
        assert_eq!(Value::str("x").as_count(), None);
    }
}
