//! Interface descriptors.
//!
//! The marshaler needs, for every interface id, the ordered method table and
//! each parameter's shape and direction. Descriptors are registered up front
//! in an [`InterfaceCatalog`] (or supplied by any [`InterfaceRepository`]).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::exception;
use crate::types::{Error, InterfaceId, Result};

/// Wire shape of one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTag {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    /// 8-bit character.
    Char,
    /// 16-bit code unit.
    WChar,
    Iid,
    /// Nullable 8-bit string.
    CharStr,
    /// Nullable 16-bit string.
    WCharStr,
    /// Non-nullable 8-bit string.
    CString,
    /// Non-nullable 16-bit string.
    AString,
    /// Object reference of a fixed interface.
    Interface(InterfaceId),
    /// Object reference whose interface id is carried by another parameter.
    InterfaceIs { iid_arg: u8 },
    /// Array whose capacity (and optionally valid length) come from sibling
    /// integer parameters.
    Array {
        elem: Box<TypeTag>,
        size_is: u8,
        length_is: Option<u8>,
    },
}

impl TypeTag {
    pub fn array(elem: TypeTag, size_is: u8) -> Self {
        TypeTag::Array {
            elem: Box::new(elem),
            size_is,
            length_is: None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, TypeTag::Array { .. })
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, TypeTag::Interface(_) | TypeTag::InterfaceIs { .. })
    }

    fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeTag::I8
                | TypeTag::I16
                | TypeTag::I32
                | TypeTag::I64
                | TypeTag::U8
                | TypeTag::U16
                | TypeTag::U32
                | TypeTag::U64
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
    /// Out parameter holding the method's return value.
    Retval,
}

impl Direction {
    pub fn is_in(&self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn is_out(&self) -> bool {
        !matches!(self, Direction::In)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: String,
    pub ty: TypeTag,
    pub dir: Direction,
}

impl ParamInfo {
    pub fn new(name: impl Into<String>, ty: TypeTag, dir: Direction) -> Self {
        Self {
            name: name.into(),
            ty,
            dir,
        }
    }

    pub fn input(name: impl Into<String>, ty: TypeTag) -> Self {
        Self::new(name, ty, Direction::In)
    }

    pub fn output(name: impl Into<String>, ty: TypeTag) -> Self {
        Self::new(name, ty, Direction::Out)
    }

    pub fn retval(ty: TypeTag) -> Self {
        Self::new("_retval", ty, Direction::Retval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub params: Vec<ParamInfo>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamInfo) -> Self {
        self.params.push(param);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub iid: InterfaceId,
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

impl InterfaceInfo {
    pub fn new(iid: InterfaceId, name: impl Into<String>) -> Self {
        Self {
            iid,
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn method_at(&self, index: u16) -> Result<&MethodInfo> {
        self.methods.get(usize::from(index)).ok_or_else(|| {
            Error::validation(format!(
                "{} has no method {} ({} methods)",
                self.name,
                index,
                self.methods.len()
            ))
        })
    }

    /// Check that every sibling-parameter reference points at a parameter
    /// of the right shape.
    pub fn validate(&self) -> Result<()> {
        for method in &self.methods {
            let shape = |idx: u8| method.params.get(usize::from(idx)).map(|p| &p.ty);
            for param in &method.params {
                let bad = |what: &str| {
                    Error::validation(format!(
                        "{}::{} param {}: {}",
                        self.name, method.name, param.name, what
                    ))
                };
                match &param.ty {
                    TypeTag::InterfaceIs { iid_arg } => {
                        if shape(*iid_arg) != Some(&TypeTag::Iid) {
                            return Err(bad("iid_is must name an Iid parameter"));
                        }
                    }
                    TypeTag::Array {
                        size_is, length_is, ..
                    } => {
                        if !shape(*size_is).is_some_and(TypeTag::is_integer) {
                            return Err(bad("size_is must name an integer parameter"));
                        }
                        if let Some(len) = length_is {
                            if !shape(*len).is_some_and(TypeTag::is_integer) {
                                return Err(bad("length_is must name an integer parameter"));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Read-only lookup from interface id to descriptor.
pub trait InterfaceRepository: Send + Sync {
    fn interface(&self, iid: &InterfaceId) -> Option<Arc<InterfaceInfo>>;
}

/// In-memory interface repository. Always knows the exception interface.
pub struct InterfaceCatalog {
    interfaces: RwLock<HashMap<InterfaceId, Arc<InterfaceInfo>>>,
}

impl fmt::Debug for InterfaceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceCatalog")
            .field("interfaces", &self.interfaces.read().len())
            .finish()
    }
}

impl Default for InterfaceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceCatalog {
    pub fn new() -> Self {
        let catalog = Self {
            interfaces: RwLock::new(HashMap::new()),
        };
        let info = exception::exception_interface();
        catalog.interfaces.write().insert(info.iid, Arc::new(info));
        catalog
    }

    pub fn register(&self, info: InterfaceInfo) -> Result<()> {
        info.validate()?;
        tracing::debug!("interface catalog: registered {} ({})", info.name, info.iid);
        self.interfaces.write().insert(info.iid, Arc::new(info));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.interfaces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InterfaceRepository for InterfaceCatalog {
    fn interface(&self, iid: &InterfaceId) -> Option<Arc<InterfaceInfo>> {
        self.interfaces.read().get(iid).cloned()
    }
}
