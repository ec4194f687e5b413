//! Rows of the metadata tables a [`crate::Module`] holds.
//!
//! The shapes follow the ECMA-335 tables of the same names, with heap indices replaced by
//! owned strings and blobs.

use std::fmt;

use crate::metadata::{
    method::{MethodAttributes, MethodBody},
    token::Token,
};

/// Four-part assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AssemblyVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl AssemblyVersion {
    /// Creates a version from its four parts.
    #[must_use]
    pub fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        AssemblyVersion {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for AssemblyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// An external assembly this module depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRef {
    /// Simple assembly name, e.g. `mscorlib`
    pub name: String,
    /// Referenced version
    pub version: AssemblyVersion,
    /// `AssemblyFlags`, `PublicKey` (0x1) when `public_key_or_token` is a full key
    pub flags: u32,
    /// Public key token (8 bytes), full public key, or empty
    pub public_key_or_token: Vec<u8>,
    /// Culture, empty for neutral assemblies
    pub culture: String,
}

impl AssemblyRef {
    /// A culture-neutral reference without public key token.
    #[must_use]
    pub fn new(name: impl Into<String>, version: AssemblyVersion) -> Self {
        AssemblyRef {
            name: name.into(),
            version,
            flags: 0,
            public_key_or_token: Vec::new(),
            culture: String::new(),
        }
    }
}

/// A reference to a type defined elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// `AssemblyRef` token for top-level types, enclosing `TypeRef` token for nested ones
    pub resolution_scope: Token,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
}

/// A type defined in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// `TypeAttributes`
    pub flags: u32,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Base type (`TypeDef`, `TypeRef` or `TypeSpec`), `None` for interfaces and `<Module>`
    pub extends: Option<Token>,
    /// Enclosing type of a nested type
    pub enclosing: Option<Token>,
    pub(crate) nested: Vec<Token>,
    pub(crate) methods: Vec<Token>,
}

impl TypeDef {
    /// Types declared directly inside this one, in table order.
    #[must_use]
    pub fn nested_types(&self) -> &[Token] {
        &self.nested
    }

    /// Methods of this type, in table order.
    #[must_use]
    pub fn methods(&self) -> &[Token] {
        &self.methods
    }
}

/// A method defined in this module.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Declaring type
    pub owner: Token,
    /// Method attributes
    pub flags: MethodAttributes,
    /// `MethodImplAttributes`; the low two bits give the code type, 0 for IL
    pub impl_flags: u16,
    /// Method name
    pub name: String,
    /// Raw `MethodDefSig` blob
    pub signature: Vec<u8>,
    /// Body, absent for abstract, runtime and PInvoke methods
    pub body: Option<MethodBody>,
}

/// A reference to a method of another type, usually in another assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// `TypeRef`, `TypeDef` or `TypeSpec` token of the declaring type
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Raw `MethodRefSig` blob
    pub signature: Vec<u8>,
}
