use std::fmt;

use bitflags::bitflags;
use strum::FromRepr;

/// Element type codes used in signature blobs (ECMA-335 II.23.1.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ElementType {
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    String = 0x0e,
    Ptr = 0x0f,
    ByRef = 0x10,
    ValueType = 0x11,
    Class = 0x12,
    Var = 0x13,
    Array = 0x14,
    GenericInst = 0x15,
    TypedByRef = 0x16,
    I = 0x18,
    U = 0x19,
    FnPtr = 0x1b,
    Object = 0x1c,
    SzArray = 0x1d,
    MVar = 0x1e,
    CModReqd = 0x1f,
    CModOpt = 0x20,
    Sentinel = 0x41,
    Pinned = 0x45,
}

bitflags! {
    /// Leading byte of a method signature.
    ///
    /// The low nibble holds the calling convention kind; only `DEFAULT` (0) is supported
    /// for rewriting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignatureFlags: u8 {
        /// Instance method, `this` is passed implicitly
        const HAS_THIS = 0x20;
        /// `this` is passed as an explicit first parameter
        const EXPLICIT_THIS = 0x40;
        /// The method has generic parameters; their count follows the flags byte
        const GENERIC = 0x10;
    }
}

impl SignatureFlags {
    /// Calling convention kind from the low nibble (0 = default, 5 = vararg).
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.bits() & 0x0F
    }
}

/// A type inside a signature, with class and value types referenced by full name.
///
/// Names use the `Namespace.Name` form, nested types `Namespace.Outer/Inner`, so two
/// signatures from different modules compare equal exactly when they describe the same
/// types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    I,
    U,
    Object,
    /// Reference type by full name
    Class(String),
    /// Value type by full name
    ValueType(String),
    /// Single-dimension, zero-based array
    SzArray(Box<TypeSig>),
    /// Managed reference (`ref T`)
    ByRef(Box<TypeSig>),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Generic parameter of the declaring type
    Var(u32),
    /// Generic parameter of the method
    MVar(u32),
    /// Instantiated generic type; `base` is always `Class` or `ValueType`
    GenericInst { base: Box<TypeSig>, args: Vec<TypeSig> },
}

impl TypeSig {
    /// Shorthand for a value type reference.
    pub fn value_type(full_name: impl Into<String>) -> Self {
        TypeSig::ValueType(full_name.into())
    }

    /// Shorthand for a class reference.
    pub fn class(full_name: impl Into<String>) -> Self {
        TypeSig::Class(full_name.into())
    }

    /// The element type code of a primitive, `None` for compound types.
    #[must_use]
    pub fn primitive_element(&self) -> Option<ElementType> {
        let element = match self {
            TypeSig::Void => ElementType::Void,
            TypeSig::Boolean => ElementType::Boolean,
            TypeSig::Char => ElementType::Char,
            TypeSig::I1 => ElementType::I1,
            TypeSig::U1 => ElementType::U1,
            TypeSig::I2 => ElementType::I2,
            TypeSig::U2 => ElementType::U2,
            TypeSig::I4 => ElementType::I4,
            TypeSig::U4 => ElementType::U4,
            TypeSig::I8 => ElementType::I8,
            TypeSig::U8 => ElementType::U8,
            TypeSig::R4 => ElementType::R4,
            TypeSig::R8 => ElementType::R8,
            TypeSig::String => ElementType::String,
            TypeSig::I => ElementType::I,
            TypeSig::U => ElementType::U,
            TypeSig::Object => ElementType::Object,
            _ => return None,
        };
        Some(element)
    }

    /// Every class or value type name this signature mentions, in encoding order.
    #[must_use]
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            TypeSig::Class(name) | TypeSig::ValueType(name) => names.push(name),
            TypeSig::SzArray(inner) | TypeSig::ByRef(inner) | TypeSig::Ptr(inner) => {
                inner.collect_names(names);
            }
            TypeSig::GenericInst { base, args } => {
                base.collect_names(names);
                for arg in args {
                    arg.collect_names(names);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => f.write_str("System.Void"),
            TypeSig::Boolean => f.write_str("System.Boolean"),
            TypeSig::Char => f.write_str("System.Char"),
            TypeSig::I1 => f.write_str("System.SByte"),
            TypeSig::U1 => f.write_str("System.Byte"),
            TypeSig::I2 => f.write_str("System.Int16"),
            TypeSig::U2 => f.write_str("System.UInt16"),
            TypeSig::I4 => f.write_str("System.Int32"),
            TypeSig::U4 => f.write_str("System.UInt32"),
            TypeSig::I8 => f.write_str("System.Int64"),
            TypeSig::U8 => f.write_str("System.UInt64"),
            TypeSig::R4 => f.write_str("System.Single"),
            TypeSig::R8 => f.write_str("System.Double"),
            TypeSig::String => f.write_str("System.String"),
            TypeSig::I => f.write_str("System.IntPtr"),
            TypeSig::U => f.write_str("System.UIntPtr"),
            TypeSig::Object => f.write_str("System.Object"),
            TypeSig::Class(name) | TypeSig::ValueType(name) => f.write_str(name),
            TypeSig::SzArray(inner) => write!(f, "{inner}[]"),
            TypeSig::ByRef(inner) => write!(f, "{inner}&"),
            TypeSig::Ptr(inner) => write!(f, "{inner}*"),
            TypeSig::Var(index) => write!(f, "!{index}"),
            TypeSig::MVar(index) => write!(f, "!!{index}"),
            TypeSig::GenericInst { base, args } => {
                write!(f, "{base}<")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(">")
            }
        }
    }
}

/// A method signature (`MethodDefSig` / `MethodRefSig`, default calling convention).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// The leading flags byte
    pub flags: SignatureFlags,
    /// Number of generic parameters, 0 unless `GENERIC` is set
    pub generic_param_count: u32,
    /// Return type
    pub return_type: TypeSig,
    /// Parameter types in declaration order
    pub params: Vec<TypeSig>,
}

impl MethodSig {
    /// Signature of an instance constructor: `instance void .ctor(params)`.
    #[must_use]
    pub fn constructor(params: Vec<TypeSig>) -> Self {
        MethodSig {
            flags: SignatureFlags::HAS_THIS,
            generic_param_count: 0,
            return_type: TypeSig::Void,
            params,
        }
    }

    /// Returns true for instance methods.
    #[must_use]
    pub fn has_this(&self) -> bool {
        self.flags.contains(SignatureFlags::HAS_THIS)
    }

    /// Parameter list formatted as `(A,B,C)`.
    #[must_use]
    pub fn param_list(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        format!("({})", params.join(","))
    }
}

/// A constructor identified by its declaring type and exact signature.
///
/// Two references are equal only if the declaring type and every parameter type match.
///
/// ```rust
/// use cilpatch::metadata::signatures::{ConstructorRef, TypeSig};
///
/// let ctor = ConstructorRef::new(
///     "System.IO.FileStream",
///     vec![TypeSig::String, TypeSig::value_type("System.IO.FileMode")],
/// );
/// assert_eq!(
///     ctor.to_string(),
///     "System.Void System.IO.FileStream::.ctor(System.String,System.IO.FileMode)"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstructorRef {
    /// Full name of the declaring type
    pub declaring_type: String,
    /// Constructor signature
    pub signature: MethodSig,
}

impl ConstructorRef {
    /// Instance constructor of `declaring_type` taking `params`.
    pub fn new(declaring_type: impl Into<String>, params: Vec<TypeSig>) -> Self {
        ConstructorRef {
            declaring_type: declaring_type.into(),
            signature: MethodSig::constructor(params),
        }
    }

    /// Parameter types in order.
    #[must_use]
    pub fn params(&self) -> &[TypeSig] {
        &self.signature.params
    }
}

impl fmt::Display for ConstructorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::.ctor{}",
            self.signature.return_type,
            self.declaring_type,
            self.signature.param_list()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_from_repr() {
        assert_eq!(ElementType::from_repr(0x0e), Some(ElementType::String));
        assert_eq!(ElementType::from_repr(0x11), Some(ElementType::ValueType));
        assert_eq!(ElementType::from_repr(0x17), None);
    }

    #[test]
    fn type_display() {
        let list = TypeSig::GenericInst {
            base: Box::new(TypeSig::class("System.Collections.Generic.List`1")),
            args: vec![TypeSig::SzArray(Box::new(TypeSig::U1))],
        };
        assert_eq!(
            list.to_string(),
            "System.Collections.Generic.List`1<System.Byte[]>"
        );
        assert_eq!(TypeSig::ByRef(Box::new(TypeSig::I4)).to_string(), "System.Int32&");
        assert_eq!(TypeSig::MVar(1).to_string(), "!!1");
    }

    #[test]
    fn referenced_names() {
        let sig = TypeSig::GenericInst {
            base: Box::new(TypeSig::class("Outer/Inner`1")),
            args: vec![TypeSig::value_type("System.IO.FileMode"), TypeSig::String],
        };
        assert_eq!(sig.referenced_names(), vec!["Outer/Inner`1", "System.IO.FileMode"]);
    }

    #[test]
    fn constructor_equality_is_exact() {
        let two = ConstructorRef::new(
            "System.IO.FileStream",
            vec![TypeSig::String, TypeSig::value_type("System.IO.FileMode")],
        );
        let class_mode = ConstructorRef::new(
            "System.IO.FileStream",
            vec![TypeSig::String, TypeSig::class("System.IO.FileMode")],
        );
        let three = ConstructorRef::new(
            "System.IO.FileStream",
            vec![
                TypeSig::String,
                TypeSig::value_type("System.IO.FileMode"),
                TypeSig::value_type("System.IO.FileAccess"),
            ],
        );

        assert_ne!(two, class_mode);
        assert_ne!(two, three);
        assert_eq!(two.clone(), two);
        assert!(two.signature.has_this());
    }
}
