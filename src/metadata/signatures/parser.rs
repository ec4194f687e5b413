use crate::{
    file::parser::Parser,
    metadata::{
        signatures::{ElementType, MethodSig, SignatureFlags, TypeSig},
        token::{table, Token},
    },
    Error::{NotSupported, RecursionLimit},
    Result,
};

/// Maximum nesting depth of a single type in a signature
const MAX_RECURSION_DEPTH: usize = 50;

/// Parser for method signature blobs.
///
/// Class and value type references in the blob are `TypeDefOrRef` coded indices that only
/// mean something inside the owning module. The parser hands each decoded token to a
/// caller-supplied resolver and stores the returned full name instead.
///
/// # Example
///
/// ```rust
/// use cilpatch::metadata::signatures::{SignatureParser, TypeSig};
/// use cilpatch::metadata::token::Token;
///
/// // instance void (string, valuetype [TypeRef 2])
/// let blob = [0x20, 0x02, 0x01, 0x0E, 0x11, 0x09];
/// let names = |token: Token| -> cilpatch::Result<String> { Ok(format!("Type{}", token.row())) };
///
/// let sig = SignatureParser::new(&blob, &names).parse_method_signature()?;
/// assert_eq!(sig.params, vec![TypeSig::String, TypeSig::value_type("Type2")]);
/// # Ok::<(), cilpatch::Error>(())
/// ```
pub struct SignatureParser<'a> {
    parser: Parser<'a>,
    names: &'a dyn Fn(Token) -> Result<String>,
    depth: usize,
}

impl<'a> SignatureParser<'a> {
    /// Create a parser over `data`, resolving type tokens through `names`.
    #[must_use]
    pub fn new(data: &'a [u8], names: &'a dyn Fn(Token) -> Result<String>) -> Self {
        SignatureParser {
            parser: Parser::new(data),
            names,
            depth: 0,
        }
    }

    /// Parse a `MethodDefSig` / `MethodRefSig` with the default calling convention.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] for vararg and unmanaged calling conventions or
    /// element types outside the supported set, and [`crate::Error::Malformed`] or
    /// [`crate::Error::OutOfBounds`] for damaged blobs.
    pub fn parse_method_signature(&mut self) -> Result<MethodSig> {
        let flags = SignatureFlags::from_bits_retain(self.parser.read_le::<u8>()?);
        if flags.kind() != 0 {
            return Err(NotSupported);
        }

        let generic_param_count = if flags.contains(SignatureFlags::GENERIC) {
            self.parser.read_compressed_uint()?
        } else {
            0
        };

        let param_count = self.parser.read_compressed_uint()? as usize;
        if param_count > self.parser.remaining() {
            return Err(malformed_error!(
                "Signature declares {} parameters in {} bytes",
                param_count,
                self.parser.remaining()
            ));
        }

        let return_type = self.parse_type()?;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(self.parse_type()?);
        }

        if self.parser.has_more_data() {
            return Err(malformed_error!(
                "Trailing data after method signature at offset {}",
                self.parser.pos()
            ));
        }

        Ok(MethodSig {
            flags,
            generic_param_count,
            return_type,
            params,
        })
    }

    fn parse_type(&mut self) -> Result<TypeSig> {
        self.depth += 1;
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let byte = self.parser.read_le::<u8>()?;
        let Some(element) = ElementType::from_repr(byte) else {
            return Err(malformed_error!("Invalid element type - 0x{:02x}", byte));
        };

        let parsed = match element {
            ElementType::Void => TypeSig::Void,
            ElementType::Boolean => TypeSig::Boolean,
            ElementType::Char => TypeSig::Char,
            ElementType::I1 => TypeSig::I1,
            ElementType::U1 => TypeSig::U1,
            ElementType::I2 => TypeSig::I2,
            ElementType::U2 => TypeSig::U2,
            ElementType::I4 => TypeSig::I4,
            ElementType::U4 => TypeSig::U4,
            ElementType::I8 => TypeSig::I8,
            ElementType::U8 => TypeSig::U8,
            ElementType::R4 => TypeSig::R4,
            ElementType::R8 => TypeSig::R8,
            ElementType::String => TypeSig::String,
            ElementType::I => TypeSig::I,
            ElementType::U => TypeSig::U,
            ElementType::Object => TypeSig::Object,
            ElementType::Class => TypeSig::Class(self.parse_type_name()?),
            ElementType::ValueType => TypeSig::ValueType(self.parse_type_name()?),
            ElementType::SzArray => TypeSig::SzArray(Box::new(self.parse_type()?)),
            ElementType::ByRef => TypeSig::ByRef(Box::new(self.parse_type()?)),
            ElementType::Ptr => TypeSig::Ptr(Box::new(self.parse_type()?)),
            ElementType::Var => TypeSig::Var(self.parser.read_compressed_uint()?),
            ElementType::MVar => TypeSig::MVar(self.parser.read_compressed_uint()?),
            ElementType::GenericInst => {
                let peek = self.parser.peek_byte()?;
                if peek != ElementType::Class as u8 && peek != ElementType::ValueType as u8 {
                    return Err(malformed_error!(
                        "GENERICINST - Next byte is not CLASS or VALUETYPE - 0x{:02x}",
                        peek
                    ));
                }

                let base = self.parse_type()?;
                let arg_count = self.parser.read_compressed_uint()? as usize;
                if arg_count > self.parser.remaining() {
                    return Err(malformed_error!(
                        "GENERICINST declares {} arguments",
                        arg_count
                    ));
                }

                let mut args = Vec::with_capacity(arg_count);
                for _ in 0..arg_count {
                    args.push(self.parse_type()?);
                }

                TypeSig::GenericInst {
                    base: Box::new(base),
                    args,
                }
            }
            ElementType::Array
            | ElementType::TypedByRef
            | ElementType::FnPtr
            | ElementType::CModReqd
            | ElementType::CModOpt
            | ElementType::Sentinel
            | ElementType::Pinned => return Err(NotSupported),
        };

        self.depth -= 1;
        Ok(parsed)
    }

    fn parse_type_name(&mut self) -> Result<String> {
        let token = decode_type_def_or_ref(self.parser.read_compressed_uint()?)?;
        (self.names)(token)
    }
}

/// Decode a `TypeDefOrRef` coded index (ECMA-335 II.24.2.6) into a token.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for the unused tag value 3.
pub fn decode_type_def_or_ref(coded: u32) -> Result<Token> {
    let table = match coded & 0x3 {
        0 => table::TYPE_DEF,
        1 => table::TYPE_REF,
        2 => table::TYPE_SPEC,
        _ => return Err(malformed_error!("Invalid TypeDefOrRef tag - {}", coded)),
    };

    Ok(Token::from_parts(table, coded >> 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn names(token: Token) -> Result<String> {
        match (token.table(), token.row()) {
            (table::TYPE_REF, 1) => Ok("System.IO.FileStream".to_string()),
            (table::TYPE_REF, 2) => Ok("System.IO.FileMode".to_string()),
            (table::TYPE_DEF, 3) => Ok("Game.Worker/Job".to_string()),
            _ => Err(Error::InvalidToken(token)),
        }
    }

    fn parse(data: &[u8]) -> Result<MethodSig> {
        SignatureParser::new(data, &names).parse_method_signature()
    }

    #[test]
    fn parse_filestream_ctor() {
        let sig = parse(&[0x20, 0x02, 0x01, 0x0E, 0x11, 0x09]).unwrap();
        assert!(sig.has_this());
        assert_eq!(sig.return_type, TypeSig::Void);
        assert_eq!(
            sig.params,
            vec![TypeSig::String, TypeSig::value_type("System.IO.FileMode")]
        );
    }

    #[test]
    fn parse_compound_types() {
        // static Job M<T>(int32[], string&, !!0, FileStream<object>)
        let blob = [
            0x10, 0x01, 0x04, 0x12, 0x0C, 0x1D, 0x08, 0x10, 0x0E, 0x1E, 0x00, 0x15, 0x12, 0x05,
            0x01, 0x1C,
        ];
        let sig = parse(&blob).unwrap();

        assert!(!sig.has_this());
        assert_eq!(sig.generic_param_count, 1);
        assert_eq!(sig.return_type, TypeSig::class("Game.Worker/Job"));
        assert_eq!(
            sig.params,
            vec![
                TypeSig::SzArray(Box::new(TypeSig::I4)),
                TypeSig::ByRef(Box::new(TypeSig::String)),
                TypeSig::MVar(0),
                TypeSig::GenericInst {
                    base: Box::new(TypeSig::class("System.IO.FileStream")),
                    args: vec![TypeSig::Object],
                },
            ]
        );
    }

    #[test]
    fn parse_unsupported() {
        // vararg calling convention
        assert!(matches!(parse(&[0x05, 0x00, 0x01]), Err(Error::NotSupported)));
        // typedbyref parameter
        assert!(matches!(
            parse(&[0x00, 0x01, 0x01, 0x16]),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn parse_malformed() {
        assert!(matches!(parse(&[0x00, 0x00, 0x17]), Err(Error::Malformed { .. })));
        assert!(matches!(parse(&[0x20, 0x01, 0x01]), Err(Error::OutOfBounds)));
        assert!(matches!(
            parse(&[0x00, 0x00, 0x01, 0x00]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            parse(&[0x00, 0x00, 0x12, 0x07]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn parse_recursion_limit() {
        let mut blob = vec![0x00, 0x00];
        blob.extend(std::iter::repeat(0x1D).take(60));
        blob.push(0x08);
        assert!(matches!(parse(&blob), Err(Error::RecursionLimit(_))));
    }

    #[test]
    fn unresolvable_token() {
        assert!(matches!(
            parse(&[0x20, 0x01, 0x01, 0x12, 0x11]),
            Err(Error::InvalidToken(_))
        ));
    }
}
