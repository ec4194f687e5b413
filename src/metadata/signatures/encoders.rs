//! Method signature blob encoding (ECMA-335 II.23.2.1).
//!
//! The reverse of [`crate::metadata::signatures::SignatureParser`]: type names are turned
//! back into module-local `TypeDefOrRef` coded indices through a caller-supplied callback,
//! which is where the importer creates the type references a signature needs.

use crate::{
    file::io::{push_compressed_uint, push_le},
    metadata::{
        signatures::{ElementType, MethodSig, SignatureFlags, TypeSig},
        token::{table, Token},
    },
    Error::NotSupported,
    Result,
};

/// Encode a method signature, asking `tokens` for the module-local token of every class and
/// value type name it mentions.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] for non-default calling conventions, or whatever
/// error `tokens` reports.
pub fn encode_method_signature(
    sig: &MethodSig,
    tokens: &mut dyn FnMut(&str) -> Result<Token>,
) -> Result<Vec<u8>> {
    if sig.flags.kind() != 0 {
        return Err(NotSupported);
    }

    let mut buffer = Vec::new();
    push_le(&mut buffer, sig.flags.bits());
    if sig.flags.contains(SignatureFlags::GENERIC) {
        push_compressed_uint(&mut buffer, sig.generic_param_count)?;
    }

    let param_count = u32::try_from(sig.params.len()).map_err(|_| NotSupported)?;
    push_compressed_uint(&mut buffer, param_count)?;

    encode_type(&sig.return_type, tokens, &mut buffer)?;
    for param in &sig.params {
        encode_type(param, tokens, &mut buffer)?;
    }

    Ok(buffer)
}

fn encode_type(
    sig: &TypeSig,
    tokens: &mut dyn FnMut(&str) -> Result<Token>,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    if let Some(element) = sig.primitive_element() {
        buffer.push(element as u8);
        return Ok(());
    }

    match sig {
        TypeSig::Class(name) => {
            buffer.push(ElementType::Class as u8);
            push_compressed_uint(buffer, encode_type_def_or_ref(tokens(name)?)?)?;
        }
        TypeSig::ValueType(name) => {
            buffer.push(ElementType::ValueType as u8);
            push_compressed_uint(buffer, encode_type_def_or_ref(tokens(name)?)?)?;
        }
        TypeSig::SzArray(inner) => {
            buffer.push(ElementType::SzArray as u8);
            encode_type(inner, tokens, buffer)?;
        }
        TypeSig::ByRef(inner) => {
            buffer.push(ElementType::ByRef as u8);
            encode_type(inner, tokens, buffer)?;
        }
        TypeSig::Ptr(inner) => {
            buffer.push(ElementType::Ptr as u8);
            encode_type(inner, tokens, buffer)?;
        }
        TypeSig::Var(index) => {
            buffer.push(ElementType::Var as u8);
            push_compressed_uint(buffer, *index)?;
        }
        TypeSig::MVar(index) => {
            buffer.push(ElementType::MVar as u8);
            push_compressed_uint(buffer, *index)?;
        }
        TypeSig::GenericInst { base, args } => {
            if !matches!(**base, TypeSig::Class(_) | TypeSig::ValueType(_)) {
                return Err(malformed_error!(
                    "Generic instantiation of non-class type {}",
                    base
                ));
            }

            buffer.push(ElementType::GenericInst as u8);
            encode_type(base, tokens, buffer)?;
            let arg_count = u32::try_from(args.len()).map_err(|_| NotSupported)?;
            push_compressed_uint(buffer, arg_count)?;
            for arg in args {
                encode_type(arg, tokens, buffer)?;
            }
        }
        _ => return Err(NotSupported),
    }

    Ok(())
}

/// Encode a TypeDef, TypeRef or TypeSpec token as a `TypeDefOrRef` coded index.
///
/// # Errors
/// Returns [`crate::Error::InvalidToken`] for tokens of any other table.
pub fn encode_type_def_or_ref(token: Token) -> Result<u32> {
    let tag = match token.table() {
        table::TYPE_DEF => 0,
        table::TYPE_REF => 1,
        table::TYPE_SPEC => 2,
        _ => return Err(crate::Error::InvalidToken(token)),
    };

    Ok(token.row() << 2 | tag)
}
