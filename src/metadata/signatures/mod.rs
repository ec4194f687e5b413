//! Method signatures.
//!
//! Signature blobs encode a method's calling convention, return type and parameter types
//! (ECMA-335 II.23.2). This module decodes them into [`MethodSig`] / [`TypeSig`] values in
//! which every class and value type is named by its full name, which makes signatures from
//! different modules directly comparable. [`ConstructorRef`] pairs such a signature with its
//! declaring type and is the unit of exact overload matching.
//!
//! Only the default calling convention and the element types that occur in ordinary
//! managed signatures are supported; multi-dimensional arrays, function pointers, custom
//! modifiers and similar encodings are rejected with [`crate::Error::NotSupported`].
//!
//! # References
//!
//! - ECMA-335 6th Edition, Partition II, Section 23.2 - Blobs and Signatures

mod encoders;
mod parser;
mod types;

pub use encoders::*;
pub use parser::*;
pub use types::*;

use crate::{metadata::token::Token, Result};

/// Parse a method signature blob, resolving type tokens through `names`.
///
/// # Errors
/// See [`SignatureParser::parse_method_signature`].
pub fn parse_method_signature(
    data: &[u8],
    names: &dyn Fn(Token) -> Result<String>,
) -> Result<MethodSig> {
    SignatureParser::new(data, names).parse_method_signature()
}
