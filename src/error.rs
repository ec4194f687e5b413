use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every variant is fatal for a patch run: the engine never retries and never writes a
/// partially patched module. The CLI maps any of them to a non-zero exit status.
///
/// # Error Categories
///
/// ## Load Errors
/// - [`Error::Malformed`] - Corrupted or invalid module image, method body or signature
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of the input
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::NotSupported`] - Unsupported metadata layout or signature encoding
/// - [`Error::RecursionLimit`] - Signature or type nesting too deep
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - The PE container could not be parsed
///
/// ## Resolution Errors
/// - [`Error::TypeNotResolved`] - No referenced assembly defines the requested type
/// - [`Error::ConstructorNotFound`] - The type has no constructor with the exact signature
/// - [`Error::AmbiguousConstructor`] - More than one constructor matches the exact signature
/// - [`Error::InvalidToken`] - A metadata token points outside its table
///
/// ## Save Errors
/// - [`Error::WriteFailed`] - Output could not be written or moved into place
///
/// # Examples
///
/// ```rust,no_run
/// use cilpatch::{Error, Module};
///
/// match Module::from_file(std::path::Path::new("Game.dll")) {
///     Ok(module) => println!("Loaded {}", module.name()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be parsed.
    ///
    /// Includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the input.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type or encoding is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The PE container could not be parsed.
    ///
    /// Wraps failures of the goblin PE parser, which reads the headers, sections and data
    /// directories before any metadata is looked at.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Nesting in a signature or type hierarchy exceeded the given depth.
    #[error("Reached the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// None of the module's assembly references defines the requested type.
    ///
    /// The rewritten API is expected to live in one of the referenced assemblies, so this is
    /// treated as a configuration error rather than an empty match.
    #[error("Type '{0}' could not be resolved in any referenced assembly")]
    TypeNotResolved(String),

    /// The resolved type has no constructor with the requested exact signature.
    #[error("No constructor matching '{signature}' was found on '{type_name}'")]
    ConstructorNotFound {
        /// Full name of the type that was searched
        type_name: String,
        /// The exact signature that was requested
        signature: String,
    },

    /// More than one constructor carries the requested exact signature.
    #[error("Constructor signature '{0}' is ambiguous")]
    AmbiguousConstructor(String),

    /// A metadata token does not point at an existing row.
    #[error("Invalid metadata token - {0}")]
    InvalidToken(Token),

    /// The output file could not be written or moved into its final location.
    #[error("Failed to write output - {message}")]
    WriteFailed {
        /// Description of the failed step
        message: String,
    },
}
