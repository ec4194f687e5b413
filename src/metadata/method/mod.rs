//! Method bodies and their flags.
//!
//! - [`MethodBody`] - Editable instruction sequence plus header fields
//! - [`ExceptionHandler`] - Try/handler ranges in instruction indices
//! - [`MethodAttributes`], [`MethodBodyFlags`], [`SectionFlags`] - Flag sets

mod body;
mod exceptions;
mod types;

pub use body::MethodBody;
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags, HandlerData};
pub use types::{MethodAttributes, MethodBodyFlags, SectionFlags};
