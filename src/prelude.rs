//! # cilpatch Prelude
//!
//! The types needed for the common tasks: loading a module, planning and applying the
//! `fix-filestreams` patch, and inspecting the result.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilpatch operations
pub use crate::Error;

/// The result type used throughout cilpatch
pub use crate::Result;

/// Low-level file parsing utilities
pub use crate::{File, Parser};

// ================================================================================================
// Module Model
// ================================================================================================

/// The in-memory module and its rows
pub use crate::metadata::{
    module::Module,
    tables::{AssemblyRef, AssemblyVersion, MemberRef, MethodDef, TypeDef, TypeRef},
};

/// Metadata token type for referencing table entries
pub use crate::metadata::token::Token;

/// Method bodies and exception clauses
pub use crate::metadata::method::{ExceptionHandler, MethodAttributes, MethodBody};

/// Signatures compared by full type names
pub use crate::metadata::signatures::{ConstructorRef, MethodSig, TypeSig};

// ================================================================================================
// Instructions
// ================================================================================================

/// Editable instructions
pub use crate::assembly::{Instruction, OpCode, Operand};

// ================================================================================================
// Patching
// ================================================================================================

/// Entry point, request and configuration
pub use crate::patch::{fix_filestreams, FixFileStreamsRequest, PatchConfig, PatchReport};

/// The two-phase patcher and assembly resolution
pub use crate::patch::{
    AssemblyResolver, CtorRewrite, DirectoryResolver, InMemoryResolver, PatchPlan, Patcher,
};
