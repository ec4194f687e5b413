//! Patch requests and engine configuration.
//!
//! [`FixFileStreamsRequest`] is what a front end hands to the engine: which file to read,
//! where to write it and which types to visit. [`PatchConfig`] holds the knobs that do not
//! change what gets patched, only how assemblies are found and whether output is written.
//! [`CtorRewrite`] describes the call-site transformation itself.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::patch::{FixFileStreamsRequest, PatchConfig};
//!
//! let request = FixFileStreamsRequest::new("Game.dll", vec!["Worker".to_string()]);
//! assert_eq!(request.output_path(), request.input.as_path());
//!
//! let config = PatchConfig::default()
//!     .with_search_dir("/usr/lib/mono/4.5")
//!     .with_dry_run(true);
//! assert!(config.search_input_dir);
//! assert!(config.dry_run);
//! ```

use std::path::{Path, PathBuf};

use crate::{
    assembly::{Instruction, OpCode},
    metadata::signatures::{ConstructorRef, TypeSig},
};

/// One `fix-filestreams` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixFileStreamsRequest {
    /// Module to patch
    pub input: PathBuf,
    /// Destination, `None` to patch `input` in place
    pub output: Option<PathBuf>,
    /// Names of the types whose methods (and nested types' methods) are patched
    pub types: Vec<String>,
}

impl FixFileStreamsRequest {
    /// Patch `input` in place, visiting `types`.
    pub fn new(input: impl Into<PathBuf>, types: Vec<String>) -> Self {
        FixFileStreamsRequest {
            input: input.into(),
            output: None,
            types,
        }
    }

    /// Write the patched module to `output` instead of `input`.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Where the patched module is written.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        self.output.as_deref().unwrap_or(&self.input)
    }
}

/// Engine options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchConfig {
    /// Directories searched for referenced assemblies, in order
    pub search_dirs: Vec<PathBuf>,
    /// Search the input module's own directory before `search_dirs`
    pub search_input_dir: bool,
    /// Plan and report only; nothing is written
    pub dry_run: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            search_dirs: Vec::new(),
            search_input_dir: true,
            dry_run: false,
        }
    }
}

impl PatchConfig {
    /// Append a directory to the assembly search path.
    #[must_use]
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    /// Whether the input module's directory is searched.
    #[must_use]
    pub fn with_search_input_dir(mut self, enabled: bool) -> Self {
        self.search_input_dir = enabled;
        self
    }

    /// Enable or disable dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// The effective search path for a module loaded from `input`.
    #[must_use]
    pub fn search_path(&self, input: &Path) -> Vec<PathBuf> {
        let mut dirs = Vec::with_capacity(self.search_dirs.len() + 1);
        if self.search_input_dir {
            match input.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => dirs.push(parent.to_path_buf()),
                _ => dirs.push(PathBuf::from(".")),
            }
        }
        dirs.extend(self.search_dirs.iter().cloned());
        dirs
    }
}

/// A constructor call-site rewrite: calls to `original` get `argument` pushed as an extra
/// last argument and are redirected to the overload taking `replacement`.
#[derive(Debug, Clone, PartialEq)]
pub struct CtorRewrite {
    /// Full name of the type being constructed
    pub declaring_type: String,
    /// Exact parameter list of the calls to rewrite
    pub original: Vec<TypeSig>,
    /// Exact parameter list of the overload to call instead
    pub replacement: Vec<TypeSig>,
    /// Instruction pushing the additional argument
    pub argument: Instruction,
}

impl CtorRewrite {
    /// `new FileStream(path, mode)` to `new FileStream(path, mode, FileAccess.Read)`.
    #[must_use]
    pub fn filestream_read_only() -> Self {
        let mode = TypeSig::value_type("System.IO.FileMode");
        let access = TypeSig::value_type("System.IO.FileAccess");

        CtorRewrite {
            declaring_type: "System.IO.FileStream".to_string(),
            original: vec![TypeSig::String, mode.clone()],
            replacement: vec![TypeSig::String, mode, access],
            // FileAccess.Read
            argument: Instruction::simple(OpCode::LDC_I4_1),
        }
    }

    /// The constructor whose call sites are rewritten.
    #[must_use]
    pub fn original_ref(&self) -> ConstructorRef {
        ConstructorRef::new(self.declaring_type.clone(), self.original.clone())
    }

    /// The constructor the rewritten call sites invoke.
    #[must_use]
    pub fn replacement_ref(&self) -> ConstructorRef {
        ConstructorRef::new(self.declaring_type.clone(), self.replacement.clone())
    }
}
