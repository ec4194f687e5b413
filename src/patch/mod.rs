//! The `fix-filestreams` patch.
//!
//! Games built against the .NET framework routinely open their data files with
//! `new FileStream(path, mode)`, which requests read/write access and fails once the files
//! live on a read-only filesystem. This module rewrites such calls, inside the types a
//! caller names, into `new FileStream(path, mode, FileAccess.Read)`.
//!
//! # Architecture
//!
//! - [`walker`] - Selects the methods of the named types and their nested types
//! - [`scanner`] - Finds `newobj` calls to the exact two-parameter constructor
//! - [`resolver`] - Locates referenced assemblies and the three-parameter constructor
//! - [`rewriter`] - Plans and applies the call-site rewrites
//! - [`config`] - Requests, engine options and the rewrite description
//!
//! [`fix_filestreams`] strings these together: load, plan, apply, save. Nothing is written
//! if any step fails, and the output replaces its destination atomically.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilpatch::patch::{fix_filestreams, FixFileStreamsRequest, PatchConfig};
//!
//! let request = FixFileStreamsRequest::new("Game.exe", vec!["Celeste.Settings".to_string()]);
//! let report = fix_filestreams(&request, &PatchConfig::default())?;
//! println!("{} call site(s) rewritten", report.call_sites);
//! # Ok::<(), cilpatch::Error>(())
//! ```

use std::path::PathBuf;

use log::info;

use crate::{metadata::module::Module, Error, Result};

pub mod config;
pub mod resolver;
pub mod rewriter;
pub mod scanner;
pub mod walker;

pub use config::{CtorRewrite, FixFileStreamsRequest, PatchConfig};
pub use resolver::{
    AssemblyResolver, DirectoryResolver, InMemoryResolver, MetadataIndex, ReferenceResolver,
};
pub use rewriter::{MethodPlan, PatchPlan, PatchedMethod, Patcher};
pub use scanner::{CallSite, Scanner};
pub use walker::{collect_methods, MethodWorklist};

/// Outcome of one [`fix_filestreams`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    /// Types visited, nested types included
    pub types_visited: usize,
    /// Methods with a body that were scanned
    pub methods_visited: usize,
    /// Methods with rewritten call sites
    pub methods: Vec<PatchedMethod>,
    /// Total rewritten call sites
    pub call_sites: usize,
    /// Destination of the patched module
    pub output: PathBuf,
    /// Whether the destination was written
    pub written: bool,
}

/// Patch `request.input` and write the result to `request.output_path()`.
///
/// The module is written even if nothing matched, in which case the output is identical to
/// the input. With [`PatchConfig::dry_run`] nothing is written.
///
/// # Errors
/// Returns an error if `request.types` is empty, if the input cannot be loaded, if the
/// replacement constructor cannot be resolved or if the output cannot be written. The
/// destination is untouched in every error case.
pub fn fix_filestreams(
    request: &FixFileStreamsRequest,
    config: &PatchConfig,
) -> Result<PatchReport> {
    if request.types.is_empty() {
        return Err(Error::Error("At least one type name is required".to_string()));
    }

    let mut module = Module::from_file(&request.input)?;
    let mut assemblies = DirectoryResolver::new(config.search_path(&request.input));
    let mut patcher = Patcher::new(CtorRewrite::filestream_read_only(), &mut assemblies);

    let plan = patcher.plan(&module, &request.types)?;
    let methods = patcher.apply(&mut module, &plan)?;
    let call_sites = plan.call_sites();

    let output = request.output_path().to_path_buf();
    if !config.dry_run {
        module.save(&output)?;
    }

    info!(
        "{}: rewrote {} call site(s) in {} of {} method(s){}",
        module.name(),
        call_sites,
        methods.len(),
        plan.methods_visited,
        if config.dry_run { " (dry run)" } else { "" }
    );

    Ok(PatchReport {
        types_visited: plan.types_visited,
        methods_visited: plan.methods_visited,
        methods,
        call_sites,
        output,
        written: !config.dry_run,
    })
}
