// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # cilpatch
//!
//! A build-time patcher for compiled .NET modules. `cilpatch` finds calls to
//! `new System.IO.FileStream(string, FileMode)` in the types you name and rewrites them to
//! `new System.IO.FileStream(string, FileMode, FileAccess.Read)`, so that games and tools
//! packaged onto read-only filesystems stop failing when they open their data files.
//!
//! ## Features
//!
//! - **🎯 Exact overload matching** - Only the original two-parameter constructor is touched, so
//!   patching an already patched module changes nothing
//! - **🧮 Safe body editing** - Branch targets and exception clauses follow the instructions they
//!   name; short branches are widened when needed
//! - **🔗 Reference import** - The replacement constructor is resolved in the referenced
//!   assemblies and imported into the module, reusing existing references
//! - **📦 Real assemblies** - Reads PE32/PE32+ managed modules and writes edits into an appended
//!   section, leaving the original sections untouched
//! - **💾 Atomic output** - Results are staged next to the destination and renamed into place
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cilpatch::prelude::*;
//!
//! let request = FixFileStreamsRequest::new("Game.exe", vec!["Worker".to_string()])
//!     .with_output("Game.patched.exe");
//! let config = PatchConfig::default().with_search_dir("/usr/lib/mono/4.5");
//!
//! let report = fix_filestreams(&request, &config)?;
//! for method in &report.methods {
//!     println!("{}: {} call site(s)", method.name, method.call_sites);
//! }
//! # Ok::<(), cilpatch::Error>(())
//! ```
//!
//! ### Working with the two phases directly
//!
//! ```rust,no_run
//! use cilpatch::patch::{CtorRewrite, DirectoryResolver, Patcher};
//! use cilpatch::Module;
//!
//! let mut module = Module::from_file("Game.exe".as_ref())?;
//! let mut assemblies = DirectoryResolver::new(vec![".".into()]);
//! let mut patcher = Patcher::new(CtorRewrite::filestream_read_only(), &mut assemblies);
//!
//! let plan = patcher.plan(&module, &["Worker".to_string()])?;
//! println!("{} call site(s) in {} method(s)", plan.call_sites(), plan.methods.len());
//!
//! patcher.apply(&mut module, &plan)?;
//! module.save("Game.exe".as_ref())?;
//! # Ok::<(), cilpatch::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`prelude`] - Convenient re-exports of commonly used types
//! - [`assembly`] - CIL opcodes, instructions, decoding and encoding
//! - [`metadata`] - Tokens, signatures, method bodies, the module model and PE image I/O
//! - [`patch`] - The `fix-filestreams` walker, scanner, resolver and rewriter
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Standards Compliance
//!
//! The CLI header, metadata root, streams and tables, instruction encodings, method body
//! headers, exception clauses and signature blobs follow the **ECMA-335 specification**
//! (6th edition). The PE/COFF container is parsed with goblin.
//!
//! - [ECMA-335 Standard](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf) - Official CLI specification
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result):
//!
//! ```rust,no_run
//! use cilpatch::{patch::{fix_filestreams, FixFileStreamsRequest, PatchConfig}, Error};
//!
//! let request = FixFileStreamsRequest::new("Game.exe", vec!["Worker".to_string()]);
//! match fix_filestreams(&request, &PatchConfig::default()) {
//!     Ok(report) => println!("Rewrote {} call site(s)", report.call_sites),
//!     Err(Error::TypeNotResolved(name)) => println!("No referenced assembly defines {}", name),
//!     Err(e) => println!("Error: {}", e),
//! }
//! ```
#[macro_use]
pub(crate) mod error;

/// Byte sources, the bounds-checked parser and atomic output files
pub mod file;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use cilpatch::prelude::*;
///
/// let module = Module::from_file("Game.exe".as_ref())?;
/// println!("{} types", module.type_defs().len());
/// # Ok::<(), cilpatch::Error>(())
/// ```
pub mod prelude;

/// CIL instructions based on ECMA-335
///
/// - [`assembly::OpCode`] - The opcode table
/// - [`assembly::Instruction`] / [`assembly::Operand`] - Editable instructions with
///   index-based branch targets
/// - [`assembly::decode_stream`] / [`assembly::encode_stream`] - Conversion from and to IL bytes
pub mod assembly;

/// The module model: tokens, tables, signatures, method bodies, import and PE image I/O
pub mod metadata;

/// The `fix-filestreams` patch
pub mod patch;

/// `cilpatch` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cilpatch` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use cilpatch::{Error, Module};
///
/// match Module::from_file(std::path::Path::new("Game.exe")) {
///     Ok(module) => println!("Loaded {}", module.name()),
///     Err(Error::Empty) => println!("Empty file"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// The in-memory module, see [`metadata::module::Module`].
pub use metadata::module::Module;

/// Low-level file and memory parsing utilities.
///
/// # Example
///
/// ```rust
/// use cilpatch::Parser;
///
/// let data = [0x2A, 0x00, 0x00, 0x00];
/// let mut parser = Parser::new(&data);
/// assert_eq!(parser.read_le::<u32>()?, 0x2A);
/// # Ok::<(), cilpatch::Error>(())
/// ```
pub use file::{parser::Parser, File};
