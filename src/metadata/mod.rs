//! Metadata model of a managed module.
//!
//! This module holds everything the patcher knows about a module besides raw IL: the
//! metadata tables, tokens that point into them, method signatures and bodies, and the
//! physical metadata (CLI header, metadata root, `#~` tables and heaps) of the PE images
//! modules are loaded from and saved to.
//!
//! # Key Components
//!
//! - [`module::Module`] - The loaded module and its tables
//! - [`tables`] - Row types (`AssemblyRef`, `TypeRef`, `TypeDef`, `MethodDef`, `MemberRef`)
//! - [`token`] - Metadata table row references used throughout IL
//! - [`method`] - Method bodies with index-based branch targets and exception handlers
//! - [`signatures`] - Method signature decoding, encoding and exact comparison
//! - [`import`] - Adding references to another module's types and constructors
//! - [`image`] - Loading modules from PE images
//! - [`writer`] - Saving modules as PE images
//! - [`cor20header`], [`root`], [`streams`] - The physical metadata layout
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilpatch::Module;
//!
//! let module = Module::from_file("Game.dll".as_ref())?;
//! for type_token in module.top_level_types() {
//!     println!("{}", module.type_full_name(type_token)?);
//! }
//! # Ok::<(), cilpatch::Error>(())
//! ```

/// The CLI header
pub mod cor20header;
/// Module loading from PE images
pub mod image;
/// Importing types and constructors across modules
pub mod import;
/// Method bodies, exception handlers and method flags
pub mod method;
/// The in-memory module graph
pub mod module;
/// The metadata root and stream headers
pub mod root;
/// Method signatures
pub mod signatures;
/// The `#~` stream and the heaps
pub mod streams;
/// Metadata table rows
pub mod tables;
/// Commonly used metadata token type
pub mod token;
/// Module saving as PE images
pub mod writer;
