//! Metadata streams.
//!
//! The metadata root lists the streams of a module; this crate reads and writes the
//! compressed table stream `#~` and the four heaps.
//!
//! - [`tablesheader::TablesStream`] - Row counts and raw rows of every table
//! - [`schema`] - Table ids, column layouts and coded indices
//! - [`heaps`] - `#Strings`, `#Blob`, `#GUID` and `#US` readers and builders
//!
//! # Reference
//! - ECMA-335 6th Edition, Partition II, Section 24.2 - Metadata physical layout

/// Heap readers and builders
pub mod heaps;
/// Table and column layouts
pub mod schema;
/// The `#~` stream
pub mod tablesheader;
