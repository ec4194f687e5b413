//! Byte sources for module images and atomic output.
//!
//! A [`File`] owns the raw bytes of one PE image, either memory-mapped from disk
//! ([`physical::Physical`]) or held in an owned buffer ([`memory::Memory`]). Both backends
//! implement [`Backend`] so the loader never cares where the bytes came from. Loading a
//! `File` parses its PE headers with goblin and rejects images without a CLI header.
//!
//! [`output::Output`] is the write side: it stages data in a temporary file next to the
//! destination and atomically renames it into place on success.
//!
//! # Key Components
//!
//! - [`File`] - Loaded input bytes, their PE layout and the path they came from
//! - [`Backend`] - Bounds-checked access to the underlying data
//! - [`pe::PeLayout`] - Owned PE header summary and RVA mapping
//! - [`parser::Parser`] - Cursor-based reader over a byte slice
//! - [`io`] - Little-endian primitives and ECMA-335 compressed integers
//! - [`output::Output`] - Temp-file-and-rename writer

pub mod io;
mod memory;
pub mod output;
pub mod parser;
pub mod pe;
mod physical;

use std::path::{Path, PathBuf};

use memory::Memory;
use pe::PeLayout;
use physical::Physical;

use crate::{Error::Empty, Result};

/// Backend trait for file data sources.
///
/// Implementations provide bounds-checked access to the complete input.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// A loaded PE image.
///
/// The mapping is released as soon as the `File` is dropped, which the loader does once the
/// module graph has been decoded into owned structures. This keeps in-place patching safe:
/// nothing borrows from the input file while the output is renamed over it.
pub struct File {
    /// Source of the raw bytes
    data: Box<dyn Backend>,
    /// Parsed PE headers
    layout: PeLayout,
    /// Where the data came from, if it was loaded from disk
    path: Option<PathBuf>,
}

impl File {
    /// Memory-map and parse the PE image at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped,
    /// [`crate::Error::Empty`] for zero-length files, and the errors of
    /// [`PeLayout::parse`] if it is not a managed PE image.
    pub fn from_file(path: &Path) -> Result<File> {
        let physical = Physical::new(path)?;
        let mut file = File::load(physical)?;
        file.path = Some(path.to_path_buf());
        Ok(file)
    }

    /// Parse an owned buffer as a PE image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] if `data` is empty, and the errors of
    /// [`PeLayout::parse`] if it is not a managed PE image.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        File::load(Memory::new(data))
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let layout = PeLayout::parse(data.data())?;
        Ok(File {
            data: Box::new(data),
            layout,
            path: None,
        })
    }

    /// The parsed PE headers.
    #[must_use]
    pub fn layout(&self) -> &PeLayout {
        &self.layout
    }

    /// RVA and size of the CLI header.
    #[must_use]
    pub fn clr(&self) -> (u32, u32) {
        (self.layout.clr.virtual_address, self.layout.clr.size)
    }

    /// Convert an RVA to a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section maps `rva`.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        self.layout.rva_to_offset(rva)
    }

    /// The complete input data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// A bounds-checked slice of the input data.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the input.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Length of the input in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for an empty input.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The path the file was loaded from, `None` for in-memory data.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::tables::AssemblyVersion, Error, Module};
    use std::io::Write;

    fn image() -> Vec<u8> {
        Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll")
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn from_mem() {
        let data = image();
        let file = File::from_mem(data.clone()).unwrap();
        assert_eq!(file.len(), data.len());
        assert_eq!(file.data_slice(0, 2).unwrap(), b"MZ");
        assert!(file.path().is_none());

        let (clr_rva, clr_size) = file.clr();
        assert_eq!(clr_size, 72);
        let offset = file.rva_to_offset(clr_rva).unwrap();
        assert_eq!(file.data_slice(offset, 4).unwrap(), &[72, 0, 0, 0]);
    }

    #[test]
    fn from_mem_empty() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Error::Empty)));
    }

    #[test]
    fn from_mem_not_pe() {
        assert!(matches!(
            File::from_mem(b"\x7fELF\x02\x01".to_vec()),
            Err(Error::GoblinErr(_))
        ));
    }

    #[test]
    fn from_mem_without_cli_header() {
        let mut data = image();
        let file = File::from_mem(data.clone()).unwrap();
        let entry = file.layout().data_directory_offset(pe::DIRECTORY_CLR);
        data[entry..entry + 8].fill(0);

        assert!(matches!(
            File::from_mem(data),
            Err(Error::Malformed { message, .. }) if message.contains("CLR runtime header")
        ));
    }

    #[test]
    fn from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image()).unwrap();
        tmp.flush().unwrap();

        let file = File::from_file(tmp.path()).unwrap();
        assert_eq!(file.data(), image().as_slice());
        assert_eq!(file.path(), Some(tmp.path()));
    }

    #[test]
    fn from_file_missing() {
        let result = File::from_file(Path::new("/nonexistent/missing.dll"));
        assert!(matches!(result, Err(Error::FileError(_))));
    }
}
