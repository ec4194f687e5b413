use super::Backend;
use crate::{
    Error::{Empty, Error, FileError, OutOfBounds},
    Result,
};

use memmap2::Mmap;
use std::{fs, path::Path};

/// A file backend that memory-maps a module image from disk.
///
/// The mapping is read-only. The file handle is released together with the mapping when
/// the backend is dropped.
#[derive(Debug)]
pub struct Physical {
    /// Memory-mapped file data
    data: Mmap,
}

impl Physical {
    /// Create a new physical file backend by memory-mapping the specified file.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened,
    /// [`crate::Error::Empty`] for zero-length files and [`crate::Error::Error`] if memory
    /// mapping fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) => return Err(FileError(error)),
        };

        // Zero-length files cannot be mapped on every platform
        if file.metadata()?.len() == 0 {
            return Err(Empty);
        }

        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(Error(error.to_string())),
        };

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn physical() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00]).unwrap();
        tmp.flush().unwrap();

        let physical = Physical::new(tmp.path()).unwrap();
        assert_eq!(physical.len(), 6);
        assert_eq!(physical.data_slice(0, 4).unwrap(), b"MZ\x90\x00");
        assert!(physical.data_slice(4, 3).is_err());
    }

    #[test]
    fn test_physical_invalid_file_path() {
        let result = Physical::new(Path::new("/nonexistent/path/to/file.dll"));
        assert!(matches!(result, Err(FileError(_))));
    }
}
