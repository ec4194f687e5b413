//! Atomic file output for patched module images.
//!
//! [`Output`] stages the serialized image in a temporary file created in the destination's
//! directory, then renames it over the destination once all bytes are written and synced.
//! Rename within one directory stays on one filesystem, so the destination is replaced
//! atomically: readers see either the old file or the complete new one.
//!
//! When the target already exists its permissions are carried over to the replacement, so
//! patching an executable in place keeps it executable.
//!
//! If anything fails before [`Output::finalize`] returns, the temporary file is removed when
//! the [`Output`] is dropped and the destination is left untouched. This is what makes the
//! in-place mode (input path equals output path) safe against crashes mid-write.
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use cilpatch::file::output::Output;
//!
//! let mut output = Output::create("Patched.dll")?;
//! output.write_all(b"MZ")?;
//! output.finalize()?;
//! # Ok::<(), cilpatch::Error>(())
//! ```

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::{Error, Result};

/// A staged output file that is atomically moved to its target on finalization.
pub struct Output {
    /// The temporary file holding the data written so far
    staging: NamedTempFile,

    /// The target path
    target_path: PathBuf,
}

impl Output {
    /// Creates a staging file for `target_path` in the same directory.
    ///
    /// # Errors
    /// Returns [`crate::Error::WriteFailed`] if the staging file cannot be created, for
    /// example because the target directory does not exist or is not writable.
    pub fn create<P: AsRef<Path>>(target_path: P) -> Result<Self> {
        let target_path = target_path.as_ref().to_path_buf();
        let directory = match target_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let staging = tempfile::Builder::new()
            .prefix(".cilpatch-")
            .suffix(".tmp")
            .tempfile_in(&directory)
            .map_err(|e| Error::WriteFailed {
                message: format!(
                    "Failed to create staging file in {}: {e}",
                    directory.display()
                ),
            })?;

        Ok(Self {
            staging,
            target_path,
        })
    }

    /// Appends `data` to the staging file.
    ///
    /// # Errors
    /// Returns [`crate::Error::WriteFailed`] if the write fails.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.staging
            .write_all(data)
            .map_err(|e| Error::WriteFailed {
                message: format!("Failed to write staging file: {e}"),
            })
    }

    /// Path of the staging file, which disappears once the output is finalized or dropped.
    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Gets the target path where the file will be placed.
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Syncs the staging file and renames it over the target path, keeping the permissions
    /// of an existing target.
    ///
    /// # Errors
    /// Returns [`crate::Error::WriteFailed`] if syncing, copying permissions or renaming
    /// fails. The staging file is
    /// removed in that case and the target is not modified.
    pub fn finalize(mut self) -> Result<()> {
        self.staging.flush().map_err(|e| Error::WriteFailed {
            message: format!("Failed to flush staging file: {e}"),
        })?;
        self.staging
            .as_file()
            .sync_all()
            .map_err(|e| Error::WriteFailed {
                message: format!("Failed to sync staging file: {e}"),
            })?;

        let target_path = self.target_path;
        if let Ok(metadata) = fs::metadata(&target_path) {
            fs::set_permissions(self.staging.path(), metadata.permissions()).map_err(|e| {
                Error::WriteFailed {
                    message: format!(
                        "Failed to copy permissions of {}: {e}",
                        target_path.display()
                    ),
                }
            })?;
        }

        self.staging
            .persist(&target_path)
            .map_err(|e| Error::WriteFailed {
                message: format!("Failed to move output to {}: {}", target_path.display(), e.error),
            })?;

        Ok(())
    }
}
