//! Memory-mapped object file output.
//!
//! [`Output`] creates the target file at its final size, maps it and hands out its contents
//! for writing. The file only survives if [`Output::finalize`] succeeds; dropping an
//! unfinalized output removes it, so an encoding error never leaves a truncated `.o` behind
//! for the linker to pick up.

use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A memory-mapped output file that is deleted unless finalized.
pub struct Output {
    /// The memory mapping of the target file
    mmap: MmapMut,

    /// The target path
    target_path: PathBuf,

    /// Whether the file has been finalized
    finalized: bool,
}

impl Output {
    /// Creates `target_path` with `size` zeroed bytes and maps it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WriteMmapFailed`] if the file cannot be created, sized or
    /// mapped.
    pub fn create<P: AsRef<Path>>(target_path: P, size: u64) -> Result<Self> {
        let target_path = target_path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target_path)
            .map_err(|e| Error::WriteMmapFailed {
                message: format!("Failed to create {}: {e}", target_path.display()),
            })?;

        file.set_len(size).map_err(|e| Error::WriteMmapFailed {
            message: format!("Failed to set file size: {e}"),
        })?;

        let mmap = match unsafe { MmapOptions::new().map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(&target_path);
                return Err(Error::WriteMmapFailed {
                    message: format!("Failed to create memory mapping: {e}"),
                });
            }
        };

        Ok(Self {
            mmap,
            target_path,
            finalized: false,
        })
    }

    /// The whole file contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    /// The path the file is written to.
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Flushes the mapping and keeps the file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WriteFinalizationFailed`] if the flush fails; the file is
    /// removed in that case.
    pub fn finalize(mut self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| Error::WriteFinalizationFailed {
                message: format!("Failed to flush {}: {e}", self.target_path.display()),
            })?;

        self.finalized = true;
        Ok(())
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = std::fs::remove_file(&self.target_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_finalized_file_survives() {
        let temp_dir = tempdir().unwrap();
        let target_path = temp_dir.path().join("CORSTA.o");

        let mut output = Output::create(&target_path, 16).unwrap();
        assert_eq!(output.as_mut_slice().len(), 16);
        output.as_mut_slice()[..4].copy_from_slice(b"\x7fELF");
        output.finalize().unwrap();

        let contents = std::fs::read(&target_path).unwrap();
        assert_eq!(contents.len(), 16);
        assert_eq!(&contents[..4], b"\x7fELF");
    }

    #[test]
    fn test_unfinalized_file_removed() {
        let temp_dir = tempdir().unwrap();
        let target_path = temp_dir.path().join("CORDYN.o");

        {
            let mut output = Output::create(&target_path, 64).unwrap();
            output.as_mut_slice()[0] = 1;
            assert!(target_path.exists());
        }

        assert!(!target_path.exists());
    }
}
