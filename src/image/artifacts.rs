//! Intermediate build files and their removal.
//!
//! An image build leaves three core objects and a placement script in its work directory.
//! None of them are useful once the executable exists (or failed to), so every exit path has
//! to remove them. [`BuildArtifacts`] records each path as it is created and removes them all
//! on drop; [`cleanup`] does the same by name for a directory left behind by an earlier,
//! interrupted build.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use strum::IntoEnumIterator;

use super::CoreSection;
use crate::Result;

/// File name of the generated linker placement script.
pub const LINKER_SCRIPT: &str = "corespace.ld";

fn remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// Removes the core objects and the placement script from `dir`.
///
/// Files that do not exist are skipped.
///
/// # Errors
///
/// Returns the first removal failure other than a missing file, after attempting every file.
pub fn cleanup(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    let mut first_error = None;

    let names = CoreSection::iter()
        .map(CoreSection::file_name)
        .chain(std::iter::once(LINKER_SCRIPT.to_string()));

    for name in names {
        if let Err(error) = remove(&dir.join(name)) {
            first_error.get_or_insert(error);
        }
    }

    match first_error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// Every intermediate file of one image build, removed when dropped.
#[derive(Debug)]
pub struct BuildArtifacts {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    keep: bool,
}

impl BuildArtifacts {
    /// Starts tracking artifacts created in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BuildArtifacts {
            dir: dir.into(),
            paths: Vec::new(),
            keep: false,
        }
    }

    /// Keeps the files instead of removing them, for inspecting a failed link.
    #[must_use]
    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// The work directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records a created file.
    pub fn push(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// The recorded files in creation order.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for BuildArtifacts {
    fn drop(&mut self) {
        if self.keep {
            debug!("Keeping {} build artifacts in {}", self.paths.len(), self.dir.display());
            return;
        }

        for path in self.paths.drain(..) {
            if let Err(error) = remove(&path) {
                warn!("Failed to remove {}: {error}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cleanup_removes_known_files() {
        let dir = tempdir().unwrap();
        for name in ["CORRO.o", "CORSTA.o", LINKER_SCRIPT, "other.o"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        cleanup(dir.path()).unwrap();

        assert!(!dir.path().join("CORRO.o").exists());
        assert!(!dir.path().join("CORSTA.o").exists());
        assert!(!dir.path().join(LINKER_SCRIPT).exists());
        assert!(dir.path().join("other.o").exists());
    }

    #[test]
    fn test_cleanup_empty_dir() {
        let dir = tempdir().unwrap();
        cleanup(dir.path()).unwrap();
    }

    #[test]
    fn test_artifacts_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CORDYN.o");
        std::fs::write(&path, b"x").unwrap();

        {
            let mut artifacts = BuildArtifacts::new(dir.path());
            artifacts.push(&path);
            artifacts.push(dir.path().join("never-created.o"));
            assert_eq!(artifacts.paths().len(), 2);
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_artifacts_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CORDYN.o");
        std::fs::write(&path, b"x").unwrap();

        {
            let mut artifacts = BuildArtifacts::new(dir.path()).with_keep(true);
            artifacts.push(&path);
        }

        assert!(path.exists());
    }
}
