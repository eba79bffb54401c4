//! Content storage with staged writes.
//!
//! Archives are written to a staging area and only moved into place
//! by `finish`; `discard` drops the staged file. The executor calls
//! `discard` on every open write when a title fails or is cancelled,
//! so a crash mid-title leaves stale staging files but never a
//! half-written archive in the content directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

/// Which storage root an archive lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTarget {
    Internal,
    Removable,
}

/// Destination for installed archives and tickets.
pub trait ContentStorage {
    /// Open a staged write for `name`.
    fn begin(&mut self, target: StorageTarget, name: &str) -> Result<()>;

    /// Append to an open staged write.
    fn write(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Move the staged file into its final location.
    fn finish(&mut self, name: &str) -> Result<()>;

    /// Drop the staged file.
    fn discard(&mut self, name: &str) -> Result<()>;

    /// Discard every write still open.
    fn discard_all(&mut self) -> Result<()>;
}

struct StagedFile {
    file: File,
    staging_path: PathBuf,
    final_path: PathBuf,
}

/// Directory-backed storage with one staging area per root.
pub struct DirStorage {
    internal_root: PathBuf,
    removable_root: Option<PathBuf>,
    open: HashMap<String, StagedFile>,
}

impl DirStorage {
    pub fn new(internal_root: impl Into<PathBuf>) -> Self {
        Self {
            internal_root: internal_root.into(),
            removable_root: None,
            open: HashMap::new(),
        }
    }

    pub fn with_removable(mut self, removable_root: impl Into<PathBuf>) -> Self {
        self.removable_root = Some(removable_root.into());
        self
    }

    fn root(&self, target: StorageTarget) -> &Path {
        match target {
            StorageTarget::Internal => &self.internal_root,
            // Falls back to the internal root when no removable
            // storage is mounted.
            StorageTarget::Removable => self
                .removable_root
                .as_deref()
                .unwrap_or(&self.internal_root),
        }
    }
}

impl ContentStorage for DirStorage {
    fn begin(&mut self, target: StorageTarget, name: &str) -> Result<()> {
        let root = self.root(target).to_path_buf();
        let staging_dir = root.join(".staging");
        fs::create_dir_all(&staging_dir)?;
        fs::create_dir_all(&root)?;

        let staging_path = staging_dir.join(name);
        let file = File::create(&staging_path)?;
        debug!(name, ?target, "staged write opened");
        self.open.insert(
            name.to_string(),
            StagedFile {
                file,
                staging_path,
                final_path: root.join(name),
            },
        );
        Ok(())
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let staged = self
            .open
            .get_mut(name)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no open write"))?;
        staged.file.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self, name: &str) -> Result<()> {
        let staged = self
            .open
            .remove(name)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no open write"))?;
        staged.file.sync_all()?;
        drop(staged.file);
        fs::rename(&staged.staging_path, &staged.final_path)?;
        debug!(name, "staged write finished");
        Ok(())
    }

    fn discard(&mut self, name: &str) -> Result<()> {
        if let Some(staged) = self.open.remove(name) {
            drop(staged.file);
            if let Err(err) = fs::remove_file(&staged.staging_path) {
                warn!(name, %err, "failed to remove staged file");
            }
        }
        Ok(())
    }

    fn discard_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.open.keys().cloned().collect();
        for name in names {
            self.discard(&name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn finish_moves_out_of_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::new(dir.path());

        storage.begin(StorageTarget::Internal, "a.nca").unwrap();
        storage.write("a.nca", b"hello ").unwrap();
        storage.write("a.nca", b"world").unwrap();
        assert!(!dir.path().join("a.nca").exists());

        storage.finish("a.nca").unwrap();
        assert_eq!(fs::read(dir.path().join("a.nca")).unwrap(), b"hello world");
        assert!(!dir.path().join(".staging/a.nca").exists());
    }

    #[test]
    fn discard_leaves_no_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::new(dir.path());

        storage.begin(StorageTarget::Internal, "b.nca").unwrap();
        storage.write("b.nca", &[0u8; 1024]).unwrap();
        storage.discard("b.nca").unwrap();

        assert!(!dir.path().join("b.nca").exists());
        assert!(!dir.path().join(".staging/b.nca").exists());
        // Double discard is harmless.
        storage.discard("b.nca").unwrap();
    }

    #[test]
    fn removable_target_uses_its_own_root() {
        let internal = tempfile::tempdir().unwrap();
        let removable = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::new(internal.path()).with_removable(removable.path());

        storage.begin(StorageTarget::Removable, "c.nca").unwrap();
        storage.write("c.nca", b"x").unwrap();
        storage.finish("c.nca").unwrap();

        assert!(removable.path().join("c.nca").exists());
        assert!(!internal.path().join("c.nca").exists());
    }

    #[test]
    fn discard_all_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::new(dir.path());
        storage.begin(StorageTarget::Internal, "d.nca").unwrap();
        storage.begin(StorageTarget::Internal, "e.nca").unwrap();
        storage.discard_all().unwrap();
        assert!(storage.write("d.nca", b"x").is_err());
    }
}
