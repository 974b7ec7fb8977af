//! Replace-with-backup file writer
//!
//! Content goes to `<file>.new` first. On commit the current file is moved to
//! `<file>.old` (best effort, it may not exist yet) and `<file>.new` is
//! renamed over `<file>`. At every instant the old content, the new content,
//! or both are present under one of the three names.

use crate::traits::StorageResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) struct AtomicWriter {
    new_path: PathBuf,
    old_path: PathBuf,
    final_path: PathBuf,
    file: File,
    committed: bool,
}

impl AtomicWriter {
    /// Start a replacement of `path`
    pub(crate) fn new<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let final_path = path.as_ref().to_path_buf();
        let new_path = Self::sibling(&final_path, ".new");
        let old_path = Self::sibling(&final_path, ".old");

        let file = Self::create(&new_path)?;

        Ok(Self {
            new_path,
            old_path,
            final_path,
            file,
            committed: false,
        })
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    /// Sync the new content and swap it into place
    ///
    /// A failure of the final rename is returned to the caller; the `.new`
    /// file is left behind since it may be the only copy of the content.
    pub(crate) fn commit(mut self) -> StorageResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;

        // Past this point the `.new` file must survive
        self.committed = true;

        if let Err(e) = fs::rename(&self.final_path, &self.old_path) {
            tracing::debug!(
                "No previous {} to back up: {}",
                self.final_path.display(),
                e
            );
        }
        fs::rename(&self.new_path, &self.final_path)?;

        Ok(())
    }

    #[cfg(unix)]
    fn create(path: &Path) -> std::io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;

        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
    }

    #[cfg(not(unix))]
    fn create(path: &Path) -> std::io::Result<File> {
        File::create(path)
    }

    fn sibling(final_path: &Path, suffix: &str) -> PathBuf {
        let mut name = final_path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.new_path);
        }
    }
}
