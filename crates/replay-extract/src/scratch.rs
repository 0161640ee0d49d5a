//! Temporary files removed on drop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{trace, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Unique name under `root` for this process.
pub(crate) fn unique_path(root: &Path, stem: &str, extension: Option<&str>) -> PathBuf {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let name = match extension {
        Some(ext) => format!("{stem}-{}-{id}.{ext}", std::process::id()),
        None => format!("{stem}-{}-{id}", std::process::id()),
    };
    root.join(name)
}

/// A file path deleted when dropped.
#[derive(Debug)]
pub(crate) struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "Removed scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove scratch file: {}", e),
        }
    }
}

/// A directory removed recursively when dropped.
#[derive(Debug)]
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub(crate) fn create(path: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "Removed scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove scratch directory: {}", e),
        }
    }
}
