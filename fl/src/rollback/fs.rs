//! Filesystem seam for the journal

use std::io;
use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

/// File operations the journal performs
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read a file as UTF-8, `None` if it does not exist
    async fn read(&self, path: &Path) -> io::Result<Option<String>>;

    /// Write a file, creating parent directories
    async fn write(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Remove a file; removing a missing file succeeds
    async fn remove(&self, path: &Path) -> io::Result<()>;

    async fn exists(&self, path: &Path) -> io::Result<bool>;
}

/// The real filesystem via `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read(&self, path: &Path) -> io::Result<Option<String>> {
        debug!(path = %path.display(), "LocalFileSystem::read: called");
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        debug!(path = %path.display(), "LocalFileSystem::write: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        debug!(path = %path.display(), "LocalFileSystem::remove: called");
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::try_exists(path).await
    }
}

/// SHA-256 of the content, lowercase hex
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
