//! Artifact storage
//!
//! The output file an upload is reassembled into. [`ArtifactStore`] opens
//! artifacts by upload identifier, [`ArtifactHandle`] is the exclusively
//! owned, append-only view a session writes through.
//!
//! # Path derivation
//!
//! Identifiers are caller supplied, so [`LocalArtifactStore`] never uses them
//! as paths directly. Every byte outside `[A-Za-z0-9._-]` is percent-encoded,
//! and names consisting only of dots are encoded entirely. The mapping is
//! deterministic, injective (`%` itself is always encoded) and always yields a
//! single path component inside the upload directory.
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::upload::storage::{ArtifactStore, LocalArtifactStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalArtifactStore::new("./uploads")?;
//! let mut handle = store.create("photo.jpg").await?;
//! handle.append(b"hello").await?;
//! handle.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Characters kept verbatim in artifact file names
const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Backend that output artifacts are created in
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Path of the artifact for `identifier`
    fn artifact_path(&self, identifier: &str) -> PathBuf;

    /// Create the artifact, truncating any previous content
    async fn create(&self, identifier: &str) -> io::Result<Box<dyn ArtifactHandle>>;

    /// Remove the artifact. Missing artifacts are not an error.
    async fn discard(&self, identifier: &str) -> io::Result<()>;
}

/// Open output artifact, owned by exactly one upload session
#[async_trait]
pub trait ArtifactHandle: Send {
    fn path(&self) -> &Path;

    /// Append bytes at the current end of the artifact
    async fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Cut the artifact back to `len` bytes; later appends continue from there
    async fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Flush and close the artifact
    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// Derive the file name for an upload identifier
pub fn artifact_file_name(identifier: &str) -> String {
    if !identifier.is_empty() && identifier.bytes().all(|b| b == b'.') {
        return "%2E".repeat(identifier.len());
    }
    utf8_percent_encode(identifier, FILE_NAME_SET).to_string()
}

/// Artifacts stored as plain files in a local directory
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    sync_on_close: bool,
}

impl LocalArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sync_on_close: true,
        })
    }

    /// Whether closing an artifact also fsyncs it
    pub fn with_sync_on_close(mut self, sync: bool) -> Self {
        self.sync_on_close = sync;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn artifact_path(&self, identifier: &str) -> PathBuf {
        self.root.join(artifact_file_name(identifier))
    }

    async fn create(&self, identifier: &str) -> io::Result<Box<dyn ArtifactHandle>> {
        let path = self.artifact_path(identifier);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        tracing::debug!(path = %path.display(), "Created artifact");

        Ok(Box::new(LocalArtifact {
            path,
            file,
            sync_on_close: self.sync_on_close,
        }))
    }

    async fn discard(&self, identifier: &str) -> io::Result<()> {
        let path = self.artifact_path(identifier);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// File-backed artifact handle
pub struct LocalArtifact {
    path: PathBuf,
    file: File,
    sync_on_close: bool,
}

#[async_trait]
impl ArtifactHandle for LocalArtifact {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        // tokio completes writes on a blocking thread; wait for it
        self.file.flush().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(len).await?;
        self.file.seek(SeekFrom::Start(len)).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        let mut artifact = self;
        artifact.file.flush().await?;
        if artifact.sync_on_close {
            artifact.file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_keeps_safe_characters() {
        assert_eq!(artifact_file_name("a.bin"), "a.bin");
        assert_eq!(artifact_file_name("leaf_scan-01.JPG"), "leaf_scan-01.JPG");
    }

    #[test]
    fn test_file_name_cannot_escape_root() {
        assert_eq!(artifact_file_name("../etc/passwd"), "..%2Fetc%2Fpasswd");
        assert_eq!(artifact_file_name(".."), "%2E%2E");
        assert_eq!(artifact_file_name("."), "%2E");
    }

    #[test]
    fn test_file_name_is_collision_free_for_percent() {
        assert_ne!(artifact_file_name("a/b"), artifact_file_name("a%2Fb"));
        assert_eq!(artifact_file_name("a%2Fb"), "a%252Fb");
    }

    #[tokio::test]
    async fn test_create_append_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();

        let mut handle = store.create("a.bin").await.unwrap();
        handle.append(b"AAA").await.unwrap();
        handle.append(b"BB").await.unwrap();
        let path = handle.path().to_path_buf();
        handle.close().await.unwrap();

        assert_eq!(path, dir.path().join("a.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), b"AAABB");
    }

    #[tokio::test]
    async fn test_create_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.bin"), b"stale content").unwrap();

        let mut handle = store.create("a.bin").await.unwrap();
        handle.append(b"new").await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_truncate_rewinds_write_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap().with_sync_on_close(false);

        let mut handle = store.create("t.bin").await.unwrap();
        handle.append(b"keep").await.unwrap();
        handle.append(b"garbage").await.unwrap();
        handle.truncate(4).await.unwrap();
        handle.append(b"-tail").await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("t.bin")).unwrap(), b"keep-tail");
    }

    #[tokio::test]
    async fn test_discard_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();
        store.discard("never-created").await.unwrap();
    }

    #[test]
    fn test_new_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("uploads");
        let store = LocalArtifactStore::new(&root).unwrap();
        assert!(store.root().is_dir());
    }
}
