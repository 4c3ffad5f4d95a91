//! Shared-directory credential channel
//!
//! Each key is a file in one directory (typically a network mount visible to
//! all instances). Writes go to a temp file in the same directory and are
//! renamed into place, which is atomic on POSIX filesystems, so readers never
//! see a half-written token.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::{validate_key, ChannelError, CredentialChannel};

/// Directory-backed object store
#[derive(Clone, Debug)]
pub struct FsChannel {
    dir: PathBuf,
}

impl FsChannel {
    /// Use `dir` as the store; it must already exist
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the objects
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ChannelError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

/// Map an I/O failure onto the channel contract
fn classify_io(key: &str, err: std::io::Error) -> ChannelError {
    match err.kind() {
        ErrorKind::NotFound => ChannelError::not_found(key),
        ErrorKind::PermissionDenied => ChannelError::access_denied(key, err.to_string()),
        _ => ChannelError::unavailable(key, err.to_string()),
    }
}

/// Write `blob` to `target` via a sibling temp file and an atomic rename
fn write_atomically(dir: &Path, target: &Path, blob: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".keel-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(blob)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CredentialChannel for FsChannel {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError> {
        let target = self.path_for(key)?;
        let dir = self.dir.clone();
        let data = blob.to_vec();
        let bytes = data.len();

        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &data))
            .await
            .map_err(|e| ChannelError::unavailable(key, format!("write task failed: {}", e)))?
            .map_err(|e| match e.kind() {
                // A missing store directory is an outage, not a missing key
                ErrorKind::NotFound => ChannelError::unavailable(key, e.to_string()),
                _ => classify_io(key, e),
            })?;

        debug!(dir = %self.dir.display(), key, bytes, "stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| classify_io(key, e))
    }

    fn locate(&self, key: &str) -> String {
        format!("file://{}", self.dir.join(key).display())
    }
}
