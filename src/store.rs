use crate::error::{Result, StorageError};
use crate::frame::StorageHandle;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace, warn};

/// Content-addressed persistence for a single frame's encoded bytes, keyed
/// by sequence number. Pure I/O: no ordering logic lives here.
///
/// The backing directory is an ephemeral working area. It is cleared on
/// every reconfiguration and on session teardown, never resumed across
/// process restarts.
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    /// Open a frame store rooted at `dir`, creating the directory if needed.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreation {
                path: dir.clone(),
                source: e,
            })?;
        debug!("Opened frame store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one frame's encoded bytes, returning the handle that owns
    /// them from here on.
    pub async fn persist(&self, sequence: u64, bytes: &[u8]) -> Result<StorageHandle> {
        let path = self.frame_path(sequence);
        fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::Persist {
                sequence,
                source: e,
            })?;
        trace!("Persisted frame {} ({} bytes)", sequence, bytes.len());
        Ok(StorageHandle { sequence, path })
    }

    /// Load the encoded bytes behind a handle.
    pub async fn load(&self, handle: &StorageHandle) -> Result<Vec<u8>> {
        let bytes = fs::read(&handle.path)
            .await
            .map_err(|e| StorageError::Load {
                sequence: handle.sequence,
                source: e,
            })?;
        trace!("Loaded frame {} ({} bytes)", handle.sequence, bytes.len());
        Ok(bytes)
    }

    /// Delete the bytes behind a handle.
    ///
    /// Deleting a handle whose file is already gone is a logged no-op, never
    /// fatal: a handle is deleted at most once by construction, so a missing
    /// file only indicates a prior bulk clear.
    pub async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        match fs::remove_file(&handle.path).await {
            Ok(()) => {
                trace!("Deleted frame {}", handle.sequence);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Frame {} already deleted ({})",
                    handle.sequence,
                    handle.path.display()
                );
                Ok(())
            }
            Err(e) => Err(StorageError::Delete {
                sequence: handle.sequence,
                source: e,
            }
            .into()),
        }
    }

    /// Remove every file in the working directory, keeping the directory
    /// itself so subsequent persists need no re-setup.
    pub async fn clear(&self) -> Result<()> {
        clear_directory(&self.dir).await?;
        debug!("Cleared frame store at {}", self.dir.display());
        Ok(())
    }

    fn frame_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{:012}.frame", sequence))
    }
}

/// Recursively delete the contents of a directory, creating it if absent.
pub async fn clear_directory(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .await
            .map_err(|e| StorageError::Clear {
                path: dir.to_path_buf(),
                source: e,
            })?;
    }
    fs::create_dir_all(dir)
        .await
        .map_err(|e| StorageError::DirectoryCreation {
            path: dir.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path().join("frames")).await.unwrap();

        let handle = store.persist(7, b"frame bytes").await.unwrap();
        assert_eq!(handle.sequence, 7);

        let bytes = store.load(&handle).await.unwrap();
        assert_eq!(bytes, b"frame bytes");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path().join("frames")).await.unwrap();

        let handle = store.persist(1, b"x").await.unwrap();
        store.delete(&handle).await.unwrap();
        // Second delete of the same handle must succeed as a no-op
        store.delete(&handle).await.unwrap();
        assert!(store.load(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_empties_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path().join("frames")).await.unwrap();

        for seq in 0..5 {
            store.persist(seq, b"data").await.unwrap();
        }
        store.clear().await.unwrap();

        let mut entries = fs::read_dir(store.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        // Store remains usable after a clear
        store.persist(9, b"more").await.unwrap();
    }

    #[tokio::test]
    async fn test_handles_are_keyed_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path().join("frames")).await.unwrap();

        let a = store.persist(1, b"a").await.unwrap();
        let b = store.persist(2, b"b").await.unwrap();
        assert_ne!(a.path, b.path);

        store.delete(&a).await.unwrap();
        assert_eq!(store.load(&b).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_clear_directory_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not_yet_there");

        clear_directory(&target).await.unwrap();
        assert!(target.is_dir());
    }
}
