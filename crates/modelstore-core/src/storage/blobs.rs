//! Content-addressed blob storage.
//!
//! Blobs live at `blobs/<algorithm>/<hex>`. A blob is written once through an
//! `.incomplete` sibling, verified against its digest and renamed into place.
//! Nothing is ever visible under the final name unless the full content was
//! received and matched.

use crate::config::StoreConfig;
use crate::digest::{ContentHasher, Digest};
use crate::error::{Result, StoreError};
use crate::storage::atomic::{sibling_with_suffix, write_then_rename};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Passive store of immutable blobs. Liveness is decided by the caller.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a blob store rooted at `root` (normally `<store>/blobs`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of a blob. The digest is pre-validated, so the path
    /// never escapes the blob root.
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    pub fn has(&self, digest: &Digest) -> Result<bool> {
        let path = self.path(digest);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io_op("Failed to stat blob", e, path)),
        }
    }

    /// Stream `reader` into the blob named `digest`.
    ///
    /// Returns `false` without touching the reader when the blob already
    /// exists. Cumulative byte counts go to `progress` with non-blocking sends;
    /// the final count is always delivered. Must run off the async runtime
    /// (inside `spawn_blocking`) when `progress` is set.
    pub fn write(
        &self,
        digest: &Digest,
        reader: &mut dyn Read,
        progress: Option<&mpsc::Sender<u64>>,
    ) -> Result<bool> {
        if self.has(digest)? {
            debug!("Blob {} already present, skipping write", digest);
            return Ok(false);
        }

        let path = self.path(digest);
        let incomplete = sibling_with_suffix(&path, StoreConfig::INCOMPLETE_SUFFIX);

        write_then_rename(&path, &incomplete, |file| {
            let mut hasher = ContentHasher::new(digest.algorithm());
            let mut buffer = vec![0u8; StoreConfig::COPY_CHUNK_SIZE];
            let mut written: u64 = 0;

            loop {
                let n = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(StoreError::Io {
                            message: format!("Failed to read content for blob {}: {}", digest, e),
                            path: Some(incomplete.clone()),
                            source: Some(e),
                        })
                    }
                };
                hasher.update(&buffer[..n]);
                file.write_all(&buffer[..n])
                    .map_err(|e| StoreError::io_op("Failed to write blob", e, &incomplete))?;
                written += n as u64;

                if let Some(tx) = progress {
                    let _ = tx.try_send(written);
                }
            }

            if let Some(tx) = progress {
                let _ = tx.blocking_send(written);
            }

            let actual = hasher.finalize();
            if &actual != digest {
                return Err(StoreError::Integrity {
                    message: format!(
                        "content of blob {} hashed to {} ({} bytes)",
                        digest, actual, written
                    ),
                });
            }
            Ok(())
        })?;

        debug!("Wrote blob {}", digest);
        Ok(true)
    }

    pub fn open(&self, digest: &Digest) -> Result<File> {
        let path = self.path(digest);
        File::open(&path).map_err(|e| self.missing_or_io(digest, e, &path))
    }

    pub fn size(&self, digest: &Digest) -> Result<u64> {
        let path = self.path(digest);
        fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| self.missing_or_io(digest, e, &path))
    }

    /// Delete a blob. Fails with `NotFound` if it does not exist.
    pub fn remove(&self, digest: &Digest) -> Result<()> {
        let path = self.path(digest);
        fs::remove_file(&path).map_err(|e| self.missing_or_io(digest, e, &path))?;
        debug!("Removed blob {}", digest);
        Ok(())
    }

    fn missing_or_io(&self, digest: &Digest, err: std::io::Error, path: &Path) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::not_found(format!("blob {}", digest))
        } else {
            StoreError::io_with_path(err, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Reader that yields some bytes then fails, like a dropped connection.
    struct BrokenReader {
        sent: bool,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ));
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"GGUF");
            Ok(4)
        }
    }

    /// Reader that panics if touched.
    struct UntouchableReader;

    impl Read for UntouchableReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            panic!("reader must not be consumed");
        }
    }

    fn store() -> (TempDir, BlobStore) {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path().join("blobs"));
        (temp_dir, blobs)
    }

    #[test]
    fn test_write_and_read_back() {
        let (_dir, blobs) = store();
        let data = b"weights".to_vec();
        let digest = Digest::sha256_of(&data);

        assert!(blobs.write(&digest, &mut Cursor::new(data.clone()), None).unwrap());
        assert!(blobs.has(&digest).unwrap());
        assert_eq!(blobs.size(&digest).unwrap(), data.len() as u64);
        assert_eq!(fs::read(blobs.path(&digest)).unwrap(), data);
        assert!(blobs
            .path(&digest)
            .ends_with(format!("sha256/{}", digest.hex())));
    }

    #[test]
    fn test_existing_blob_does_not_consume_reader() {
        let (_dir, blobs) = store();
        let digest = Digest::sha256_of(b"abc");
        blobs.write(&digest, &mut &b"abc"[..], None).unwrap();

        let written = blobs.write(&digest, &mut UntouchableReader, None).unwrap();
        assert!(!written);
    }

    #[test]
    fn test_failed_stream_leaves_no_blob() {
        let (_dir, blobs) = store();
        let digest = Digest::sha256_of(b"GGUF and more");

        let err = blobs
            .write(&digest, &mut BrokenReader { sent: false }, None)
            .unwrap_err();
        assert_eq!(err.kind(), "io");
        assert!(!blobs.has(&digest).unwrap());
        assert!(!sibling_with_suffix(&blobs.path(&digest), ".incomplete").exists());
    }

    #[test]
    fn test_hash_mismatch_is_integrity_error() {
        let (_dir, blobs) = store();
        let digest = Digest::sha256_of(b"expected");

        let err = blobs.write(&digest, &mut &b"tampered"[..], None).unwrap_err();
        assert!(matches!(err, StoreError::Integrity { .. }));
        assert!(!blobs.has(&digest).unwrap());
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let (_dir, blobs) = store();
        let digest = Digest::sha256_of(b"nothing");
        assert!(blobs.remove(&digest).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_final_count_is_delivered() {
        let (_dir, blobs) = store();
        let data = vec![7u8; 3 * 1024];
        let digest = Digest::sha256_of(&data);
        let (tx, mut rx) = mpsc::channel(1);

        let writer = tokio::task::spawn_blocking(move || {
            blobs.write(&digest, &mut Cursor::new(data), Some(&tx))
        });

        let mut last = 0;
        while let Some(n) = rx.recv().await {
            last = n;
        }
        assert!(writer.await.unwrap().unwrap());
        assert_eq!(last, 3 * 1024);
    }
}
