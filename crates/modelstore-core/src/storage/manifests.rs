//! Manifest storage at `manifests/<algorithm>/<hex>`.

use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::manifest::Manifest;
use crate::storage::atomic::atomic_write_bytes;
use crate::storage::blobs::BlobStore;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persists raw manifests, refusing any whose blobs are not all present.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
    blobs: BlobStore,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>, blobs: BlobStore) -> Self {
        Self {
            root: root.into(),
            blobs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Persist `raw` under `digest`.
    ///
    /// Every layer and the config blob must already be in the blob store.
    /// `digest` is taken as given and not recomputed from `raw`.
    pub fn write(&self, digest: &Digest, raw: &[u8]) -> Result<()> {
        let manifest = Manifest::parse(raw)?;

        for blob in manifest.blob_digests() {
            if !self.blobs.has(&blob)? {
                return Err(StoreError::Integrity {
                    message: format!("manifest {} references missing blob {}", digest, blob),
                });
            }
        }

        atomic_write_bytes(&self.path(digest), raw)?;
        debug!("Wrote manifest {}", digest);
        Ok(())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    /// Raw manifest bytes.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::not_found(format!("manifest {}", digest))
            } else {
                StoreError::io_op("Failed to read manifest", e, &path)
            }
        })
    }

    pub fn read_manifest(&self, digest: &Digest) -> Result<Manifest> {
        Manifest::parse(&self.read(digest)?)
    }

    pub fn remove(&self, digest: &Digest) -> Result<()> {
        let path = self.path(digest);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::not_found(format!("manifest {}", digest))
            } else {
                StoreError::io_op("Failed to remove manifest", e, &path)
            }
        })?;
        debug!("Removed manifest {}", digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Descriptor;
    use crate::media::{MEDIA_TYPE_GGUF, MEDIA_TYPE_MODEL_CONFIG_V01};
    use tempfile::TempDir;

    fn manifest_for(config: &[u8], layer: &[u8]) -> Vec<u8> {
        let manifest = Manifest::new(
            Descriptor {
                media_type: MEDIA_TYPE_MODEL_CONFIG_V01.to_string(),
                size: config.len() as u64,
                digest: Digest::sha256_of(config),
            },
            vec![Descriptor {
                media_type: MEDIA_TYPE_GGUF.to_string(),
                size: layer.len() as u64,
                digest: Digest::sha256_of(layer),
            }],
        );
        serde_json::to_vec(&manifest).unwrap()
    }

    #[test]
    fn test_missing_layer_blocks_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path().join("blobs"));
        let manifests = ManifestStore::new(temp_dir.path().join("manifests"), blobs.clone());

        blobs
            .write(&Digest::sha256_of(b"{}"), &mut &b"{}"[..], None)
            .unwrap();
        let raw = manifest_for(b"{}", b"weights");
        let id = Digest::sha256_of(&raw);

        let err = manifests.write(&id, &raw).unwrap_err();
        assert!(matches!(err, StoreError::Integrity { .. }));
        assert!(!manifests.exists(&id));
    }

    #[test]
    fn test_missing_config_blocks_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path().join("blobs"));
        let manifests = ManifestStore::new(temp_dir.path().join("manifests"), blobs.clone());

        blobs
            .write(&Digest::sha256_of(b"weights"), &mut &b"weights"[..], None)
            .unwrap();
        let raw = manifest_for(b"{}", b"weights");
        let id = Digest::sha256_of(&raw);

        assert!(manifests.write(&id, &raw).is_err());
    }

    #[test]
    fn test_write_read_remove() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path().join("blobs"));
        let manifests = ManifestStore::new(temp_dir.path().join("manifests"), blobs.clone());

        for content in [&b"{}"[..], &b"weights"[..]] {
            blobs
                .write(&Digest::sha256_of(content), &mut &content[..], None)
                .unwrap();
        }
        let raw = manifest_for(b"{}", b"weights");
        let id = Digest::sha256_of(&raw);

        manifests.write(&id, &raw).unwrap();
        assert_eq!(manifests.read(&id).unwrap(), raw);
        assert_eq!(manifests.read_manifest(&id).unwrap().layers.len(), 1);

        manifests.remove(&id).unwrap();
        assert!(manifests.read(&id).unwrap_err().is_not_found());
        assert!(manifests.remove(&id).unwrap_err().is_not_found());
    }
}
