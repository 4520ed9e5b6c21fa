//! Read accessor for a model in the store.

use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::image::{FileLayer, ModelImage, ModelLayer};
use crate::manifest::{ConfigFile, Descriptor, Manifest, ModelConfig, ModelDescriptor};
use crate::media::{Format, LayerKind};
use crate::storage::blobs::BlobStore;
use crate::storage::manifests::ManifestStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A manifest layer resolved to its blob on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLayer {
    pub descriptor: Descriptor,
    pub kind: LayerKind,
    pub path: PathBuf,
}

/// A stored model: its manifest, parsed config and resolved layers.
#[derive(Debug, Clone)]
pub struct Model {
    id: Digest,
    tags: Vec<String>,
    raw_manifest: Vec<u8>,
    manifest: Manifest,
    raw_config: Vec<u8>,
    config_file: ConfigFile,
    layers: Vec<StoredLayer>,
}

impl Model {
    pub(crate) fn load(
        blobs: &BlobStore,
        manifests: &ManifestStore,
        id: Digest,
        tags: Vec<String>,
    ) -> Result<Self> {
        let raw_manifest = manifests.read(&id)?;
        let manifest = Manifest::parse(&raw_manifest)?;

        let config_path = blobs.path(&manifest.config.digest);
        let raw_config = fs::read(&config_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::Integrity {
                    message: format!(
                        "config blob {} of model {} is missing",
                        manifest.config.digest, id
                    ),
                }
            } else {
                StoreError::io_op("Failed to read config blob", e, &config_path)
            }
        })?;
        let config_file = ConfigFile::parse(&raw_config)?;

        let layers = manifest
            .layers
            .iter()
            .map(|descriptor| StoredLayer {
                kind: descriptor.kind(),
                path: blobs.path(&descriptor.digest),
                descriptor: descriptor.clone(),
            })
            .collect();

        Ok(Self {
            id,
            tags,
            raw_manifest,
            manifest,
            raw_config,
            config_file,
            layers,
        })
    }

    pub fn id(&self) -> &Digest {
        &self.id
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn raw_manifest_bytes(&self) -> &[u8] {
        &self.raw_manifest
    }

    pub fn config_file(&self) -> &ConfigFile {
        &self.config_file
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config_file.config
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.config_file.descriptor
    }

    pub fn layers(&self) -> &[StoredLayer] {
        &self.layers
    }

    /// Total size of all layers in bytes.
    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.descriptor.size).sum()
    }

    /// Weight format, from the config or else from the first weights layer.
    pub fn format(&self) -> Option<Format> {
        self.config().format.or_else(|| {
            self.layers.iter().find_map(|l| match l.kind {
                LayerKind::Weights(format) => Some(format),
                _ => None,
            })
        })
    }

    fn paths_of(&self, kind: &LayerKind) -> Vec<PathBuf> {
        self.layers
            .iter()
            .filter(|l| l.kind == *kind)
            .map(|l| l.path.clone())
            .collect()
    }

    fn first_path_of(&self, kind: &LayerKind) -> Option<&Path> {
        self.layers
            .iter()
            .find(|l| l.kind == *kind)
            .map(|l| l.path.as_path())
    }

    /// GGUF weight blobs in manifest (shard) order.
    pub fn gguf_paths(&self) -> Vec<PathBuf> {
        self.paths_of(&LayerKind::Weights(Format::Gguf))
    }

    pub fn safetensors_paths(&self) -> Vec<PathBuf> {
        self.paths_of(&LayerKind::Weights(Format::Safetensors))
    }

    pub fn mmproj_path(&self) -> Option<&Path> {
        self.first_path_of(&LayerKind::Projector)
    }

    pub fn chat_template_path(&self) -> Option<&Path> {
        self.first_path_of(&LayerKind::Template)
    }

    pub fn config_archive_path(&self) -> Option<&Path> {
        self.first_path_of(&LayerKind::ConfigArchive)
    }

    pub fn license_paths(&self) -> Vec<PathBuf> {
        self.paths_of(&LayerKind::License)
    }
}

impl ModelImage for Model {
    fn raw_config(&self) -> Result<Vec<u8>> {
        Ok(self.raw_config.clone())
    }

    fn layers(&self) -> Result<Vec<Arc<dyn ModelLayer>>> {
        Ok(self
            .layers
            .iter()
            .map(|l| {
                Arc::new(FileLayer::with_digest(
                    &l.path,
                    l.descriptor.media_type.clone(),
                    l.descriptor.digest.clone(),
                    l.descriptor.size,
                )) as Arc<dyn ModelLayer>
            })
            .collect())
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(self.raw_manifest.clone())
    }

    fn config_digest(&self) -> Result<Digest> {
        Ok(self.manifest.config.digest.clone())
    }

    fn digest(&self) -> Result<Digest> {
        Ok(self.id.clone())
    }
}
