//! The local store: blobs, manifests, the index and bundles under one root.
//!
//! A write moves through `StreamingLayers -> CommittingManifest ->
//! UpdatingIndex`. A failure at any point aborts the write. Blobs already
//! streamed stay on disk and are skipped by a retry; the model only becomes
//! visible with the final index rewrite.

use crate::bundle::{self, Bundle};
use crate::config::{StoreConfig, StoreOptions};
use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::image::{ModelImage, ModelLayer};
use crate::manifest::Manifest;
use crate::progress::{pull_message, LayerInfo, ProgressSink, Reporter};
use crate::reference::{Reference, Tag};
use crate::storage::atomic::atomic_read_json;
use crate::storage::blobs::BlobStore;
use crate::storage::index::{Index, IndexEntry, IndexFile};
use crate::storage::layout::Layout;
use crate::storage::manifests::ManifestStore;
use crate::storage::model::Model;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Phase of a write, used to report where an aborted write stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    StreamingLayers,
    CommittingManifest,
    UpdatingIndex,
}

/// A file that could not be cleaned up during a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    /// What was being removed, e.g. `blob sha256:...`.
    pub target: String,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to remove {}: {}", self.target, self.message)
    }
}

/// Result of deleting a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub id: Digest,
    /// Tags the model carried when it was deleted.
    pub tags: Vec<String>,
    pub warnings: Vec<CleanupWarning>,
}

/// Bytes used under each top-level directory of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub blobs: u64,
    pub manifests: u64,
    /// Bundles mostly hard-link blobs, so this overlaps with `blobs`.
    pub bundles: u64,
}

impl DiskUsage {
    /// Blobs plus manifests: bytes that deleting everything would free.
    pub fn total(&self) -> u64 {
        self.blobs + self.manifests
    }
}

/// Content-addressed model store rooted at a directory.
///
/// Cloning is cheap and clones share the write lock, so every mutation made
/// through any clone is serialized.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    blobs: BlobStore,
    manifests: ManifestStore,
    index: IndexFile,
    /// Serializes read-modify-write of the index and bundle regeneration.
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Open (creating if needed) the store at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_options(root, StoreOptions::default()).await
    }

    pub async fn open_with_options(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let root = root.into();
        let blobs = BlobStore::new(root.join(StoreConfig::BLOBS_DIR_NAME));
        let manifests = ManifestStore::new(root.join(StoreConfig::MANIFESTS_DIR_NAME), blobs.clone());
        let index = IndexFile::new(
            root.join(StoreConfig::INDEX_FILENAME),
            options.keep_index_backup,
        );

        let store = Self {
            root,
            blobs,
            manifests,
            index,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.initialize()?;
        debug!("Opened model store at {}", store.root.display());
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| StoreError::io_op("Failed to create store root", e, &self.root))?;
        Layout::ensure(&self.root)?;
        if !self.index.path().exists() {
            self.index.write(&Index::default())?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    fn bundle_dir(&self, id: &Digest) -> PathBuf {
        self.root
            .join(StoreConfig::BUNDLES_DIR_NAME)
            .join(id.algorithm().as_str())
            .join(id.hex())
    }

    /// Layout version of the store, or `"unknown"` if it cannot be read.
    pub fn version(&self) -> String {
        match atomic_read_json::<Layout>(&self.root.join(StoreConfig::LAYOUT_FILENAME)) {
            Ok(Some(layout)) => layout.version,
            Ok(None) => "unknown".to_string(),
            Err(e) => {
                debug!("Failed to read store layout: {}", e);
                "unknown".to_string()
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<IndexEntry>> {
        Ok(self.index.read()?.models)
    }

    /// Resolve `reference` (ID, `name@digest` or tag) to a stored model.
    pub async fn read(&self, reference: &str) -> Result<Model> {
        let parsed = Reference::parse(reference)?;
        let index = self.index.read()?;
        let entry = index
            .find_reference(&parsed)
            .ok_or_else(|| StoreError::not_found(reference))?;
        Model::load(&self.blobs, &self.manifests, entry.id.clone(), entry.tags.clone())
    }

    /// Write a full image: config, every layer, manifest, then the index.
    ///
    /// Each layer reports progress to `progress` when given. Returns the
    /// model ID.
    pub async fn write(
        &self,
        image: &dyn ModelImage,
        tags: &[String],
        progress: Option<ProgressSink>,
    ) -> Result<Digest> {
        let _lock = self.write_lock.lock().await;
        validate_tags(tags)?;

        let id = image.digest()?;
        self.write_config(image)?;

        let layers = image.layers()?;
        let total: u64 = layers.iter().map(|l| l.size()).sum();
        for layer in layers {
            self.write_layer(layer, total, progress.clone())
                .await
                .inspect_err(|e| aborted(&id, WritePhase::StreamingLayers, e))?;
        }

        self.commit(image, &id, tags)?;
        info!("Stored model {}", id);
        Ok(id)
    }

    /// Write an image whose layers are all already stored, such as a model
    /// with only its config changed. Fails with `NotFound` if any layer is
    /// missing.
    pub async fn write_lightweight(&self, image: &dyn ModelImage, tags: &[String]) -> Result<Digest> {
        let _lock = self.write_lock.lock().await;
        validate_tags(tags)?;

        let id = image.digest()?;
        for layer in image.layers()? {
            if !self.blobs.has(layer.digest())? {
                return Err(StoreError::not_found(format!(
                    "layer {} (required for lightweight write of {})",
                    layer.digest(),
                    id
                )));
            }
        }

        self.write_config(image)?;
        self.commit(image, &id, tags)?;
        info!("Stored model {} (config only)", id);
        Ok(id)
    }

    fn write_config(&self, image: &dyn ModelImage) -> Result<()> {
        let raw_config = image.raw_config()?;
        let config_digest = image.config_digest()?;
        self.blobs
            .write(&config_digest, &mut raw_config.as_slice(), None)?;
        Ok(())
    }

    async fn write_layer(
        &self,
        layer: Arc<dyn ModelLayer>,
        total: u64,
        sink: Option<ProgressSink>,
    ) -> Result<()> {
        let digest = layer.digest().clone();
        if self.blobs.has(&digest)? {
            debug!("Layer {} already stored", digest);
            return Ok(());
        }

        let reporter = sink.map(|sink| {
            Reporter::new(
                sink,
                LayerInfo {
                    id: digest.to_string(),
                    size: layer.size(),
                    total,
                },
                pull_message,
            )
        });
        let updates = reporter.as_ref().map(|r| r.updates());

        let blobs = self.blobs.clone();
        let task_digest = digest.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut reader = layer.open()?;
            blobs.write(&task_digest, &mut reader, updates.as_ref())
        })
        .await
        .map_err(|e| StoreError::Other(format!("blob write task failed: {}", e)))?;

        if let Some(reporter) = reporter {
            if let Err(e) = reporter.wait().await {
                warn!("Progress reporting for layer {} failed: {}", digest, e);
            }
        }

        result.map(|_| ())
    }

    /// Persist the manifest and publish the model in the index.
    fn commit(&self, image: &dyn ModelImage, id: &Digest, tags: &[String]) -> Result<()> {
        let raw_manifest = image.raw_manifest()?;
        let manifest = Manifest::parse(&raw_manifest)?;
        self.manifests
            .write(id, &raw_manifest)
            .inspect_err(|e| aborted(id, WritePhase::CommittingManifest, e))?;

        let update = || -> Result<()> {
            let mut index = self
                .index
                .read()?
                .add(IndexEntry::new(id.clone(), manifest.blob_digests()));
            for tag in tags {
                index = index.tag(&id.to_string(), tag)?;
            }
            self.index.write(&index)
        };
        update().inspect_err(|e| aborted(id, WritePhase::UpdatingIndex, e))
    }

    /// Delete a model and every blob no other model references.
    ///
    /// Cleanup failures never abort the delete; they are logged and returned
    /// as warnings. The index is rewritten once at the end.
    pub async fn delete(&self, reference: &str) -> Result<DeleteOutcome> {
        let _lock = self.write_lock.lock().await;
        let parsed = Reference::parse(reference)?;
        let index = self.index.read()?;
        let entry = index
            .find_reference(&parsed)
            .cloned()
            .ok_or_else(|| StoreError::not_found(reference))?;

        let mut warnings = Vec::new();
        let mut warn_on = |target: String, result: Result<()>| {
            if let Err(e) = result {
                warn!("Failed to remove {}: {}", target, e);
                warnings.push(CleanupWarning {
                    target,
                    message: e.to_string(),
                });
            }
        };

        warn_on(
            format!("manifest {}", entry.id),
            self.manifests.remove(&entry.id),
        );

        let bundle_dir = self.bundle_dir(&entry.id);
        warn_on(format!("bundle {}", bundle_dir.display()), remove_dir_if_exists(&bundle_dir));

        let mut seen = HashSet::new();
        for blob in &entry.files {
            if !seen.insert(blob) || index.references_elsewhere(&entry.id, blob) {
                continue;
            }
            warn_on(format!("blob {}", blob), self.blobs.remove(blob));
        }

        self.index.write(&index.remove(&entry.id))?;
        info!("Deleted model {}", entry.id);

        Ok(DeleteOutcome {
            id: entry.id,
            tags: entry.tags,
            warnings,
        })
    }

    /// Point each of `tags` at the model named by `reference`.
    pub async fn add_tags(&self, reference: &str, tags: &[String]) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let mut index = self.index.read()?;
        for tag in tags {
            index = index.tag(reference, tag)?;
        }
        self.index.write(&index)
    }

    /// Remove `tags`, returning the model ID each pointed at.
    ///
    /// All-or-nothing: if any tag does not exist, the index is left untouched.
    pub async fn remove_tags(&self, tags: &[String]) -> Result<Vec<Digest>> {
        let _lock = self.write_lock.lock().await;
        let mut index = self.index.read()?;
        let mut ids = Vec::with_capacity(tags.len());
        for tag in tags {
            let (id, next) = index.untag(tag)?;
            ids.push(id);
            index = next;
        }
        self.index.write(&index)?;
        Ok(ids)
    }

    /// Remove everything under the root (but not the root itself) and start
    /// over with an empty store.
    pub async fn reset(&self) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let entries = fs::read_dir(&self.root)
            .map_err(|e| StoreError::io_op("Failed to read store directory", e, &self.root))?;
        for entry in entries {
            let path = entry
                .map_err(|e| StoreError::io_op("Failed to read store directory", e, &self.root))?
                .path();
            let result = if path.is_dir() && !path.is_symlink() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| StoreError::io_op("Failed to remove", e, &path))?;
        }
        self.initialize()?;
        info!("Reset model store at {}", self.root.display());
        Ok(())
    }

    /// The runtime bundle for `reference`, materializing it if needed.
    ///
    /// An existing bundle that fails to parse is deleted and rebuilt. A bundle
    /// that cannot be built is removed again.
    pub async fn bundle(&self, reference: &str) -> Result<Bundle> {
        let _lock = self.write_lock.lock().await;
        let model = self.read(reference).await?;

        let dir = self.bundle_dir(model.id());
        if dir.exists() {
            match bundle::parse(&dir) {
                Ok(existing) => return Ok(existing),
                Err(e) => {
                    debug!("Regenerating bundle for {}: {}", model.id(), e);
                    remove_dir_if_exists(&dir)?;
                }
            }
        }

        let target = dir.clone();
        let result = tokio::task::spawn_blocking(move || bundle::materialize(&target, &model))
            .await
            .map_err(|e| StoreError::Other(format!("bundle task failed: {}", e)))?;
        if result.is_err() {
            if let Err(e) = remove_dir_if_exists(&dir) {
                warn!("Failed to remove partial bundle {}: {}", dir.display(), e);
            }
        }
        result
    }

    /// Bytes used by blobs, manifests and bundles.
    pub async fn disk_usage(&self) -> Result<DiskUsage> {
        Ok(DiskUsage {
            blobs: dir_size(self.blobs.root()),
            manifests: dir_size(self.manifests.root()),
            bundles: dir_size(&self.root.join(StoreConfig::BUNDLES_DIR_NAME)),
        })
    }
}

fn validate_tags(tags: &[String]) -> Result<()> {
    for tag in tags {
        Tag::parse(tag)?;
    }
    Ok(())
}

fn aborted(id: &Digest, phase: WritePhase, err: &StoreError) {
    warn!("Write of {} aborted while {:?}: {}", id, phase, err);
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io_op("Failed to remove", e, dir)),
    }
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
