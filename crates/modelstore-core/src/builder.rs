//! Packaging local model files into an image the store can write.
//!
//! ```no_run
//! use modelstore_core::builder::ModelBuilder;
//! use std::path::PathBuf;
//!
//! # fn main() -> modelstore_core::Result<()> {
//! let image = ModelBuilder::from_gguf(&[PathBuf::from("smollm2.gguf")])?
//!     .with_chat_template("template.jinja")?
//!     .with_context_size(8192)
//!     .build()?;
//! # let _ = image;
//! # Ok(())
//! # }
//! ```

use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::gguf;
use crate::image::{FileLayer, ModelImage, ModelLayer};
use crate::manifest::{ConfigFile, Descriptor, Manifest, ModelConfig, ModelDescriptor, RootFs};
use crate::media::{
    Format, MEDIA_TYPE_CHAT_TEMPLATE, MEDIA_TYPE_CONFIG_ARCHIVE, MEDIA_TYPE_LICENSE,
    MEDIA_TYPE_MMPROJ, MEDIA_TYPE_MODEL_CONFIG_V01,
};
use crate::storage::Model;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// `model-00001-of-00003.gguf`
/// Captures: (base_name, shard_index, total_count, extension)
static SHARD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-(\d{5})-of-(\d{5})\.(gguf|safetensors)$").unwrap());

/// Largest safetensors JSON header we are willing to read.
const MAX_SAFETENSORS_HEADER: u64 = 100 * 1024 * 1024;

/// Assembles weights and auxiliary files into a [`PackagedModel`].
pub struct ModelBuilder {
    config: ModelConfig,
    layers: Vec<Arc<dyn ModelLayer>>,
}

impl ModelBuilder {
    /// Start from GGUF weights. A single shard path expands to its full set
    /// when every sibling shard is present.
    pub fn from_gguf(paths: &[PathBuf]) -> Result<Self> {
        let paths = expand_shards(paths)?;
        let config = gguf::config_from_files(&paths);
        Self::from_weights(Format::Gguf, &paths, config)
    }

    /// Start from safetensors weights.
    pub fn from_safetensors(paths: &[PathBuf]) -> Result<Self> {
        let paths = expand_shards(paths)?;
        let config = safetensors_config(&paths);
        Self::from_weights(Format::Safetensors, &paths, config)
    }

    /// Start from the layers of a stored model, reusing their blobs without
    /// rehashing. The config blob is rebuilt from the model's config.
    pub fn from_model(model: &Model) -> Self {
        let layers = model
            .layers()
            .iter()
            .map(|layer| {
                Arc::new(FileLayer::with_digest(
                    &layer.path,
                    layer.descriptor.media_type.clone(),
                    layer.descriptor.digest.clone(),
                    layer.descriptor.size,
                )) as Arc<dyn ModelLayer>
            })
            .collect();
        Self {
            config: model.config().clone(),
            layers,
        }
    }

    fn from_weights(format: Format, paths: &[PathBuf], config: ModelConfig) -> Result<Self> {
        let mut layers: Vec<Arc<dyn ModelLayer>> = Vec::with_capacity(paths.len());
        for path in paths {
            debug!("Hashing {} weights {}", format, path.display());
            layers.push(Arc::new(FileLayer::new(path, format.media_type())?));
        }
        Ok(Self { config, layers })
    }

    pub fn with_multimodal_projector(self, path: impl AsRef<Path>) -> Result<Self> {
        self.with_file(path.as_ref(), MEDIA_TYPE_MMPROJ)
    }

    pub fn with_chat_template(self, path: impl AsRef<Path>) -> Result<Self> {
        self.with_file(path.as_ref(), MEDIA_TYPE_CHAT_TEMPLATE)
    }

    pub fn with_license(self, path: impl AsRef<Path>) -> Result<Self> {
        self.with_file(path.as_ref(), MEDIA_TYPE_LICENSE)
    }

    /// Attach a tar archive of runtime config files (tokenizer, generation
    /// config) to be extracted into the bundle.
    pub fn with_config_archive(self, path: impl AsRef<Path>) -> Result<Self> {
        self.with_file(path.as_ref(), MEDIA_TYPE_CONFIG_ARCHIVE)
    }

    pub fn with_context_size(mut self, size: u64) -> Self {
        self.config.context_size = Some(size);
        self
    }

    pub fn with_layer(mut self, layer: Arc<dyn ModelLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    fn with_file(mut self, path: &Path, media_type: &str) -> Result<Self> {
        self.layers.push(Arc::new(FileLayer::new(path, media_type)?));
        Ok(self)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Render the config blob and manifest. Their bytes are fixed from here
    /// on, so the resulting image has a stable ID.
    pub fn build(self) -> Result<PackagedModel> {
        let config_file = ConfigFile {
            config: self.config,
            descriptor: ModelDescriptor {
                created: Some(Utc::now()),
            },
            rootfs: RootFs {
                fs_type: "rootfs".to_string(),
                diff_ids: self.layers.iter().map(|l| l.digest().clone()).collect(),
            },
        };
        let raw_config = serde_json::to_vec(&config_file)?;

        let manifest = Manifest::new(
            Descriptor {
                media_type: MEDIA_TYPE_MODEL_CONFIG_V01.to_string(),
                size: raw_config.len() as u64,
                digest: Digest::sha256_of(&raw_config),
            },
            self.layers.iter().map(|l| l.descriptor()).collect(),
        );
        let raw_manifest = serde_json::to_vec(&manifest)?;

        Ok(PackagedModel {
            raw_config,
            raw_manifest,
            layers: self.layers,
        })
    }
}

/// An image built from local files.
pub struct PackagedModel {
    raw_config: Vec<u8>,
    raw_manifest: Vec<u8>,
    layers: Vec<Arc<dyn ModelLayer>>,
}

impl ModelImage for PackagedModel {
    fn raw_config(&self) -> Result<Vec<u8>> {
        Ok(self.raw_config.clone())
    }

    fn layers(&self) -> Result<Vec<Arc<dyn ModelLayer>>> {
        Ok(self.layers.clone())
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(self.raw_manifest.clone())
    }
}

/// Expand a lone shard path into its complete, ordered shard set.
fn expand_shards(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let first = paths.first().ok_or_else(|| {
        StoreError::Other("at least one weights file is required".to_string())
    })?;
    if paths.len() > 1 {
        return Ok(paths.to_vec());
    }

    let name = first.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let Some(caps) = SHARD_PATTERN.captures(name) else {
        return Ok(paths.to_vec());
    };
    let total: usize = caps[3].parse().unwrap_or(0);
    let dir = first.parent().unwrap_or_else(|| Path::new(""));

    let shards: Vec<PathBuf> = (1..=total)
        .map(|i| dir.join(format!("{}-{:05}-of-{:05}.{}", &caps[1], i, total, &caps[4])))
        .filter(|p| p.is_file())
        .collect();

    if shards.len() == total {
        Ok(shards)
    } else {
        debug!(
            "Only {} of {} shards found next to {}, packaging as given",
            shards.len(),
            total,
            first.display()
        );
        Ok(paths.to_vec())
    }
}

/// Config for safetensors weights, read from the first file's JSON header.
/// Unreadable headers leave the descriptive fields empty.
fn safetensors_config(paths: &[PathBuf]) -> ModelConfig {
    let total_size: u64 = paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    let mut config = ModelConfig {
        format: Some(Format::Safetensors),
        size: gguf::format_size(total_size),
        ..Default::default()
    };

    let mut parameters: u64 = 0;
    let mut dtypes = BTreeMap::<String, usize>::new();
    for (i, path) in paths.iter().enumerate() {
        let header = match read_safetensors_header(path) {
            Ok(h) => h,
            Err(e) => {
                debug!("Skipping safetensors metadata for {}: {}", path.display(), e);
                continue;
            }
        };
        for (name, value) in header {
            if name == "__metadata__" {
                if i == 0 {
                    if let Value::Object(meta) = value {
                        for (k, v) in meta {
                            let rendered = match v {
                                Value::String(s) => s,
                                other => other.to_string(),
                            };
                            config.safetensors.insert(k, rendered);
                        }
                    }
                }
                continue;
            }
            if let Some(dtype) = value.get("dtype").and_then(Value::as_str) {
                *dtypes.entry(dtype.to_string()).or_default() += 1;
            }
            if let Some(shape) = value.get("shape").and_then(Value::as_array) {
                let count = shape
                    .iter()
                    .filter_map(Value::as_u64)
                    .try_fold(1u64, |acc, dim| acc.checked_mul(dim));
                match count.and_then(|c| parameters.checked_add(c)) {
                    Some(total) => parameters = total,
                    None => debug!(
                        "Ignoring tensor {} in {}: parameter count overflows",
                        name,
                        path.display()
                    ),
                }
            }
        }
    }

    if parameters > 0 {
        config.parameters = gguf::format_parameters(parameters);
    }
    config.quantization = match dtypes.len() {
        0 => String::new(),
        1 => dtypes.keys().next().cloned().unwrap_or_default(),
        _ => "mixed".to_string(),
    };
    config
}

fn read_safetensors_header(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let mut file = File::open(path).map_err(|e| StoreError::io_with_path(e, path))?;
    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)
        .map_err(|e| StoreError::io_op("Failed to read header length of", e, path))?;
    let len = u64::from_le_bytes(len_buf);
    if len > MAX_SAFETENSORS_HEADER {
        return Err(StoreError::Other(format!(
            "safetensors header of {} bytes exceeds limit",
            len
        )));
    }
    let mut header = vec![0u8; len as usize];
    file.read_exact(&mut header)
        .map_err(|e| StoreError::io_op("Failed to read header of", e, path))?;
    Ok(serde_json::from_slice(&header)?)
}
