//! Runtime bundles.
//!
//! A bundle is a flat directory an inference runtime can consume directly:
//! weights under fixed names, an optional projector and chat template, files
//! from an optional config archive, and `config.json`. Bundles are derived
//! from stored blobs and can always be regenerated.
//!
//! `config.json` is written last when materializing and is required when
//! parsing, so an interrupted materialization never parses as complete.

mod parse;
mod unpack;

pub use parse::parse;
pub use unpack::{extract_config_archive, materialize};

use crate::manifest::ModelConfig;
use crate::media::Format;
use std::path::{Path, PathBuf};

/// Name of the rendered runtime config inside a bundle.
pub const RUNTIME_CONFIG_FILENAME: &str = "config.json";
pub const MMPROJ_FILENAME: &str = "model.mmproj";
pub const CHAT_TEMPLATE_FILENAME: &str = "template.jinja";

/// File name of weights in a bundle: `model.<ext>` for a single file,
/// `model-00001-of-00005.<ext>` for shards (1-based).
pub fn weights_filename(format: Format, index: usize, count: usize) -> String {
    if count == 1 {
        format!("model.{}", format.extension())
    } else {
        format!("model-{:05}-of-{:05}.{}", index + 1, count, format.extension())
    }
}

/// A materialized bundle. File names are relative to the root directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    dir: PathBuf,
    gguf_file: Option<String>,
    safetensors_file: Option<String>,
    mmproj_file: Option<String>,
    chat_template_file: Option<String>,
    runtime_config: ModelConfig,
}

impl Bundle {
    pub fn root_dir(&self) -> &Path {
        &self.dir
    }

    /// GGUF weights (the first shard when split).
    pub fn gguf_path(&self) -> Option<PathBuf> {
        self.gguf_file.as_ref().map(|f| self.dir.join(f))
    }

    /// Safetensors weights (the first shard when split).
    pub fn safetensors_path(&self) -> Option<PathBuf> {
        self.safetensors_file.as_ref().map(|f| self.dir.join(f))
    }

    /// Whichever weights the bundle holds, GGUF first.
    pub fn weights_path(&self) -> Option<PathBuf> {
        self.gguf_path().or_else(|| self.safetensors_path())
    }

    pub fn mmproj_path(&self) -> Option<PathBuf> {
        self.mmproj_file.as_ref().map(|f| self.dir.join(f))
    }

    pub fn chat_template_path(&self) -> Option<PathBuf> {
        self.chat_template_file.as_ref().map(|f| self.dir.join(f))
    }

    pub fn runtime_config(&self) -> &ModelConfig {
        &self.runtime_config
    }
}
