//! Media types and layer classification.
//!
//! Layers are distinguished by the media type label attached to each
//! descriptor. The label is resolved into a [`LayerKind`] once, when a
//! manifest is loaded, so call sites match on the enum instead of comparing
//! strings.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_MODEL_CONFIG_V01: &str = "application/vnd.docker.ai.model.config.v0.1+json";
pub const MEDIA_TYPE_GGUF: &str = "application/vnd.docker.ai.gguf.v3";
pub const MEDIA_TYPE_SAFETENSORS: &str = "application/vnd.docker.ai.safetensors";
pub const MEDIA_TYPE_MMPROJ: &str = "application/vnd.docker.ai.mmproj";
pub const MEDIA_TYPE_CHAT_TEMPLATE: &str = "application/vnd.docker.ai.chat.template.jinja";
pub const MEDIA_TYPE_LICENSE: &str = "application/vnd.docker.ai.license";
pub const MEDIA_TYPE_CONFIG_ARCHIVE: &str = "application/vnd.docker.ai.vllm.config.tar";

/// Prefix shared by every versioned model config media type.
const MODEL_CONFIG_PREFIX: &str = "application/vnd.docker.ai.model.config";

/// Weight container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Gguf,
    Safetensors,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Gguf => "gguf",
            Format::Safetensors => "safetensors",
        }
    }

    /// File extension used for this format inside a bundle.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Format::Gguf => MEDIA_TYPE_GGUF,
            Format::Safetensors => MEDIA_TYPE_SAFETENSORS,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a layer holds, resolved from its media type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Config,
    Weights(Format),
    Projector,
    Template,
    License,
    ConfigArchive,
    Unknown(String),
}

impl LayerKind {
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type {
            MEDIA_TYPE_GGUF => LayerKind::Weights(Format::Gguf),
            MEDIA_TYPE_SAFETENSORS => LayerKind::Weights(Format::Safetensors),
            MEDIA_TYPE_MMPROJ => LayerKind::Projector,
            MEDIA_TYPE_CHAT_TEMPLATE => LayerKind::Template,
            MEDIA_TYPE_LICENSE => LayerKind::License,
            MEDIA_TYPE_CONFIG_ARCHIVE => LayerKind::ConfigArchive,
            mt if mt.starts_with(MODEL_CONFIG_PREFIX) => LayerKind::Config,
            other => LayerKind::Unknown(other.to_string()),
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            LayerKind::Config => MEDIA_TYPE_MODEL_CONFIG_V01,
            LayerKind::Weights(format) => format.media_type(),
            LayerKind::Projector => MEDIA_TYPE_MMPROJ,
            LayerKind::Template => MEDIA_TYPE_CHAT_TEMPLATE,
            LayerKind::License => MEDIA_TYPE_LICENSE,
            LayerKind::ConfigArchive => MEDIA_TYPE_CONFIG_ARCHIVE,
            LayerKind::Unknown(mt) => mt,
        }
    }
}
