//! The image abstraction the store writes from.
//!
//! An image is a raw config blob plus ordered layers, described by a raw
//! manifest whose digest is the model ID. Images come from a registry client
//! or from [`crate::builder::ModelBuilder`]; the store only needs these traits.

use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::manifest::Descriptor;
use crate::media::LayerKind;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One content unit of an image.
pub trait ModelLayer: Send + Sync {
    fn digest(&self) -> &Digest;

    fn media_type(&self) -> &str;

    fn size(&self) -> u64;

    /// Open a fresh reader over the uncompressed content.
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    fn kind(&self) -> LayerKind {
        LayerKind::from_media_type(self.media_type())
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type().to_string(),
            size: self.size(),
            digest: self.digest().clone(),
        }
    }
}

/// A complete model image.
pub trait ModelImage: Send + Sync {
    fn raw_config(&self) -> Result<Vec<u8>>;

    fn layers(&self) -> Result<Vec<Arc<dyn ModelLayer>>>;

    fn raw_manifest(&self) -> Result<Vec<u8>>;

    /// Digest of the config blob.
    fn config_digest(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.raw_config()?))
    }

    /// The model ID: digest of the raw manifest.
    fn digest(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.raw_manifest()?))
    }
}

/// A layer backed by a file on disk whose digest is already known.
#[derive(Debug, Clone)]
pub struct FileLayer {
    path: PathBuf,
    media_type: String,
    digest: Digest,
    size: u64,
}

impl FileLayer {
    /// Hash `path` once and describe it as a layer of `media_type`.
    pub fn new(path: impl Into<PathBuf>, media_type: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|e| StoreError::io_with_path(e, &path))?;
        let size = file
            .metadata()
            .map_err(|e| StoreError::io_with_path(e, &path))?
            .len();
        let digest = Digest::compute(crate::digest::Algorithm::Sha256, &mut file)
            .map_err(|e| StoreError::io_op("Failed to hash", e, &path))?;

        Ok(Self {
            path,
            media_type: media_type.into(),
            digest,
            size,
        })
    }

    /// Describe an existing file whose digest and size are trusted, such as a
    /// blob already in the store.
    pub fn with_digest(
        path: impl Into<PathBuf>,
        media_type: impl Into<String>,
        digest: Digest,
        size: u64,
    ) -> Self {
        Self {
            path: path.into(),
            media_type: media_type.into(),
            digest,
            size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelLayer for FileLayer {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(|e| StoreError::io_with_path(e, &self.path))?;
        Ok(Box::new(file))
    }
}

/// A layer held in memory.
#[derive(Debug, Clone)]
pub struct BytesLayer {
    data: Arc<Vec<u8>>,
    media_type: String,
    digest: Digest,
}

impl BytesLayer {
    pub fn new(data: impl Into<Vec<u8>>, media_type: impl Into<String>) -> Self {
        let data = data.into();
        let digest = Digest::sha256_of(&data);
        Self {
            data: Arc::new(data),
            media_type: media_type.into(),
            digest,
        }
    }
}

impl ModelLayer for BytesLayer {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.as_ref().clone())))
    }
}
