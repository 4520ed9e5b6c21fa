//! Model Store - local content-addressable storage for model packages.
//!
//! Weights and auxiliary files (projectors, chat templates, licenses, config
//! archives) are stored once as blobs named by their digest. Manifests tie a
//! model's config and layers together; the manifest digest is the model ID.
//! `index.json` maps human tags to IDs, and a flat runtime bundle can be
//! materialized for any stored model on demand.
//!
//! # Example
//!
//! ```rust,no_run
//! use modelstore_core::{LocalStore, ModelBuilder};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> modelstore_core::Result<()> {
//!     let store = LocalStore::open("/tmp/model-store").await?;
//!
//!     let image = ModelBuilder::from_gguf(&[PathBuf::from("model.gguf")])?
//!         .with_context_size(8192)
//!         .build()?;
//!     let id = store.write(&image, &["smollm:135m".to_string()], None).await?;
//!
//!     let bundle = store.bundle(&id.to_string()).await?;
//!     println!("weights at {:?}", bundle.weights_path());
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod bundle;
pub mod config;
pub mod digest;
pub mod error;
pub mod gguf;
pub mod image;
pub mod manifest;
pub mod media;
pub mod progress;
pub mod reference;
pub mod storage;

pub use builder::{ModelBuilder, PackagedModel};
pub use bundle::Bundle;
pub use config::StoreOptions;
pub use digest::{Algorithm, Digest};
pub use error::{Result, StoreError};
pub use image::{BytesLayer, FileLayer, ModelImage, ModelLayer};
pub use manifest::{ConfigFile, Descriptor, Manifest, ModelConfig};
pub use media::{Format, LayerKind};
pub use progress::ProgressSink;
pub use reference::{Reference, Tag};
pub use storage::{CleanupWarning, DeleteOutcome, DiskUsage, IndexEntry, LocalStore, Model};
