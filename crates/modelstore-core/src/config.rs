//! Centralized configuration for the model store.
//!
//! On-disk names, layout versioning, progress throttling and parser limits.

use std::time::Duration;

/// On-disk layout of a store root.
pub struct StoreConfig;

impl StoreConfig {
    /// Current version written to `layout.json`.
    pub const LAYOUT_VERSION: &'static str = "1.0.0";
    pub const LAYOUT_FILENAME: &'static str = "layout.json";
    pub const INDEX_FILENAME: &'static str = "index.json";
    pub const BLOBS_DIR_NAME: &'static str = "blobs";
    pub const MANIFESTS_DIR_NAME: &'static str = "manifests";
    pub const BUNDLES_DIR_NAME: &'static str = "bundles";
    /// Suffix of a blob that is still being streamed.
    pub const INCOMPLETE_SUFFIX: &'static str = ".incomplete";
    /// Read buffer for blob streaming and hashing (8MB, same as file hashing).
    pub const COPY_CHUNK_SIZE: usize = 8 * 1024 * 1024;
    /// Environment variable the CLI reads for the store root.
    pub const ROOT_ENV_VAR: &'static str = "MODEL_STORE_ROOT";
    /// Directory name under the platform data dir used when no root is given.
    pub const DEFAULT_DIR_NAME: &'static str = "model-store";
}

/// Progress reporting thresholds.
pub struct ProgressConfig;

impl ProgressConfig {
    /// Minimum time between two progress messages.
    pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);
    /// A delta of at least this many bytes emits immediately.
    pub const MIN_BYTES_FOR_UPDATE: u64 = 1024 * 1024;
    /// Capacity of the producer -> relay handoff channel.
    pub const CHANNEL_CAPACITY: usize = 1;
}

/// Limits for GGUF header parsing.
pub struct GgufConfig;

impl GgufConfig {
    pub const MAX_KEYS: usize = 1024;
    pub const MAX_STRING_LEN: u64 = 64 * 1024;
    pub const MAX_ARRAY_DEPTH: usize = 10;
    /// Arrays longer than this are not walked element by element.
    pub const MAX_ARRAY_SKIP_LEN: u64 = 16 * 1024 * 1024;
}

/// Runtime options for opening a store.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Keep `index.json.bak` with the previous index on every rewrite.
    pub keep_index_backup: bool,
}

