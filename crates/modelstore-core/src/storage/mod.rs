//! On-disk storage: blobs, manifests, the index and the store that ties
//! them together.

pub mod atomic;
pub mod blobs;
pub mod index;
pub mod layout;
pub mod manifests;
pub mod model;
pub mod store;

pub use blobs::BlobStore;
pub use index::{Index, IndexEntry, IndexFile};
pub use layout::Layout;
pub use manifests::ManifestStore;
pub use model::{Model, StoredLayer};
pub use store::{CleanupWarning, DeleteOutcome, DiskUsage, LocalStore};
