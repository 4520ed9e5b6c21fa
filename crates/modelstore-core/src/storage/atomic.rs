//! Atomic file operations.
//!
//! Every persisted file in the store is written the same way:
//! 1. Write to a sibling temp file with a unique PID+TID suffix
//! 2. fsync so the data reaches disk
//! 3. Optionally keep a `.bak` copy of the previous version
//! 4. Rename over the target
//!
//! Readers therefore see either the old file or the new one, never a partial
//! write.

use crate::error::{Result, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::{debug, warn};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io_op("Failed to read", e, path)),
    };

    let data: T = serde_json::from_slice(&contents).map_err(|e| StoreError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data).map_err(|e| StoreError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;

    if keep_backup && path.exists() {
        let backup_path = sibling_with_suffix(path, ".bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        } else {
            debug!("Created backup: {}", backup_path.display());
        }
    }

    atomic_write_bytes(path, &serialized)
}

/// Write `data` to `path` atomically, creating parent directories.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = sibling_with_suffix(
        path,
        &format!(".{}.{}.tmp", process::id(), thread_id()),
    );
    write_then_rename(path, &temp_path, |file| {
        file.write_all(data)
            .map_err(|e| StoreError::io_op("Failed to write temp file", e, &temp_path))
    })
}

/// Fill `temp_path` through `fill`, fsync it, then rename it to `path`.
///
/// The temp file is removed on any failure, so nothing appears at `path`
/// unless `fill` and the fsync both succeeded.
pub fn write_then_rename<F>(path: &Path, temp_path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    ensure_parent_dir(path)?;

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .map_err(|e| StoreError::io_op("Failed to create temp file", e, temp_path))?;

        fill(&mut file)?;
        file.flush()
            .map_err(|e| StoreError::io_op("Failed to flush temp file", e, temp_path))?;
        file.sync_all()
            .map_err(|e| StoreError::io_op("Failed to sync temp file", e, temp_path))?;
        drop(file);

        fs::rename(temp_path, path).map_err(|e| StoreError::Io {
            message: format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(temp_path);
    } else {
        debug!("Atomically wrote {}", path.display());
    }
    result
}

/// Create the parent directory of `path` if it is missing.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io_op("Failed to create directory", e, parent))?;
        }
    }
    Ok(())
}

/// `path` with `suffix` appended to its file name (`blob` -> `blob.incomplete`).
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Get a unique thread identifier.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.json");

        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        atomic_write_json(&path, &data, false).unwrap();
        let read_data: Option<TestData> = atomic_read_json(&path).unwrap();
        assert_eq!(read_data, Some(data));
    }

    #[test]
    fn test_atomic_write_keeps_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");

        let first = TestData {
            name: "first".to_string(),
            value: 1,
        };
        let second = TestData {
            name: "second".to_string(),
            value: 2,
        };

        atomic_write_json(&path, &first, true).unwrap();
        atomic_write_json(&path, &second, true).unwrap();

        let backup: Option<TestData> =
            atomic_read_json(&temp_dir.path().join("index.json.bak")).unwrap();
        assert_eq!(backup, Some(first));
        let current: Option<TestData> = atomic_read_json(&path).unwrap();
        assert_eq!(current, Some(second));
    }

    #[test]
    fn test_atomic_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let result: Option<TestData> =
            atomic_read_json(&temp_dir.path().join("missing.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_failed_fill_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("manifest");

        let temp_path = sibling_with_suffix(&path, ".incomplete");

        let result = write_then_rename(&path, &temp_path, |file| {
            file.write_all(b"partial").unwrap();
            Err(StoreError::Other("stream closed".to_string()))
        });

        assert!(result.is_err());
        assert!(!path.exists());
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_sibling_with_suffix() {
        let p = Path::new("/store/blobs/sha256/abc");
        assert_eq!(
            sibling_with_suffix(p, ".incomplete"),
            PathBuf::from("/store/blobs/sha256/abc.incomplete")
        );
    }
}
