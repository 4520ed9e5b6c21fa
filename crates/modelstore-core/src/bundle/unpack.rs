use super::{
    weights_filename, Bundle, CHAT_TEMPLATE_FILENAME, MMPROJ_FILENAME, RUNTIME_CONFIG_FILENAME,
};
use crate::error::{Result, StoreError};
use crate::media::Format;
use crate::storage::atomic::atomic_write_json;
use crate::storage::Model;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Build the bundle for `model` in `root_dir`.
///
/// Blobs are hard-linked (copied when the filesystem refuses links). The
/// directory is expected to be empty or absent.
pub fn materialize(root_dir: &Path, model: &Model) -> Result<Bundle> {
    fs::create_dir_all(root_dir)
        .map_err(|e| StoreError::io_op("Failed to create bundle directory", e, root_dir))?;

    let mut bundle = Bundle {
        dir: root_dir.to_path_buf(),
        gguf_file: None,
        safetensors_file: None,
        mmproj_file: None,
        chat_template_file: None,
        runtime_config: model.config().clone(),
    };

    let gguf = model.gguf_paths();
    let safetensors = model.safetensors_paths();
    if !gguf.is_empty() {
        bundle.gguf_file = Some(link_weights(root_dir, Format::Gguf, &gguf)?);
    } else if !safetensors.is_empty() {
        bundle.safetensors_file = Some(link_weights(root_dir, Format::Safetensors, &safetensors)?);
    } else {
        return Err(StoreError::Other(format!(
            "model {} has no supported weights (neither GGUF nor safetensors)",
            model.id()
        )));
    }

    if let Some(path) = model.mmproj_path() {
        link_blob(path, &root_dir.join(MMPROJ_FILENAME))?;
        bundle.mmproj_file = Some(MMPROJ_FILENAME.to_string());
    }

    if let Some(path) = model.chat_template_path() {
        link_blob(path, &root_dir.join(CHAT_TEMPLATE_FILENAME))?;
        bundle.chat_template_file = Some(CHAT_TEMPLATE_FILENAME.to_string());
    }

    if let Some(path) = model.config_archive_path() {
        extract_config_archive(path, root_dir)?;
    }

    atomic_write_json(
        &root_dir.join(RUNTIME_CONFIG_FILENAME),
        &bundle.runtime_config,
        false,
    )?;

    debug!("Materialized bundle for {} at {}", model.id(), root_dir.display());
    Ok(bundle)
}

/// Link weight blobs under their bundle names; returns the first file name.
fn link_weights(root_dir: &Path, format: Format, blobs: &[PathBuf]) -> Result<String> {
    let mut first = None;
    for (i, blob) in blobs.iter().enumerate() {
        let name = weights_filename(format, i, blobs.len());
        link_blob(blob, &root_dir.join(&name))?;
        first.get_or_insert(name);
    }
    first.ok_or_else(|| StoreError::Other("no weights to link".to_string()))
}

fn link_blob(blob: &Path, target: &Path) -> Result<()> {
    if fs::hard_link(blob, target).is_ok() {
        return Ok(());
    }
    debug!(
        "Hard link {} -> {} failed, copying",
        blob.display(),
        target.display()
    );
    fs::copy(blob, target).map_err(|e| StoreError::Io {
        message: format!(
            "Failed to link {} into bundle at {}: {}",
            blob.display(),
            target.display(),
            e
        ),
        path: Some(target.to_path_buf()),
        source: Some(e),
    })?;
    Ok(())
}

/// Extract a tar archive into `dest_dir`.
///
/// Only directories and regular files are extracted; links and special
/// entries are skipped. Entries that would land outside `dest_dir` or
/// replace a file already in it abort the extraction.
pub fn extract_config_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| StoreError::Io {
        message: format!("Failed to open config archive: {}", e),
        path: Some(archive_path.to_path_buf()),
        source: Some(e),
    })?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    let entries = archive
        .entries()
        .map_err(|e| StoreError::io_op("Failed to read config archive", e, archive_path))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| StoreError::io_op("Failed to read config archive", e, archive_path))?;
        let relative = entry
            .path()
            .map_err(|e| StoreError::io_op("Invalid entry in config archive", e, archive_path))?
            .into_owned();
        let target = contained_path(dest_dir, &relative)?;

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| StoreError::io_op("Failed to create directory", e, &target))?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io_op("Failed to create directory", e, parent))?;
            }
            // Never open an existing file: bundle files are hard links to blobs.
            let mut out = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        StoreError::Conflict {
                            message: format!(
                                "config archive entry {} collides with an existing bundle file",
                                relative.display()
                            ),
                        }
                    } else {
                        StoreError::io_op("Failed to create file", e, &target)
                    }
                })?;
            io::copy(&mut entry, &mut out)
                .map_err(|e| StoreError::io_op("Failed to extract", e, &target))?;
        } else {
            debug!("Skipping {:?} entry {}", entry_type, relative.display());
        }
    }

    Ok(())
}

/// Join `relative` onto `base`, refusing anything that escapes `base`.
fn contained_path(base: &Path, relative: &Path) -> Result<PathBuf> {
    let mut target = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::Integrity {
                    message: format!(
                        "archive entry {:?} attempts to escape destination directory",
                        relative.display().to_string()
                    ),
                });
            }
        }
    }
    Ok(target)
}
