use super::{Bundle, RUNTIME_CONFIG_FILENAME};
use crate::error::{Result, StoreError};
use crate::manifest::ModelConfig;
use std::fs;
use std::path::Path;

/// Read back a bundle from `root_dir`.
///
/// Weights are found by suffix among non-hidden files, taking the first in
/// lexical order (the first shard). More than one projector or template is a
/// conflict; none is fine.
pub fn parse(root_dir: &Path) -> Result<Bundle> {
    let meta = fs::metadata(root_dir)
        .map_err(|e| StoreError::io_op("Failed to inspect bundle", e, root_dir))?;
    if !meta.is_dir() {
        return Err(StoreError::Other(format!(
            "bundle root {} is not a directory",
            root_dir.display()
        )));
    }

    let mut names: Vec<String> = fs::read_dir(root_dir)
        .map_err(|e| StoreError::io_op("Failed to read bundle", e, root_dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();

    let with_suffix = |suffix: &str| -> Vec<String> {
        names
            .iter()
            .filter(|n| n.ends_with(suffix))
            .cloned()
            .collect()
    };

    let gguf_file = with_suffix(".gguf").into_iter().next();
    let safetensors_file = with_suffix(".safetensors").into_iter().next();
    if gguf_file.is_none() && safetensors_file.is_none() {
        return Err(StoreError::Other(
            "no supported model weights found (neither GGUF nor safetensors)".to_string(),
        ));
    }

    let mmproj_file = at_most_one(with_suffix(".mmproj"), "projector")?;
    let chat_template_file = at_most_one(with_suffix(".jinja"), "chat template")?;

    let config_path = root_dir.join(RUNTIME_CONFIG_FILENAME);
    let raw = fs::read(&config_path)
        .map_err(|e| StoreError::io_op("Failed to read runtime config", e, &config_path))?;
    let runtime_config: ModelConfig = serde_json::from_slice(&raw).map_err(|e| StoreError::Json {
        message: format!("Failed to decode runtime config {}: {}", config_path.display(), e),
        source: Some(e),
    })?;

    Ok(Bundle {
        dir: root_dir.to_path_buf(),
        gguf_file,
        safetensors_file,
        mmproj_file,
        chat_template_file,
        runtime_config,
    })
}

fn at_most_one(mut files: Vec<String>, what: &str) -> Result<Option<String>> {
    if files.len() > 1 {
        return Err(StoreError::Conflict {
            message: format!(
                "found {} {} files ({}), only 1 is supported",
                files.len(),
                what,
                files.join(", ")
            ),
        });
    }
    Ok(files.pop())
}
