//! Subcommand implementations.

use anyhow::{bail, Context, Result};
use clap::Args;
use modelstore_core::gguf::format_size;
use modelstore_core::progress::write_success;
use modelstore_core::{LocalStore, ModelBuilder, ProgressSink};
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct PackageArgs {
    /// GGUF or safetensors weight files (one shard is enough if its siblings
    /// sit next to it)
    #[arg(required_unless_present = "from")]
    files: Vec<PathBuf>,

    /// Re-package an existing model instead of local weights
    #[arg(long, conflicts_with = "files")]
    from: Option<String>,

    /// Multimodal projector file
    #[arg(long)]
    mmproj: Option<PathBuf>,

    /// Chat template file
    #[arg(long)]
    template: Option<PathBuf>,

    /// License file (repeatable)
    #[arg(long)]
    license: Vec<PathBuf>,

    /// Tar archive of extra runtime config files
    #[arg(long)]
    config_archive: Option<PathBuf>,

    /// Default context window for the runtime
    #[arg(long)]
    context_size: Option<u64>,

    /// Tag to apply, e.g. `smollm:135m` (repeatable)
    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Stream line-delimited JSON progress to stdout
    #[arg(long)]
    progress: bool,
}

impl PackageArgs {
    fn adds_layers(&self) -> bool {
        !self.files.is_empty()
            || self.mmproj.is_some()
            || self.template.is_some()
            || !self.license.is_empty()
            || self.config_archive.is_some()
    }
}

fn builder_for_files(files: &[PathBuf]) -> Result<ModelBuilder> {
    let has_ext = |path: &Path, ext: &str| path.extension().is_some_and(|e| e == ext);
    if files.iter().all(|f| has_ext(f, "gguf")) {
        Ok(ModelBuilder::from_gguf(files)?)
    } else if files.iter().all(|f| has_ext(f, "safetensors")) {
        Ok(ModelBuilder::from_safetensors(files)?)
    } else {
        bail!("weights must be all .gguf or all .safetensors files")
    }
}

pub async fn package(store: &LocalStore, args: PackageArgs) -> Result<()> {
    let lightweight = args.from.is_some() && !args.adds_layers();

    let mut builder = match &args.from {
        Some(reference) => ModelBuilder::from_model(&store.read(reference).await?),
        None => builder_for_files(&args.files)?,
    };
    if let Some(path) = &args.mmproj {
        builder = builder.with_multimodal_projector(path)?;
    }
    if let Some(path) = &args.template {
        builder = builder.with_chat_template(path)?;
    }
    for path in &args.license {
        builder = builder.with_license(path)?;
    }
    if let Some(path) = &args.config_archive {
        builder = builder.with_config_archive(path)?;
    }
    if let Some(size) = args.context_size {
        builder = builder.with_context_size(size);
    }
    let image = builder.build()?;

    let id = if lightweight {
        store.write_lightweight(&image, &args.tags).await?
    } else if args.progress {
        store
            .write(&image, &args.tags, Some(ProgressSink::stdout()))
            .await?
    } else {
        store.write(&image, &args.tags, None).await?
    };

    if args.progress {
        write_success(&mut std::io::stdout(), format!("Stored {}", id))?;
    } else {
        println!("{}", id);
    }
    Ok(())
}

pub async fn list(store: &LocalStore, as_json: bool) -> Result<()> {
    let entries = store.list().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{:<14} {:<12} {:>12}  TAGS", "ID", "FORMAT", "SIZE");
    for entry in entries {
        let (format, size) = match store.read(&entry.id.to_string()).await {
            Ok(model) => (
                model.format().map(|f| f.to_string()).unwrap_or_default(),
                format_size(model.size()),
            ),
            Err(e) => ("?".to_string(), format!("error: {}", e.kind())),
        };
        println!(
            "{:<14} {:<12} {:>12}  {}",
            entry.id.short(),
            format,
            size,
            entry.tags.join(", ")
        );
    }
    Ok(())
}

pub async fn inspect(store: &LocalStore, reference: &str) -> Result<()> {
    let model = store.read(reference).await?;
    let out = json!({
        "id": model.id(),
        "tags": model.tags(),
        "size": model.size(),
        "manifest": model.manifest(),
        "config": model.config_file(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn tag(store: &LocalStore, reference: &str, tags: &[String]) -> Result<()> {
    store.add_tags(reference, tags).await?;
    Ok(())
}

pub async fn untag(store: &LocalStore, tags: &[String]) -> Result<()> {
    let ids = store.remove_tags(tags).await?;
    for (tag, id) in tags.iter().zip(ids) {
        println!("Untagged {} ({})", tag, id.short());
    }
    Ok(())
}

pub async fn remove(store: &LocalStore, references: &[String]) -> Result<()> {
    for reference in references {
        let outcome = store
            .delete(reference)
            .await
            .with_context(|| format!("failed to delete {}", reference))?;
        println!("Deleted {}", outcome.id);
        for warning in &outcome.warnings {
            eprintln!("warning: {}", warning);
        }
    }
    Ok(())
}

pub async fn bundle(store: &LocalStore, reference: &str) -> Result<()> {
    let bundle = store.bundle(reference).await?;
    println!("{}", bundle.root_dir().display());
    Ok(())
}

pub async fn disk_usage(store: &LocalStore) -> Result<()> {
    let usage = store.disk_usage().await?;
    println!("blobs      {:>12}", format_size(usage.blobs));
    println!("manifests  {:>12}", format_size(usage.manifests));
    println!("bundles    {:>12}  (hard links, mostly shared)", format_size(usage.bundles));
    println!("total      {:>12}", format_size(usage.total()));
    Ok(())
}

pub async fn reset(store: &LocalStore, force: bool) -> Result<()> {
    if !force {
        bail!(
            "refusing to delete everything in {} without --force",
            store.root().display()
        );
    }
    store.reset().await?;
    println!("Reset {}", store.root().display());
    Ok(())
}
