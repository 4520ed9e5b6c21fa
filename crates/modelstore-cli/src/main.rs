//! mdlstore - command-line front end for the local model store.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelstore_core::config::StoreConfig;
use modelstore_core::{LocalStore, StoreOptions};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mdlstore")]
#[command(about = "Manage a local content-addressable model store")]
#[command(version)]
struct Args {
    /// Store root directory (defaults to <data dir>/model-store)
    #[arg(long, global = true, env = StoreConfig::ROOT_ENV_VAR)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Keep index.json.bak with the previous index on every change
    #[arg(long, global = true)]
    keep_index_backup: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Package local weights (and auxiliary files) into the store
    Package(commands::PackageArgs),

    /// List stored models
    Ls {
        /// Print the index entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the manifest and config of a model
    Inspect { reference: String },

    /// Add tags to a model
    Tag {
        reference: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Remove tags
    Untag {
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Delete models and any blobs no other model uses
    Rm {
        #[arg(required = true)]
        references: Vec<String>,
    },

    /// Materialize the runtime bundle of a model and print its location
    Bundle { reference: String },

    /// Show disk usage of the store
    Df,

    /// Delete everything in the store
    Reset {
        /// Required; reset cannot be undone
        #[arg(long)]
        force: bool,
    },

    /// Print the store layout version
    Version,
}

fn default_store_root() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(StoreConfig::DEFAULT_DIR_NAME))
        .context("could not determine the platform data directory; pass --store")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let root = match args.store {
        Some(path) => path,
        None => default_store_root()?,
    };
    debug!("Store root: {}", root.display());

    let options = StoreOptions {
        keep_index_backup: args.keep_index_backup,
    };
    let store = LocalStore::open_with_options(root.clone(), options)
        .await
        .with_context(|| format!("failed to open store at {}", root.display()))?;

    match args.command {
        Command::Package(package) => commands::package(&store, package).await,
        Command::Ls { json } => commands::list(&store, json).await,
        Command::Inspect { reference } => commands::inspect(&store, &reference).await,
        Command::Tag { reference, tags } => commands::tag(&store, &reference, &tags).await,
        Command::Untag { tags } => commands::untag(&store, &tags).await,
        Command::Rm { references } => commands::remove(&store, &references).await,
        Command::Bundle { reference } => commands::bundle(&store, &reference).await,
        Command::Df => commands::disk_usage(&store).await,
        Command::Reset { force } => commands::reset(&store, force).await,
        Command::Version => {
            println!("{}", store.version());
            Ok(())
        }
    }
}
