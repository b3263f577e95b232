//! Command line client for relaydrive.

mod manifest;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use manifest::Manifest;
use relaydrive_core::DriverConfig;
use relaydrive_storage::{ChunkUpload, Driver, copy_into};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "relaydrive.toml";

#[derive(Parser)]
#[command(name = "relaydrive")]
#[command(about = "Store files as chunked chat attachments")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "RELAYDRIVE_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file and write its manifest
    Put {
        /// File to upload
        file: PathBuf,

        /// Where to write the manifest
        #[arg(long)]
        manifest: PathBuf,

        /// Name recorded in the manifest (default: the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Download a file described by a manifest
    Get {
        /// Manifest written by `put`
        manifest: PathBuf,

        /// Byte offset to start reading at
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Re-sign the expired chunks of a manifest
    Refresh {
        /// Manifest to update in place
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let driver = Driver::new(&config).context("failed to initialize storage driver")?;

    tokio::select! {
        result = run(&driver, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            driver.shutdown();
            bail!("interrupted")
        }
    }
}

async fn run(driver: &Driver, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            file,
            manifest,
            name,
        } => put(driver, &file, &manifest, name).await,
        Commands::Get {
            manifest,
            offset,
            output,
        } => get(driver, &manifest, offset, output.as_deref()).await,
        Commands::Refresh { manifest } => {
            let (refreshed, rewritten) = refresh(driver, &manifest).await?;
            println!("refreshed {rewritten} of {} chunks", refreshed.nodes.len());
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<DriverConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("RELAYDRIVE_").split("__"));

    let config: DriverConfig = figment
        .extract()
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn put(
    driver: &Driver,
    file: &Path,
    manifest_path: &Path,
    name: Option<String>,
) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", file.display()))?,
    };

    let mut source = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;

    let (mut writer, mut receiver) = driver.writer();
    let copied = copy_into(&mut source, writer.as_mut())
        .await
        .context("upload failed")?;
    writer.close().await.context("upload failed")?;
    drop(writer);

    let mut uploads: Vec<ChunkUpload> = Vec::new();
    while let Some(upload) = receiver.recv().await {
        uploads.push(upload);
    }

    let manifest = Manifest::from_uploads(name, uploads)?;
    if manifest.size != copied {
        bail!(
            "uploaded {} bytes but read {copied} from {}",
            manifest.size,
            file.display()
        );
    }
    manifest.save(manifest_path)?;

    tracing::info!(
        size = manifest.size,
        chunks = manifest.nodes.len(),
        manifest = %manifest_path.display(),
        "file stored"
    );
    Ok(())
}

/// Re-sign expired chunks, persisting the manifest when anything changed.
async fn refresh(driver: &Driver, manifest_path: &Path) -> Result<(Manifest, usize)> {
    let mut manifest = Manifest::load(manifest_path)?;
    let file_id = manifest_path.to_string_lossy();

    let rewritten = driver
        .update_nodes(&file_id, &mut manifest.nodes)
        .await
        .context("failed to refresh expired chunks")?;
    if rewritten > 0 {
        manifest.save(manifest_path)?;
    }
    Ok((manifest, rewritten))
}

async fn get(
    driver: &Driver,
    manifest_path: &Path,
    offset: u64,
    output: Option<&Path>,
) -> Result<()> {
    let (manifest, _) = refresh(driver, manifest_path).await?;

    let mut reader = driver
        .new_reader(manifest.nodes, offset)
        .with_context(|| format!("cannot read {} from offset {offset}", manifest.name))?;

    let copied = match output {
        Some(path) => {
            let mut out = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            let copied = tokio::io::copy(&mut reader, &mut out).await?;
            out.flush().await?;
            copied
        }
        None => {
            let mut out = tokio::io::stdout();
            let copied = tokio::io::copy(&mut reader, &mut out).await?;
            out.flush().await?;
            copied
        }
    };
    reader.close().context("failed to close reader")?;

    tracing::debug!(bytes = copied, name = %manifest.name, "file read");
    Ok(())
}
