//! CloudFuse Daemon - FUSE filesystem for cloud storage accounts
//!
//! Mounts the account as a local directory. File content is served from a
//! verified local cache and local edits are uploaded as patches.

mod api;
mod cache;
mod config;
mod fs;
mod mount;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use api::{ApiClient, BlockingRemote, Connection, FolderKey};
use cache::FileCache;
use config::{Cli, Command, DaemonConfig};
use fs::CloudFilesystem;
use mount::MountSession;

/// Name shown in the mount table
const FS_NAME: &str = "cloudfuse";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = DaemonConfig::from_args(cli.account)?;

    let client = match connect(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to connect");
            return Err(e);
        }
    };

    match cli.command {
        Command::Mount { mountpoint } => run_mount(&config, client, mountpoint).await,
        Command::Status => print_status(&config, &client).await,
    }
}

/// Negotiate a session and build the API client
async fn connect(config: &DaemonConfig) -> Result<ApiClient> {
    info!(
        api = %config.api_base,
        email = %config.credentials.email,
        "Connecting..."
    );

    let conn = Connection::connect(
        &config.api_base,
        config.credentials.clone(),
        config.max_retries,
        config.flags,
    )
    .await
    .context("Failed to authenticate")?;

    if conn.flags().lazy_ssl {
        warn!("TLS certificate verification is disabled");
    }

    Ok(ApiClient::new(Arc::new(conn)))
}

/// Mount the account and serve it until Ctrl+C
async fn run_mount(config: &DaemonConfig, client: ApiClient, mountpoint: PathBuf) -> Result<()> {
    let file_cache = FileCache::new(config.cache_dir.clone())?;
    let remote = BlockingRemote::new(client, tokio::runtime::Handle::current());
    let filesystem = CloudFilesystem::new(file_cache, remote);

    let session = MountSession::start(filesystem, mountpoint, FS_NAME).await?;

    info!(
        mountpoint = %session.mountpoint().display(),
        "Mounted successfully. Press Ctrl+C to unmount."
    );

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal, unmounting...");
    session.unmount().await;

    info!("Shutdown complete.");
    Ok(())
}

/// Print account and local cache status
async fn print_status(config: &DaemonConfig, client: &ApiClient) -> Result<()> {
    let device_revision = client
        .device_status()
        .await
        .context("Failed to get device status")?;
    let (folders, files) = client
        .folder_content(&FolderKey::root())
        .await
        .context("Failed to list root folder")?;

    println!("Account:          {}", config.credentials.email);
    println!("Device revision:  {}", device_revision);
    println!(
        "Root folder:      {} folders, {} files",
        folders.len(),
        files.len()
    );
    println!("Cache directory:  {}", config.cache_dir.display());
    println!("Cached files:     {}", count_cached_files(&config.cache_dir));

    Ok(())
}

/// Number of cached blobs, not counting leftover temp files
fn count_cached_files(cache_dir: &Path) -> usize {
    std::fs::read_dir(cache_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().map_or(true, |ext| ext != "tmp"))
                .count()
        })
        .unwrap_or(0)
}
