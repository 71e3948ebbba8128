//! Command line and daemon configuration
//!
//! Credentials come from flags or the environment; everything else has a
//! default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::api::{ConnectionFlags, Credentials};

/// Default API host
pub const DEFAULT_SERVER: &str = "www.mediafire.com";

/// API version path appended to the server
const API_PATH: &str = "api/1.3/";

/// Application id used when none is configured
pub const DEFAULT_APP_ID: &str = "42709";

#[derive(Debug, Parser)]
#[command(name = "cloudfuse-daemon")]
#[command(version)]
#[command(about = "Mount a cloud storage account as a local directory")]
pub struct Cli {
    #[command(flatten)]
    pub account: AccountArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mount the account at a directory until Ctrl+C
    Mount {
        /// Directory to mount at (created if missing)
        mountpoint: PathBuf,
    },
    /// Authenticate and print account and cache status
    Status,
}

/// Account and connection options shared by all commands
#[derive(Debug, Args)]
pub struct AccountArgs {
    /// Account e-mail
    #[arg(long, global = true, env = "CLOUDFUSE_EMAIL")]
    pub email: Option<String>,

    /// Account password
    #[arg(long, global = true, env = "CLOUDFUSE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Application id
    #[arg(long, global = true, env = "CLOUDFUSE_APP_ID", default_value = DEFAULT_APP_ID)]
    pub app_id: String,

    /// Application api key
    #[arg(long, global = true, env = "CLOUDFUSE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// API server host
    #[arg(long, global = true, env = "CLOUDFUSE_SERVER", default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Directory holding cached file content
    #[arg(long, global = true, env = "CLOUDFUSE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Attempts per remote call on timeouts and token errors
    #[arg(long, global = true, default_value_t = 10)]
    pub max_retries: u32,

    /// Do not verify TLS certificates
    #[arg(long, global = true)]
    pub lazy_ssl: bool,
}

/// Resolved daemon configuration
#[derive(Clone)]
pub struct DaemonConfig {
    pub api_base: String,
    pub credentials: Credentials,
    pub cache_dir: PathBuf,
    pub max_retries: u32,
    pub flags: ConnectionFlags,
}

impl DaemonConfig {
    /// Resolve command line options into a configuration
    pub fn from_args(args: AccountArgs) -> Result<Self> {
        let email = args
            .email
            .context("No account e-mail given (--email or CLOUDFUSE_EMAIL)")?;
        let password = args
            .password
            .context("No account password given (--password or CLOUDFUSE_PASSWORD)")?;

        let cache_dir = match args.cache_dir {
            Some(dir) => dir,
            None => default_cache_dir()?,
        };

        Ok(Self {
            api_base: api_base(&args.server),
            credentials: Credentials {
                email,
                password,
                app_id: args.app_id,
                api_key: args.api_key.unwrap_or_default(),
            },
            cache_dir,
            max_retries: args.max_retries.max(1),
            flags: ConnectionFlags {
                lazy_ssl: args.lazy_ssl,
            },
        })
    }
}

/// API base URL for a server host
fn api_base(server: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        format!("{}/{}", server, API_PATH)
    } else {
        format!("https://{}/{}", server, API_PATH)
    }
}

/// Platform cache directory for file content
fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|dir| dir.join("cloudfuse"))
        .context("Could not determine a cache directory; pass --cache-dir")
}
