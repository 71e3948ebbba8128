//! Mount Session - Controls the FUSE mount lifecycle
//!
//! Runs the filesystem on a blocking task and tears it down on request.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fuser::MountOption;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::fs::CloudFilesystem;

/// A running FUSE mount
pub struct MountSession {
    /// Mount point path
    mountpoint: PathBuf,
    /// Background task running the FUSE session
    task: JoinHandle<()>,
}

impl MountSession {
    /// Mount a filesystem at the specified path
    ///
    /// # Arguments
    /// * `filesystem` - Filesystem to serve
    /// * `mountpoint` - Directory to mount at (created if missing)
    /// * `fs_name` - Name shown in the mount table
    pub async fn start(
        filesystem: CloudFilesystem,
        mountpoint: PathBuf,
        fs_name: &str,
    ) -> Result<Self> {
        info!(mountpoint = %mountpoint.display(), "Mounting...");

        // Create mountpoint directory if needed
        if !mountpoint.exists() {
            std::fs::create_dir_all(&mountpoint)
                .context("Failed to create mountpoint directory")?;
        }

        // Configure mount options
        let options = vec![
            MountOption::FSName(fs_name.to_string()),
            MountOption::NoAtime,     // Don't update access times (performance)
            MountOption::AutoUnmount, // Auto-unmount on process exit
        ];

        let mp = mountpoint.clone();

        // Spawn FUSE mount in a blocking task (fuser is sync)
        let task = tokio::task::spawn_blocking(move || {
            info!("Starting FUSE session...");

            match fuser::mount2(filesystem, &mp, &options) {
                Ok(()) => info!("FUSE session ended normally"),
                Err(e) => error!(error = %e, "FUSE session failed"),
            }
        });

        // Give the mount a moment to initialize
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        // Check if the mount task is still running
        if task.is_finished() {
            return Err(anyhow!("Mount failed to start - check that FUSE is installed"));
        }

        info!(mountpoint = %mountpoint.display(), "Mount successful");
        Ok(Self { mountpoint, task })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount and wait for the FUSE session to end
    pub async fn unmount(self) {
        info!(mountpoint = %self.mountpoint.display(), "Unmounting...");

        let output = unmount_command(&self.mountpoint).output();
        match output {
            Ok(output) if output.status.success() => {
                debug!("unmount command succeeded");
            }
            Ok(output) => {
                warn!(
                    "unmount command failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Err(e) => {
                warn!("Failed to run unmount command: {}", e);
            }
        }

        // Wait for the task to finish with timeout
        let timeout_result =
            tokio::time::timeout(tokio::time::Duration::from_secs(5), self.task).await;

        match timeout_result {
            Ok(Ok(())) => info!("Unmount completed"),
            Ok(Err(e)) => warn!(error = %e, "Mount task panicked"),
            Err(_) => warn!("Unmount timed out, task may still be running"),
        }
    }
}

#[cfg(target_os = "linux")]
fn unmount_command(mountpoint: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new("fusermount");
    cmd.arg("-u").arg(mountpoint);
    cmd
}

#[cfg(not(target_os = "linux"))]
fn unmount_command(mountpoint: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new("umount");
    cmd.arg(mountpoint);
    cmd
}
