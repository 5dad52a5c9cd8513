//! Periodic and on-demand synchronization of the data directory into the
//! mounted bucket.
//!
//! The mount layer does not support timestamp updates, so the sync argv
//! avoids `-a`/`-t` style flags. Deletion flags are never passed through
//! when the destination is the mount point: a delete there is permanent
//! data loss.

use crate::config::StorageConfig;
use crate::mount::StorageMount;
use crate::wait::{wait_for, ProcessHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Timestamp marker file written before each sync and verified at the
/// destination afterwards
pub const SYNC_MARKER_FILE: &str = ".sync-stamp";

/// Outcome of a single sync run, derived from output and side artifacts
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub detail: String,
}

impl SyncResult {
    fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Runs the file-sync command against the mounted bucket
pub struct SyncRunner {
    storage: StorageConfig,
    mount: StorageMount,
    last: Mutex<Option<(DateTime<Utc>, SyncResult)>>,
}

/// Build the sync argv.
///
/// `--size-only` replaces timestamp comparison because the mount layer
/// cannot preserve mtimes. When the destination is the mount point, any
/// user-supplied deletion flag is dropped.
pub fn build_sync_args(
    extra_args: &[String],
    source: &Path,
    dest: &Path,
    dest_is_mount: bool,
) -> Vec<String> {
    let mut args = vec!["--recursive".to_string(), "--size-only".to_string()];

    for arg in extra_args {
        if dest_is_mount && is_delete_flag(arg) {
            warn!(arg = %arg, "Dropping deletion flag, destination is the storage mount");
            continue;
        }
        args.push(arg.clone());
    }

    // Trailing slash: sync the directory contents, not the directory itself
    let mut src = source.to_string_lossy().into_owned();
    if !src.ends_with('/') {
        src.push('/');
    }
    args.push(src);
    args.push(dest.to_string_lossy().into_owned());

    args
}

fn is_delete_flag(arg: &str) -> bool {
    arg == "--del" || arg.starts_with("--delete") || arg == "--remove-source-files"
}

impl SyncRunner {
    pub fn new(storage: StorageConfig) -> Arc<Self> {
        let mount = StorageMount::from_storage(&storage);
        Arc::new(Self {
            storage,
            mount,
            last: Mutex::new(None),
        })
    }

    #[cfg(test)]
    fn with_mount(storage: StorageConfig, mount: StorageMount) -> Arc<Self> {
        Arc::new(Self {
            storage,
            mount,
            last: Mutex::new(None),
        })
    }

    /// The most recent sync result, if any
    pub fn last_result(&self) -> Option<(DateTime<Utc>, SyncResult)> {
        self.last.lock().clone()
    }

    /// Run one mount-and-sync cycle.
    ///
    /// Never fatal: every failure is folded into the returned `SyncResult`.
    /// Success is judged by the timestamp marker landing at the destination,
    /// not by the sync command's exit code.
    pub async fn run_once(&self) -> SyncResult {
        let result = self.sync_cycle().await;
        if result.success {
            info!(detail = %result.detail, "Sync completed");
        } else {
            warn!(detail = %result.detail, "Sync failed");
        }
        *self.last.lock() = Some((Utc::now(), result.clone()));
        result
    }

    async fn sync_cycle(&self) -> SyncResult {
        if let Err(e) = self.mount.mount().await {
            return SyncResult::failure(format!("mount failed: {}", e));
        }

        let source = Path::new(&self.storage.data_dir);
        let dest = self.mount.mount_path();

        // Write the timestamp marker into the source tree; the sync carries
        // it to the destination, where it doubles as the success artifact.
        let stamp = Utc::now().to_rfc3339();
        let source_marker = source.join(SYNC_MARKER_FILE);
        if let Err(e) = std::fs::write(&source_marker, format!("{}\n", stamp)) {
            return SyncResult::failure(format!(
                "cannot write sync marker {}: {}",
                source_marker.display(),
                e
            ));
        }

        let args = build_sync_args(&self.storage.sync_extra_args, source, dest, true);
        debug!(command = %self.storage.sync_command, ?args, "Starting sync");

        let mut cmd = Command::new(&self.storage.sync_command);
        cmd.args(&args);

        let mut handle = match ProcessHandle::spawn(cmd) {
            Ok(handle) => handle,
            Err(e) => return SyncResult::failure(format!("cannot spawn sync command: {}", e)),
        };

        // No recognizable success token in the sync output; run to exit or
        // timeout and judge by the marker artifact below.
        let outcome = wait_for(&mut handle, self.storage.sync_timeout(), |_| false).await;
        if !outcome.completed {
            // Partial output is surfaced; the command is left to finish or
            // fail on its own.
            return SyncResult::failure(format!(
                "sync timed out after {}s: {}",
                self.storage.sync_timeout_secs,
                tail(&handle.stderr_snapshot(), 200)
            ));
        }

        let dest_marker = dest.join(SYNC_MARKER_FILE);
        let marker_matches = std::fs::read_to_string(&dest_marker)
            .map(|contents| contents.trim() == stamp)
            .unwrap_or(false);

        if marker_matches {
            SyncResult {
                success: true,
                detail: format!("synced at {}", stamp),
            }
        } else {
            SyncResult::failure(format!(
                "sync marker missing or stale at {}: {}",
                dest_marker.display(),
                tail(&handle.stderr_snapshot(), 200)
            ))
        }
    }

    /// Run syncs on the configured interval until shutdown
    pub async fn run_scheduled(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.storage.sync_interval();
        info!(interval_secs = interval.as_secs(), "Sync scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let start = trimmed.len() - max;
    // Avoid slicing mid-codepoint
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}
