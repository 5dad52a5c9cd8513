//! Device pairing through the gateway-management CLI.
//!
//! The CLI's exit code is unreliable, so approval is detected by the
//! case-insensitive substring "approved" in its output.

use crate::config::GatewayConfig;
use crate::wait::{marker, wait_for, ProcessHandle};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Success token in the CLI output
pub const APPROVAL_MARKER: &str = "approved";

#[derive(Debug, Clone, serde::Serialize)]
pub struct PairingOutcome {
    pub approved: bool,
    pub output: String,
}

/// Approve a pairing request for a device through the CLI.
///
/// The CLI is always pointed at the local gateway WebSocket URL. A timeout
/// yields `approved = false` with whatever output accumulated; retrying is
/// the caller's decision.
pub async fn approve_device(config: &GatewayConfig, device_id: &str) -> anyhow::Result<PairingOutcome> {
    let mut cmd = cli_command(config)?;
    cmd.arg("devices")
        .arg("approve")
        .arg(device_id)
        .arg("--url")
        .arg(gateway_ws_url(config));

    debug!(device_id, "Running pairing approval");

    let mut handle = ProcessHandle::spawn(cmd)?;
    let outcome = wait_for(&mut handle, config.cli_timeout(), marker(APPROVAL_MARKER)).await;

    // Re-apply the heuristic to the final output rather than trusting the
    // completion flag: process exit also counts as completed, approved or not.
    let approved = outcome.output.to_lowercase().contains(APPROVAL_MARKER);

    if approved {
        info!(device_id, "Device pairing approved");
    } else if !outcome.completed {
        warn!(
            device_id,
            timeout_secs = config.cli_timeout_secs,
            "Pairing CLI timed out without approval"
        );
    } else {
        warn!(device_id, "Pairing CLI finished without approval marker");
    }

    Ok(PairingOutcome {
        approved,
        output: outcome.output,
    })
}

/// Build the CLI command, splitting a configured command line like
/// "npx gateway-cli" into program and leading arguments
fn cli_command(config: &GatewayConfig) -> anyhow::Result<Command> {
    let mut parts = shell_words::split(&config.cli_command)
        .map_err(|e| anyhow::anyhow!("Invalid CLI command {:?}: {}", config.cli_command, e))?;
    anyhow::ensure!(!parts.is_empty(), "Gateway CLI command is empty");

    let program = parts.remove(0);
    let mut cmd = Command::new(program);
    cmd.args(parts);
    Ok(cmd)
}

/// Fixed local WebSocket URL the CLI is pointed at
fn gateway_ws_url(config: &GatewayConfig) -> String {
    format!("ws://127.0.0.1:{}", config.port)
}
