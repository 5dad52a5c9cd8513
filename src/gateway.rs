//! Locating and starting the gateway process.
//!
//! The check is idempotent: a gateway already bound to the configured port
//! or visible in the process list is reused without side effects. Only when
//! neither probe finds one is a new process spawned and awaited.

use crate::config::{GatewayConfig, StorageConfig};
use crate::env::gateway_env;
use crate::wait::{marker, wait_for, ProcessHandle};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// How `ensure_running` satisfied the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    /// A gateway was already up; nothing was spawned
    AlreadyRunning,
    /// A new gateway process was spawned and reported its startup marker
    Started,
}

/// Owns the (at most one) gateway child process and the probes used to
/// find an externally started gateway.
///
/// Designed to be shared behind an `Arc` across the proxy and admin tasks;
/// the constructor returns `Arc<Self>` to enforce this.
pub struct GatewayManager {
    gateway: GatewayConfig,
    storage: Option<StorageConfig>,
    handle: Mutex<Option<ProcessHandle>>,
}

impl GatewayManager {
    pub fn new(gateway: GatewayConfig, storage: Option<StorageConfig>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            storage,
            handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.gateway
    }

    pub fn port(&self) -> u16 {
        self.gateway.port
    }

    /// True if something accepts connections on the gateway port
    pub fn port_open(port: u16) -> bool {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        std::net::TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
    }

    /// Scan the process list for a process with the given name
    pub fn find_process(name: &str) -> Option<u32> {
        let mut sys = System::new();
        sys.refresh_processes();
        sys.processes()
            .iter()
            .find(|(_, process)| process.name() == name)
            .map(|(pid, _)| pid.as_u32())
    }

    /// Whether a gateway currently appears to be up (port probe only)
    pub async fn is_running(&self) -> bool {
        let port = self.gateway.port;
        tokio::task::spawn_blocking(move || Self::port_open(port))
            .await
            .unwrap_or(false)
    }

    /// Locate a running gateway, or spawn one and wait for its startup
    /// marker. Serialized internally so concurrent callers cannot race two
    /// spawns.
    pub async fn ensure_running(&self) -> anyhow::Result<GatewayStatus> {
        let mut guard = self.handle.lock().await;

        // A child we spawned earlier and that has not terminated counts as
        // running without any further probing.
        if let Some(child) = guard.as_mut() {
            if child.try_status().is_none() {
                return Ok(GatewayStatus::AlreadyRunning);
            }
            warn!("Previously spawned gateway has exited");
            *guard = None;
        }

        let port = self.gateway.port;
        let name = self.gateway.process_name();
        let found = tokio::task::spawn_blocking(move || {
            if Self::port_open(port) {
                return Some(None);
            }
            Self::find_process(&name).map(Some)
        })
        .await?;

        match found {
            Some(None) => {
                debug!(port, "Gateway already listening");
                return Ok(GatewayStatus::AlreadyRunning);
            }
            Some(Some(pid)) => {
                debug!(pid, "Gateway found in process list");
                return Ok(GatewayStatus::AlreadyRunning);
            }
            None => {}
        }

        let handle = self.start().await?;
        *guard = Some(handle);
        Ok(GatewayStatus::Started)
    }

    /// Spawn the gateway and wait for its startup marker.
    ///
    /// On marker timeout this reports failure but leaves the spawned process
    /// running; whether to retry is the caller's decision.
    async fn start(&self) -> anyhow::Result<ProcessHandle> {
        info!(command = %self.gateway.command, "Starting gateway");

        let mut cmd = Command::new(&self.gateway.command);
        cmd.args(&self.gateway.args);
        if let Some(ref dir) = self.gateway.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in gateway_env(&self.gateway, self.storage.as_ref()) {
            cmd.env(key, value);
        }

        let mut handle = ProcessHandle::spawn(cmd)?;
        let pid = handle.id().unwrap_or(0);
        info!(pid, "Gateway process spawned");

        let timeout = self.gateway.startup_timeout();
        let outcome = wait_for(&mut handle, timeout, marker(&self.gateway.startup_marker)).await;

        if !outcome.completed {
            anyhow::bail!(
                "Gateway did not report startup marker {:?} within {}s",
                self.gateway.startup_marker,
                timeout.as_secs()
            );
        }

        let lowered = outcome.output.to_lowercase();
        if !lowered.contains(&self.gateway.startup_marker.to_lowercase()) {
            // Terminal status without the marker: treat as startup failure
            anyhow::bail!(
                "Gateway exited before reporting startup marker {:?}: {}",
                self.gateway.startup_marker,
                handle.stderr_snapshot().trim()
            );
        }

        info!(pid, "Gateway is up");
        Ok(handle)
    }

    /// Stop the child this manager spawned, if any. Gateways found via the
    /// port or process-list probes are never touched.
    pub async fn stop(&self, grace: Duration) {
        let mut guard = self.handle.lock().await;
        if let Some(child) = guard.as_mut() {
            info!("Stopping gateway");
            child.terminate(grace).await;
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn gateway_config(command: &str, port: u16) -> GatewayConfig {
        Config::from_toml(&format!(
            r#"
            [gateway]
            command = "{}"
            port = {}
            process_name = "portico-test-gateway-{}"
            startup_marker = "serving"
            startup_timeout_secs = 3
            "#,
            command, port, port
        ))
        .unwrap()
        .gateway
    }

    #[tokio::test]
    async fn test_existing_listener_prevents_spawn() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // The command does not exist, so any spawn attempt would error out
        let manager = GatewayManager::new(
            gateway_config("definitely-not-a-real-command-xyz", port),
            None,
        );

        let status = manager.ensure_running().await.unwrap();
        assert_eq!(status, GatewayStatus::AlreadyRunning);
        assert!(manager.is_running().await);
    }

    #[tokio::test]
    async fn test_port_open_false_for_unbound_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!GatewayManager::port_open(port));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_waits_for_marker() {
        use std::os::unix::fs::PermissionsExt;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free_port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-gateway");
        std::fs::write(
            &script,
            "#!/bin/sh\necho booting\nsleep 1\necho now SERVING requests\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manager = GatewayManager::new(
            gateway_config(&script.to_string_lossy(), free_port),
            None,
        );

        let status = manager.ensure_running().await.unwrap();
        assert_eq!(status, GatewayStatus::Started);

        // Second call reuses the tracked child without spawning again
        let status = manager.ensure_running().await.unwrap();
        assert_eq!(status, GatewayStatus::AlreadyRunning);

        manager.stop(Duration::from_secs(1)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_failure_when_marker_never_appears() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free_port = listener.local_addr().unwrap().port();
        drop(listener);

        // Exits immediately without printing the marker
        let manager = GatewayManager::new(gateway_config("true", free_port), None);

        let err = manager.ensure_running().await.unwrap_err();
        assert!(err.to_string().contains("startup marker"));
    }
}
