use portico::admin::{AdminServer, PKG_NAME, VERSION};
use portico::config::Config;
use portico::gateway::GatewayManager;
use portico::proxy::ProxyServer;
use portico::sync::SyncRunner;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portico=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Gateway lifecycle manager
    let gateway = GatewayManager::new(config.gateway.clone(), config.storage.clone());

    // Backup sync (only when storage is configured)
    let sync_runner = config.storage.clone().map(SyncRunner::new);

    // Proxy server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&gateway),
        config.server.request_timeout(),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin server (always loopback)
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin = AdminServer::new(
        admin_addr,
        Arc::clone(&gateway),
        sync_runner.clone(),
        shutdown_rx.clone(),
        admin_token,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Scheduled backup sync
    if let Some(ref runner) = sync_runner {
        let runner = Arc::clone(runner);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            runner.run_scheduled(rx).await;
        });
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP triggers a sync
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    match sync_runner {
                        Some(ref runner) => {
                            info!("Received SIGHUP, running backup sync...");
                            let runner = Arc::clone(runner);
                            tokio::spawn(async move {
                                runner.run_once().await;
                            });
                        }
                        None => {
                            warn!("Received SIGHUP but storage sync is not configured");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop the gateway child, if we spawned one
    gateway.stop(SHUTDOWN_GRACE).await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway shim");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        command = %config.gateway.command,
        port = config.gateway.port,
        startup_marker = %config.gateway.startup_marker,
        startup_timeout_secs = config.gateway.startup_timeout_secs,
        "Gateway configuration"
    );
    match config.storage {
        Some(ref storage) => {
            info!(
                bucket = %storage.bucket,
                mount_path = %storage.mount_path,
                data_dir = %storage.data_dir,
                sync_interval_secs = storage.sync_interval_secs,
                "Storage sync configuration"
            );
        }
        None => {
            info!("Storage sync disabled (no [storage] section)");
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Exclusive non-blocking lock so a second instance fails fast
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        use std::io::Write;
        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}
