//! Integration tests for the portico shim

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portico::admin::AdminServer;
use portico::config::Config;
use portico::gateway::GatewayManager;
use portico::proxy::ProxyServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Reserve a free local port (bind to 0, read it back, release)
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and get the raw response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    auth: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let auth_header = match auth {
        Some(token) => format!("Authorization: Bearer {}\r\n", token),
        None => String::new(),
    };
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port, auth_header
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Minimal fake gateway: accepts connections and answers every request with
/// a fixed 200 response
async fn spawn_fake_gateway() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = "hello from gateway";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

fn gateway_manager_for_port(port: u16, cli_command: &str) -> Arc<GatewayManager> {
    let config = Config::from_toml(&format!(
        r#"
        [gateway]
        command = "definitely-not-a-real-command-xyz"
        port = {}
        process_name = "portico-integration-none"
        cli_command = "{}"
        cli_timeout_secs = 5
        "#,
        port, cli_command
    ))
    .unwrap();
    GatewayManager::new(config.gateway, None)
}

#[test]
fn test_full_config_parsing() {
    let config = Config::from_toml(
        r#"
        [server]
        port = 8080
        bind = "0.0.0.0"
        admin_port = 9000
        admin_token = "secret"

        [gateway]
        command = "gatewayd"
        args = ["--sandbox"]
        port = 8800
        startup_marker = "serving"
        dev_mode = true

        [storage]
        bucket = "backups"
        access_key = "AK"
        secret_key = "SK"
        mount_path = "/mnt/bucket"
        data_dir = "/srv/data"
        "#,
    )
    .unwrap();

    assert_eq!(config.server.port, 8080);
    assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
    assert_eq!(config.gateway.args, vec!["--sandbox"]);
    assert_eq!(config.storage.unwrap().bucket, "backups");
}

#[tokio::test]
async fn test_proxy_forwards_to_running_gateway() {
    let gateway_port = spawn_fake_gateway().await;
    let proxy_port = free_port();

    // The gateway is already listening, so the manager must never spawn
    // its (nonexistent) command
    let gateway = gateway_manager_for_port(gateway_port, "gateway-cli");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
    let proxy = ProxyServer::new(addr, gateway, Duration::from_secs(10), shutdown_rx);
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    assert!(wait_for_port(proxy_port, Duration::from_secs(5)).await);

    let response = http_request(proxy_port, "GET", "/anything", None)
        .await
        .unwrap();
    assert!(response.contains("200 OK"), "response: {}", response);
    assert!(response.contains("hello from gateway"));
}

#[tokio::test]
async fn test_proxy_reports_gateway_start_failure() {
    // Nothing listening and the gateway command does not exist
    let gateway_port = free_port();
    let proxy_port = free_port();

    let gateway = gateway_manager_for_port(gateway_port, "gateway-cli");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
    let proxy = ProxyServer::new(addr, gateway, Duration::from_secs(10), shutdown_rx);
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    assert!(wait_for_port(proxy_port, Duration::from_secs(5)).await);

    let response = http_request(proxy_port, "GET", "/", None).await.unwrap();
    assert!(response.contains("503"), "response: {}", response);
    assert!(response.contains("GATEWAY_START_FAILED"));
}

#[tokio::test]
async fn test_admin_health_version_and_auth() {
    let gateway_port = free_port();
    let admin_port = free_port();

    let gateway = gateway_manager_for_port(gateway_port, "gateway-cli");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", admin_port).parse().unwrap();
    let admin = AdminServer::new(addr, gateway, None, shutdown_rx, "test-token".to_string());
    tokio::spawn(async move {
        let _ = admin.run().await;
    });

    assert!(wait_for_port(admin_port, Duration::from_secs(5)).await);

    // Unauthenticated endpoints
    let response = http_request(admin_port, "GET", "/health", None).await.unwrap();
    assert!(response.contains("200 OK"));

    let response = http_request(admin_port, "GET", "/version", None).await.unwrap();
    assert!(response.contains("portico"));

    // Status requires the bearer token
    let response = http_request(admin_port, "GET", "/status", None).await.unwrap();
    assert!(response.contains("401"));

    let response = http_request(admin_port, "GET", "/status", Some("wrong"))
        .await
        .unwrap();
    assert!(response.contains("401"));

    let response = http_request(admin_port, "GET", "/status", Some("test-token"))
        .await
        .unwrap();
    assert!(response.contains("200 OK"), "response: {}", response);
    assert!(response.contains("\"gateway\""));
    assert!(response.contains("\"last_sync\":null"));
}

#[tokio::test]
async fn test_admin_sync_not_configured() {
    let gateway_port = free_port();
    let admin_port = free_port();

    let gateway = gateway_manager_for_port(gateway_port, "gateway-cli");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", admin_port).parse().unwrap();
    let admin = AdminServer::new(addr, gateway, None, shutdown_rx, "test-token".to_string());
    tokio::spawn(async move {
        let _ = admin.run().await;
    });

    assert!(wait_for_port(admin_port, Duration::from_secs(5)).await);

    let response = http_request(admin_port, "POST", "/sync", Some("test-token"))
        .await
        .unwrap();
    assert!(response.contains("404"), "response: {}", response);
    assert!(response.contains("not configured"));
}

#[tokio::test]
async fn test_admin_pairing_approval() {
    let gateway_port = free_port();
    let admin_port = free_port();

    // The CLI stand-in echoes its arguments plus the approval marker
    let gateway = gateway_manager_for_port(gateway_port, "echo APPROVED for");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", admin_port).parse().unwrap();
    let admin = AdminServer::new(addr, gateway, None, shutdown_rx, "test-token".to_string());
    tokio::spawn(async move {
        let _ = admin.run().await;
    });

    assert!(wait_for_port(admin_port, Duration::from_secs(5)).await);

    // Pairing requires auth
    let response = http_request(admin_port, "POST", "/pair/dev-1", None)
        .await
        .unwrap();
    assert!(response.contains("401"));

    let response = http_request(admin_port, "POST", "/pair/dev-1", Some("test-token"))
        .await
        .unwrap();
    assert!(response.contains("200 OK"), "response: {}", response);
    assert!(response.contains("\"approved\":true"));

    // Missing device id
    let response = http_request(admin_port, "POST", "/pair/", Some("test-token"))
        .await
        .unwrap();
    assert!(response.contains("400"), "response: {}", response);
}

#[tokio::test]
async fn test_admin_shutdown_via_watch_channel() {
    let gateway_port = free_port();
    let admin_port = free_port();

    let gateway = gateway_manager_for_port(gateway_port, "gateway-cli");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", admin_port).parse().unwrap();
    let admin = AdminServer::new(addr, gateway, None, shutdown_rx, "t".to_string());
    let handle = tokio::spawn(async move { admin.run().await });

    assert!(wait_for_port(admin_port, Duration::from_secs(5)).await);

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(result.is_ok(), "admin server did not shut down");
}
