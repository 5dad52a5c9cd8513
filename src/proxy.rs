//! The reverse proxy in front of the gateway.
//!
//! Every request ensures the gateway is up (starting it on demand), then
//! either forwards it over a pooled HTTP connection or, for WebSocket
//! upgrades, splices the raw byte streams.

use crate::client::GatewayClient;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::gateway::GatewayManager;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<GatewayManager>,
    client: Arc<GatewayClient>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<GatewayManager>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let client = Arc::new(GatewayClient::new(gateway.port()));
        Self {
            bind_addr,
            gateway,
            client,
            request_timeout,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let client = Arc::clone(&self.client);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway, client, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gateway: Arc<GatewayManager>,
    client: Arc<GatewayClient>,
    request_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let client = Arc::clone(&client);
        async move { handle_request(req, gateway, client, addr, request_timeout).await }
    });

    // auto::Builder supports HTTP/1.1 (with upgrades) and h2c on one port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<GatewayManager>,
    client: Arc<GatewayClient>,
    client_addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite X-Forwarded-* rather than appending: this proxy is assumed
    // to be the first trusted hop, so client-provided values are spoofing.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    // Locate or start the gateway before forwarding anything
    if let Err(e) = gateway.ensure_running().await {
        error!(error = %e, request_id, "Failed to start gateway");
        return Ok(json_error_response(
            ProxyErrorCode::GatewayStartFailed,
            "Gateway unavailable",
        ));
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, gateway.port(), request_id).await;
    }

    let result = tokio::time::timeout(request_timeout, client.send_request(req)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(error = %e, request_id, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to gateway",
            ))
        }
        Err(_) => {
            warn!(
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Forward bytes bidirectionally between client and gateway connections.
///
/// `early_gateway_bytes` are bytes the gateway sent in the same segment as
/// its upgrade response, past the header block; they are flushed to the
/// client before splicing starts.
async fn forward_bidirectional(
    client: Upgraded,
    gateway: TcpStream,
    early_gateway_bytes: &[u8],
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut gateway_io = gateway;

    if !early_gateway_bytes.is_empty() {
        if let Err(e) = client_io.write_all(early_gateway_bytes).await {
            debug!(request_id, error = %e, "Failed to forward early gateway bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut gateway_io).await {
        Ok((client_to_gateway, gateway_to_client)) => {
            debug!(
                request_id,
                client_to_gateway, gateway_to_client, "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the gateway
fn build_upgrade_request(req: &Request<Incoming>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Find the index just past the "\r\n\r\n" terminating an HTTP header block
fn header_block_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the HTTP response from the gateway to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Handle a WebSocket upgrade request by splicing raw streams
async fn handle_upgrade(
    req: Request<Incoming>,
    port: u16,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    debug!(request_id, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port);

    let gateway_addr = format!("127.0.0.1:{}", port);
    let mut gateway_stream = match TcpStream::connect(&gateway_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(port, error = %e, request_id, "Failed to connect to gateway for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to gateway: {}", e),
            ));
        }
    };

    if let Err(e) = gateway_stream.write_all(&raw_request).await {
        error!(error = %e, request_id, "Failed to send upgrade request to gateway");
        return Ok(json_error_response(
            ProxyErrorCode::UpgradeFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match gateway_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(request_id, "Gateway closed connection before responding to upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Gateway closed connection",
            ));
        }
        Err(e) => {
            error!(error = %e, request_id, "Failed to read upgrade response from gateway");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                format!("Failed to read gateway response: {}", e),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(request_id, "Failed to parse gateway upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Invalid upgrade response from gateway",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(%status, request_id, "Gateway rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(request_id, "WebSocket upgrade successful");

    // The gateway may have sent the first frames in the same segment as its
    // response header; they belong to the spliced stream, not the response.
    let early_bytes = header_block_end(&response_buf[..n])
        .map(|end| response_buf[end..n].to_vec())
        .unwrap_or_default();

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, gateway_stream, &early_bytes, &request_id).await;
            }
            Err(e) => {
                error!(error = %e, request_id, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
