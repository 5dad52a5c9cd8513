//! Loopback admin API: status, on-demand sync, and device pairing.

use crate::gateway::GatewayManager;
use crate::pairing;
use crate::sync::SyncRunner;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the shim
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API server for operator actions
pub struct AdminServer {
    bind_addr: SocketAddr,
    gateway: Arc<GatewayManager>,
    sync: Option<Arc<SyncRunner>>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<GatewayManager>,
        sync: Option<Arc<SyncRunner>>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            sync,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let sync = self.sync.clone();
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, gateway, sync, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    gateway: Arc<GatewayManager>,
    sync: Option<Arc<SyncRunner>>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        let sync = sync.clone();
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, gateway, sync, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<GatewayManager>,
    sync: Option<Arc<SyncRunner>>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Gateway and sync status: GET /status (auth required)
        (&Method::GET, "/status") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let running = gateway.is_running().await;
                let last_sync = sync.as_ref().and_then(|s| s.last_result()).map(
                    |(at, result)| {
                        serde_json::json!({
                            "at": at.to_rfc3339(),
                            "success": result.success,
                            "detail": result.detail,
                        })
                    },
                );
                let body = serde_json::json!({
                    "gateway": {
                        "running": running,
                        "port": gateway.port(),
                    },
                    "last_sync": last_sync,
                });
                json_response(StatusCode::OK, body.to_string())
            }
        }

        // On-demand backup sync: POST /sync (auth required)
        (&Method::POST, "/sync") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else if let Some(ref runner) = sync {
                let result = runner.run_once().await;
                let status = if result.success {
                    StatusCode::OK
                } else {
                    StatusCode::BAD_GATEWAY
                };
                json_response(
                    status,
                    serde_json::to_string(&result).unwrap_or_default(),
                )
            } else {
                response(StatusCode::NOT_FOUND, "storage sync not configured")
            }
        }

        // Device pairing approval: POST /pair/{device_id} (auth required)
        (&Method::POST, path) if path.starts_with("/pair/") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let device_id = path.strip_prefix("/pair/").unwrap_or("");
                if device_id.is_empty() {
                    response(StatusCode::BAD_REQUEST, "missing device id")
                } else {
                    match pairing::approve_device(gateway.config(), device_id).await {
                        Ok(outcome) => {
                            let status = if outcome.approved {
                                StatusCode::OK
                            } else {
                                StatusCode::BAD_GATEWAY
                            };
                            json_response(
                                status,
                                serde_json::to_string(&outcome).unwrap_or_default(),
                            )
                        }
                        Err(e) => {
                            error!(device_id, error = %e, "Pairing CLI failed to run");
                            response(StatusCode::INTERNAL_SERVER_ERROR, "pairing failed")
                        }
                    }
                }
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
