//! HTTP client for forwarding requests to the local gateway.
//!
//! A single pooled hyper client keeps connections to the one backend warm
//! across requests.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

const MAX_IDLE_CONNECTIONS: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Pooled client for the gateway on a fixed local port
pub struct GatewayClient {
    client: Client<HttpConnector, Incoming>,
    port: u16,
}

impl GatewayClient {
    pub fn new(port: u16) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(connector);

        debug!(port, "Gateway client initialized");

        Self { client, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward a request to the gateway, rewriting the URI to the local port
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ClientError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            self.port,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let gateway_req = builder
            .body(body)
            .map_err(|e| ClientError::RequestBuild(e.to_string()))?;

        let response = self.client.request(gateway_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
