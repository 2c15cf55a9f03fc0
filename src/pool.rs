//! Connection pool for the downstream gateway
//!
//! Every proxied request goes to the same gateway host, so one pooled
//! client is built at startup and shared by all request handlers.

use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HOST};
use hyper::{Request, Response, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type of requests forwarded to the gateway
pub type RequestBody = UnsyncBoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Headers that describe a single hop and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent to the gateway
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP client bound to the gateway address
pub struct GatewayPool {
    client: Client<HttpConnector, RequestBody>,
    gateway: String,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl GatewayPool {
    pub fn new(gateway: impl Into<String>, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let gateway = gateway.into();
        debug!(
            gateway = %gateway,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Gateway connection pool initialized"
        );

        Self {
            client,
            gateway,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the gateway. The request URI only needs a path; the
    /// authority and `Host` header are set to the gateway address.
    pub async fn send_request(&self, req: Request<RequestBody>) -> Result<Response<Incoming>, PoolError> {
        let uri = format!(
            "http://{}{}",
            self.gateway,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri).version(Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            if is_hop_by_hop(key) || key == HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        builder = builder.header(HOST, self.gateway.as_str());

        let gateway_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        match self.client.request(gateway_req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}
