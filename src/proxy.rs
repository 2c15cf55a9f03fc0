use crate::assets::{check_query, QueryProblem, StaticAssets};
use crate::auth::{is_token_cookie, reconstruct_token, TokenValidator};
use crate::config::ProxyConfig;
use crate::cookies::strip_cookies;
use crate::directory::ClusterDirectory;
use crate::error::{json_error_response, redirect_response, text_response, ProxyErrorCode, ResponseBody};
use crate::policy::{PolicyInput, PolicyOracle};
use crate::pool::GatewayPool;
use crate::rewrite::RewriteContext;
use crate::routing::{RoutingContext, RoutingError};
use crate::server::serve;
use crate::transport::RewritingTransport;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Application credentials are moved here so the gateway can use its own
const X_APP_AUTHORIZATION: &str = "x-app-authorization";
const ACTIVE_PROJECT_ID: &str = "activeprojectid";

const LOGIN_PAGE: &str = "app-service-proxy-index.html";
const LOGIN_SCRIPT: &str = "app-service-proxy-main.js";
const LOGIN_STYLES: &str = "app-service-proxy-styles.css";
const LOGIN_PARAMS: &[&str] = &["project", "cluster", "namespace", "service"];

/// Everything a request handler needs, shared across connections
struct ProxyContext {
    config: ProxyConfig,
    transport: RewritingTransport,
    directory: Arc<dyn ClusterDirectory>,
    validator: Option<Arc<dyn TokenValidator>>,
    oracle: Option<Arc<dyn PolicyOracle>>,
    assets: StaticAssets,
}

/// HTTP reverse proxy in front of the cluster gateway
pub struct ProxyServer {
    bind_addr: SocketAddr,
    config: ProxyConfig,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<GatewayPool>,
    directory: Arc<dyn ClusterDirectory>,
    validator: Option<Arc<dyn TokenValidator>>,
    oracle: Option<Arc<dyn PolicyOracle>>,
    assets: StaticAssets,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: ProxyConfig,
        pool: Arc<GatewayPool>,
        directory: Arc<dyn ClusterDirectory>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            config,
            shutdown_rx,
            pool,
            directory,
            validator: None,
            oracle: None,
            assets: StaticAssets::new("web-login"),
        }
    }

    /// Require a valid access token on proxied requests
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Ask the policy oracle before forwarding
    pub fn with_oracle(mut self, oracle: Arc<dyn PolicyOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_assets(mut self, assets: StaticAssets) -> Self {
        self.assets = assets;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            gateway = self.pool.gateway(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let ctx = Arc::new(ProxyContext {
            transport: RewritingTransport::new(Arc::clone(&self.pool)),
            config: self.config,
            directory: self.directory,
            validator: self.validator,
            oracle: self.oracle,
            assets: self.assets,
        });

        serve(listener, self.shutdown_rx, "proxy", move |req, addr| {
            let ctx = Arc::clone(&ctx);
            async move { handle_request(req, ctx, addr).await }
        })
        .await;

        Ok(())
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let path = req.uri().path();
    let is_get = matches!(*req.method(), Method::GET | Method::HEAD);
    match path.strip_prefix('/') {
        Some("test") if is_get => return Ok(text_response(StatusCode::OK, "Ok\n")),
        Some(LOGIN_PAGE) if is_get => {
            return Ok(match check_query(req.uri().query(), LOGIN_PARAMS) {
                Ok(()) => ctx.assets.serve(LOGIN_PAGE).await,
                Err(QueryProblem::Missing) => text_response(
                    StatusCode::BAD_REQUEST,
                    "Missing some query parameter: project, cluster, namespace, service",
                ),
                Err(QueryProblem::Empty(name)) => {
                    text_response(StatusCode::BAD_REQUEST, format!("{} is empty", name))
                }
            });
        }
        Some(file @ (LOGIN_SCRIPT | LOGIN_STYLES)) if is_get => return Ok(ctx.assets.serve(file).await),
        _ => {}
    }

    Ok(services_proxy(req, &ctx, client_addr, &request_id).await)
}

/// Forward a request to the service named by its routing cookies
async fn services_proxy(
    req: Request<Incoming>,
    ctx: &ProxyContext,
    client_addr: SocketAddr,
    request_id: &str,
) -> Response<ResponseBody> {
    let routing = match RoutingContext::from_headers(req.headers()) {
        Ok(routing) => routing,
        Err(RoutingError::Missing(cookie)) => {
            debug!(request_id, cookie, "Routing cookie missing, redirecting to login page");
            return redirect_response(&ctx.config.login_page);
        }
        Err(e) => {
            warn!(request_id, error = %e, "Rejected routing context");
            return json_error_response(ProxyErrorCode::RoutingContextMalformed, "Invalid routing cookies");
        }
    };

    let prefix = ctx.config.token_cookie_prefix.as_str();
    let token = match reconstruct_token(req.headers(), prefix) {
        Ok(token) => Some(token),
        Err(e) if ctx.validator.is_some() => {
            warn!(request_id, error = %e, "Access token unavailable");
            return json_error_response(ProxyErrorCode::Unauthenticated, "Authentication required");
        }
        Err(_) => None,
    };

    if let (Some(validator), Some(token)) = (&ctx.validator, &token) {
        if let Err(e) = validator.validate(token) {
            warn!(request_id, project = %routing.project_id, error = %e, "Token validation failed");
            return json_error_response(ProxyErrorCode::Unauthenticated, "Invalid access token");
        }
    }

    if let Some(oracle) = &ctx.oracle {
        if let Some(denied) = authorize(oracle.as_ref(), &req, &routing, token.as_deref(), request_id).await {
            return denied;
        }
    }

    let timeout = lookup_timeout(req.uri().query(), ctx.config.directory_timeout());
    let infra_name = match tokio::time::timeout(timeout, ctx.directory.infra_name(&routing.cluster, &routing.project_id)).await
    {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => {
            error!(request_id, cluster = %routing.cluster, error = %e, "Cluster lookup failed");
            return json_error_response(ProxyErrorCode::ClusterLookupFailed, "Failed to resolve cluster");
        }
        Err(_) => {
            warn!(request_id, cluster = %routing.cluster, timeout_secs = timeout.as_secs(), "Cluster lookup timed out");
            return json_error_response(
                ProxyErrorCode::LookupTimeout,
                format!("Cluster lookup timed out after {} seconds", timeout.as_secs()),
            );
        }
    };

    let max_body = ctx.config.max_body_size();
    let declared_length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_length.is_some_and(|len| len > max_body as u64) {
        return json_error_response(
            ProxyErrorCode::PayloadTooLarge,
            format!("Request body exceeds {} bytes", max_body),
        );
    }

    let (mut parts, body) = req.into_parts();

    // HTTP/2 requests carry the host in the URI only
    if !parts.headers.contains_key(HOST) {
        if let Some(value) = parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
            parts.headers.insert(HOST, value);
        }
    }
    let Some(rewrite_ctx) = RewriteContext::from_request(&parts.headers, &ctx.config.internal_api_host, &routing) else {
        return json_error_response(ProxyErrorCode::RoutingContextMalformed, "Missing or invalid Host header");
    };

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let downstream = routing.downstream_path(&infra_name, path_and_query);
    parts.uri = match downstream.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(request_id, path = %downstream, error = %e, "Invalid downstream path");
            return json_error_response(ProxyErrorCode::RoutingContextMalformed, "Invalid request path");
        }
    };

    let headers = &mut parts.headers;
    strip_cookies(headers, |name| is_token_cookie(name, prefix));
    if let Some(app_auth) = headers.remove(AUTHORIZATION) {
        debug!(request_id, "Moved Authorization header to X-App-Authorization");
        headers.insert(X_APP_AUTHORIZATION, app_auth);
    }
    if let Ok(value) = HeaderValue::from_str(&routing.project_id) {
        headers.insert(ACTIVE_PROJECT_ID, value);
    }
    append_forwarded_for(headers, client_addr);

    debug!(
        request_id,
        project = %routing.project_id,
        cluster = %routing.cluster,
        infra = %infra_name,
        path = %downstream,
        "Forwarding request to gateway"
    );

    let body = Limited::new(body, max_body).boxed_unsync();
    match ctx.transport.round_trip(Request::from_parts(parts, body), &rewrite_ctx).await {
        Ok(response) => response,
        Err(e) => {
            error!(request_id, error = %e, "Failed to forward request to gateway");
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to gateway")
        }
    }
}

/// Ask the oracle; returns the response to send when the request may not proceed
async fn authorize(
    oracle: &dyn PolicyOracle,
    req: &Request<Incoming>,
    routing: &RoutingContext,
    token: Option<&str>,
    request_id: &str,
) -> Option<Response<ResponseBody>> {
    let mut input = PolicyInput::new(req.method().as_str())
        .with_metadata(ACTIVE_PROJECT_ID, routing.project_id.as_str())
        .with_request(json!({
            "project": routing.project_id,
            "cluster": routing.cluster,
            "namespace": routing.namespace,
            "service": routing.service,
            "path": req.uri().path(),
        }));
    if let Some(token) = token {
        input = input.with_metadata("authorization", format!("Bearer {}", token));
    }

    match oracle.authorize(&input).await {
        Ok(true) => None,
        Ok(false) => {
            warn!(request_id, project = %routing.project_id, "Request denied by policy");
            Some(json_error_response(ProxyErrorCode::PolicyDenied, "Access denied"))
        }
        Err(e) => {
            error!(request_id, error = %e, "Policy oracle unavailable");
            Some(json_error_response(ProxyErrorCode::Unauthenticated, "Authorization failed"))
        }
    }
}

/// `?timeout=<secs>` overrides the default lookup deadline
fn lookup_timeout(query: Option<&str>, default: Duration) -> Duration {
    query
        .and_then(|q| form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k == "timeout"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn append_forwarded_for(headers: &mut hyper::HeaderMap, client_addr: SocketAddr) {
    let ip = client_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
