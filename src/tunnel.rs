//! VNC WebSocket tunnel
//!
//! Browsers open `/vnc/{project}/{app}/{cluster}/{vm}` and get the raw VNC
//! byte stream of that virtual machine's console. Each admitted session holds
//! one per-IP permit and one per-account permit for every identity in the
//! access token.

use crate::assets::{check_query, QueryProblem, StaticAssets};
use crate::auth::{reconstruct_token, TokenValidator};
use crate::config::SharedTunnelSettings;
use crate::console::{ConsoleError, ConsoleProvider, ConsoleStream, ConsoleTarget};
use crate::copier::{copy_with_idle_timeout, CopyError};
use crate::counter::{CounterKind, SessionCounter, SessionPermit};
use crate::error::{full_body, json_error_response, text_response, ProxyErrorCode, ResponseBody};
use crate::policy::{PolicyInput, PolicyOracle};
use crate::server::serve;
use crate::wsio::{WsReader, WsWriter};
use futures::StreamExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig as WsProtocolConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Capacity of the in-memory pipe between the browser and the console
const PIPE_CAPACITY: usize = 64 * 1024;

const CONSOLE_PAGE: &str = "vnc-proxy-index.html";
const CONSOLE_ASSETS: &[&str] = &["vnc-proxy-main.js", "vnc-proxy-styles.css", "rfb.js", "keycloak.min.js"];
const CONSOLE_PARAMS: &[&str] = &["project", "app", "cluster", "vm"];

struct TunnelContext {
    settings: SharedTunnelSettings,
    provider: Arc<dyn ConsoleProvider>,
    validator: Option<Arc<dyn TokenValidator>>,
    oracle: Option<Arc<dyn PolicyOracle>>,
    ip_counter: Arc<SessionCounter>,
    account_counter: Arc<SessionCounter>,
    assets: StaticAssets,
}

pub struct TunnelServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    ctx: TunnelContext,
}

impl TunnelServer {
    pub fn new(
        bind_addr: SocketAddr,
        settings: SharedTunnelSettings,
        provider: Arc<dyn ConsoleProvider>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let ip_counter = Arc::new(SessionCounter::new(CounterKind::PerIp, Arc::clone(&settings)));
        let account_counter = Arc::new(SessionCounter::new(CounterKind::PerAccount, Arc::clone(&settings)));
        Self {
            bind_addr,
            shutdown_rx,
            ctx: TunnelContext {
                settings,
                provider,
                validator: None,
                oracle: None,
                ip_counter,
                account_counter,
                assets: StaticAssets::new("vnc-proxy-web-ui"),
            },
        }
    }

    /// Require and validate the split access token
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.ctx.validator = Some(validator);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn PolicyOracle>) -> Self {
        self.ctx.oracle = Some(oracle);
        self
    }

    pub fn with_assets(mut self, assets: StaticAssets) -> Self {
        self.ctx.assets = assets;
        self
    }

    pub fn ip_counter(&self) -> Arc<SessionCounter> {
        Arc::clone(&self.ctx.ip_counter)
    }

    pub fn account_counter(&self) -> Arc<SessionCounter> {
        Arc::clone(&self.ctx.account_counter)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "VNC tunnel listening");

        let ctx = Arc::new(self.ctx);
        serve(listener, self.shutdown_rx, "tunnel", move |req, peer| {
            let ctx = Arc::clone(&ctx);
            async move { handle_request(req, ctx, peer).await }
        })
        .await;

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<TunnelContext>,
    peer: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path();
    debug!(method = %req.method(), path, request_id, "Incoming tunnel request");

    if path.starts_with("/vnc/") {
        return Ok(open_session(req, &ctx, peer, &request_id).await);
    }

    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return Ok(json_error_response(ProxyErrorCode::NotFound, "Not found"));
    }

    let response = match path {
        "/test" => text_response(StatusCode::OK, "Ok\n"),
        "/" => match check_query(req.uri().query(), CONSOLE_PARAMS) {
            Ok(()) => ctx.assets.serve(CONSOLE_PAGE).await,
            Err(QueryProblem::Missing) => json_error_response(ProxyErrorCode::NotFound, "Not found"),
            Err(QueryProblem::Empty(name)) => text_response(StatusCode::BAD_REQUEST, format!("{} is blank", name)),
        },
        _ => match path.strip_prefix('/').filter(|f| CONSOLE_ASSETS.contains(f)) {
            Some(file) => ctx.assets.serve(file).await,
            None => json_error_response(ProxyErrorCode::NotFound, "Not found"),
        },
    };
    Ok(response)
}

/// Run the admission checks and, when they pass, answer the WebSocket
/// handshake and start relaying in the background
async fn open_session(
    req: Request<Incoming>,
    ctx: &TunnelContext,
    peer: SocketAddr,
    request_id: &str,
) -> Response<ResponseBody> {
    let settings = ctx.settings.read().clone();
    let headers = req.headers();

    let origin = header(headers, ORIGIN.as_str()).unwrap_or_default();
    if !settings.is_origin_allowed(origin) {
        warn!(request_id, origin, "Rejected tunnel request from disallowed origin");
        return json_error_response(ProxyErrorCode::OriginRejected, "Origin not allowed");
    }

    let forwarded_host = header(headers, X_FORWARDED_HOST).unwrap_or_default();
    if forwarded_host != settings.hostname {
        warn!(request_id, forwarded_host, "Rejected tunnel request with unexpected forwarded host");
        return json_error_response(ProxyErrorCode::ForwardedHostRejected, "Forwarded host not allowed");
    }

    let token = match &ctx.validator {
        Some(_) => match reconstruct_token(headers, &settings.token_cookie_prefix) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(request_id, error = %e, "Access token unavailable");
                return json_error_response(ProxyErrorCode::TokenUnavailable, "Access token unavailable");
            }
        },
        None => None,
    };

    let Some(target) = ConsoleTarget::from_path(req.uri().path()) else {
        debug!(request_id, path = req.uri().path(), "Malformed console path");
        return json_error_response(ProxyErrorCode::NotFound, "Not found");
    };

    let mut accounts = Vec::new();
    if let (Some(validator), Some(token)) = (&ctx.validator, &token) {
        match validator.validate(token) {
            Ok(claims) => accounts = claims.accounts(),
            Err(e) => {
                warn!(request_id, error = %e, "Token validation failed");
                return json_error_response(ProxyErrorCode::Unauthenticated, "Invalid access token");
            }
        }
    }

    if let Some(oracle) = &ctx.oracle {
        let mut input = PolicyInput::new(req.method().as_str())
            .with_metadata("activeprojectid", target.project.as_str())
            .with_request(json!({
                "appId": target.app,
                "clusterId": target.cluster,
                "virtualMachineId": target.vm,
            }));
        if let Some(token) = &token {
            input = input.with_metadata("authorization", format!("Bearer {}", token));
        }
        match oracle.authorize(&input).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(request_id, project = %target.project, vm = %target.vm, "Console access denied by policy");
                return json_error_response(ProxyErrorCode::Unauthenticated, "Access denied");
            }
            Err(e) => {
                error!(request_id, error = %e, "Policy oracle unavailable");
                return json_error_response(ProxyErrorCode::Unauthenticated, "Authorization failed");
            }
        }
    }

    let remote_ip = client_ip(headers, peer);
    let permits = match admit(ctx, &remote_ip, &accounts) {
        Ok(permits) => permits,
        Err(message) => {
            warn!(request_id, ip = %remote_ip, ?accounts, "{}", message);
            return json_error_response(ProxyErrorCode::SessionLimitExceeded, message);
        }
    };
    debug!(
        request_id,
        ip_sessions = %ctx.ip_counter,
        account_sessions = %ctx.account_counter,
        "Session admitted"
    );

    let console = match ctx.provider.open(&target).await {
        Ok(console) => console,
        Err(e) => {
            error!(request_id, vm = %target.vm, cluster = %target.cluster, error = %e, "Failed to open VM console");
            return json_error_response(ProxyErrorCode::ConsoleUnavailable, "Console not available");
        }
    };

    let Some(accept_key) = handshake_accept_key(&req) else {
        warn!(request_id, "Not a valid WebSocket handshake");
        return json_error_response(ProxyErrorCode::UpgradeFailed, "WebSocket upgrade required");
    };

    let mut ws_config = WsProtocolConfig::default();
    ws_config.max_message_size = settings.read_limit();
    ws_config.max_frame_size = settings.read_limit();
    let timeouts = (settings.dl_idle_timeout(), settings.ul_idle_timeout());
    let request_id = request_id.to_string();
    let vm = target.vm.clone();
    let public_url = settings.public_url(req.uri().path());

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade tunnel connection");
                return;
            }
        };
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(ws_config)).await;
        info!(request_id, vm, url = %public_url, "VNC session started");
        let end = run_session(ws, console, permits, timeouts).await;
        info!(request_id, vm, reason = %end, "VNC session ended");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(full_body(""))
        .expect("valid response builder")
}

/// Acquire the per-IP permit, then one per account. Permits already taken
/// are released when a later one is refused.
fn admit(ctx: &TunnelContext, ip: &str, accounts: &[String]) -> Result<Vec<SessionPermit>, String> {
    let mut permits = Vec::with_capacity(accounts.len() + 1);
    permits.push(
        ctx.ip_counter
            .acquire(ip)
            .map_err(|e| format!("Too many sessions from this address: {}", e))?,
    );
    for account in accounts {
        permits.push(
            ctx.account_counter
                .acquire(account)
                .map_err(|e| format!("Too many sessions for this account: {}", e))?,
        );
    }
    Ok(permits)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First `X-Forwarded-For` entry, else the peer address
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    header(headers, X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| peer.ip().to_string())
}

/// `Sec-WebSocket-Accept` for a valid client handshake
fn handshake_accept_key<B>(req: &Request<B>) -> Option<HeaderValue> {
    let headers = req.headers();
    let has_token = |name: &str, token: &str| {
        header(headers, name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    };

    if req.method() != Method::GET
        || !has_token(CONNECTION.as_str(), "upgrade")
        || !has_token(UPGRADE.as_str(), "websocket")
        || header(headers, SEC_WEBSOCKET_VERSION.as_str()) != Some("13")
    {
        return None;
    }
    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    HeaderValue::from_str(&derive_accept_key(key.as_bytes())).ok()
}

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    Download(Result<u64, CopyError>),
    Upload(Result<u64, CopyError>),
    Backend(Result<(), ConsoleError>),
    Panicked(String),
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Download(Ok(n)) => write!(f, "console closed after {} bytes", n),
            SessionEnd::Download(Err(e)) => write!(f, "download stopped: {}", e),
            SessionEnd::Upload(Ok(n)) => write!(f, "browser closed after {} bytes", n),
            SessionEnd::Upload(Err(e)) => write!(f, "upload stopped: {}", e),
            SessionEnd::Backend(Ok(())) => write!(f, "console disconnected"),
            SessionEnd::Backend(Err(e)) => write!(f, "console failed: {}", e),
            SessionEnd::Panicked(task) => write!(f, "{} task panicked", task),
        }
    }
}

/// The three tasks of one session; dropping it aborts all of them
struct StreamSession {
    download: JoinHandle<Result<u64, CopyError>>,
    upload: JoinHandle<Result<u64, CopyError>>,
    backend: JoinHandle<Result<(), ConsoleError>>,
}

impl StreamSession {
    async fn first_to_finish(&mut self) -> SessionEnd {
        tokio::select! {
            result = &mut self.download => result.map(SessionEnd::Download).unwrap_or_else(|_| SessionEnd::Panicked("download".into())),
            result = &mut self.upload => result.map(SessionEnd::Upload).unwrap_or_else(|_| SessionEnd::Panicked("upload".into())),
            result = &mut self.backend => result.map(SessionEnd::Backend).unwrap_or_else(|_| SessionEnd::Panicked("backend".into())),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.download.abort();
        self.upload.abort();
        self.backend.abort();
    }
}

async fn run_session<S>(
    ws: WebSocketStream<S>,
    console: Box<dyn ConsoleStream>,
    permits: Vec<SessionPermit>,
    (download_idle, upload_idle): (Option<Duration>, Option<Duration>),
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // released after every task below is gone
    let _permits = permits;

    let (browser_tx, browser_rx) = ws.split();
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut pipe_rx, mut pipe_tx) = tokio::io::split(local);

    let mut session = StreamSession {
        backend: tokio::spawn(console.stream(remote)),
        download: tokio::spawn(async move {
            let mut browser = WsWriter::new(browser_tx);
            copy_with_idle_timeout(&mut browser, &mut pipe_rx, download_idle).await
        }),
        upload: tokio::spawn(async move {
            let mut browser = WsReader::new(browser_rx);
            copy_with_idle_timeout(&mut pipe_tx, &mut browser, upload_idle).await
        }),
    };

    session.first_to_finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip() {
        let peer: SocketAddr = "192.0.2.1:40000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "192.0.2.1");

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static(" 203.0.113.5 , 10.0.0.1"));
        assert_eq!(client_ip(&headers, peer), "203.0.113.5");
    }

    #[test]
    fn test_handshake_accept_key() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/vnc/p/a/c/v")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert_eq!(
            handshake_accept_key(&request).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );

        let plain = Request::builder().uri("/vnc/p/a/c/v").body(()).unwrap();
        assert!(handshake_accept_key(&plain).is_none());
    }

    #[test]
    fn test_session_end_display() {
        assert_eq!(
            SessionEnd::Upload(Err(CopyError::IdleTimeout(Duration::from_secs(60)))).to_string(),
            "upload stopped: no data received for 60s"
        );
        assert_eq!(SessionEnd::Backend(Ok(())).to_string(), "console disconnected");
    }
}
