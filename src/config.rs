use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Tunnel settings shared between the tunnel server and the SIGHUP reload path.
///
/// Session counters read their limits from here on every admission, so a
/// reload takes effect for the next connection without a restart.
pub type SharedTunnelSettings = Arc<RwLock<WebSocketConfig>>;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection pool configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// HTTP reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Token validation settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Remote policy oracle settings
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Cluster directory settings
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// VNC WebSocket tunnel settings
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP reverse proxy port (default: 8123, set to 0 to disable)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// VNC tunnel port (default: 5900, set to 0 to disable)
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,

    /// Directory holding the login page assets
    #[serde(default = "default_web_root")]
    pub web_root: String,

    /// Directory holding the VNC console page assets
    #[serde(default = "default_vnc_web_root")]
    pub vnc_web_root: String,

    /// Maximum idle connections to the gateway (default: 100)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            proxy_port: default_proxy_port(),
            tunnel_port: default_tunnel_port(),
            web_root: default_web_root(),
            vnc_web_root: default_vnc_web_root(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Address (host:port) of the downstream cluster gateway. Required when
    /// the HTTP proxy is enabled.
    pub gateway_address: Option<String>,

    /// Host name the downstream clusters use for their API server
    #[serde(default = "default_internal_api_host")]
    pub internal_api_host: String,

    /// Where requests without routing cookies are redirected
    #[serde(default = "default_login_page")]
    pub login_page: String,

    /// Maximum request body size in megabytes (default: 100)
    #[serde(default = "default_max_body_size_mb")]
    pub max_body_size_mb: u64,

    /// Default cluster directory lookup timeout, overridable per request
    /// with `?timeout=<secs>`
    #[serde(default = "default_directory_timeout")]
    pub directory_timeout_secs: u64,

    /// Cookie prefix of the split access token
    #[serde(default = "default_proxy_token_prefix")]
    pub token_cookie_prefix: String,
}

impl ProxyConfig {
    pub fn max_body_size(&self) -> usize {
        (self.max_body_size_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            gateway_address: None,
            internal_api_host: default_internal_api_host(),
            login_page: default_login_page(),
            max_body_size_mb: default_max_body_size_mb(),
            directory_timeout_secs: default_directory_timeout(),
            token_cookie_prefix: default_proxy_token_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Validate access tokens (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// HS256 shared secret
    pub secret: Option<String>,

    /// RS256 public key (PEM)
    pub public_key_path: Option<String>,

    /// Expected `iss` claim
    pub issuer: Option<String>,

    /// Expected `aud` claim
    pub audience: Option<String>,

    /// Clock skew tolerance in seconds (default: 60)
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            public_key_path: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// Ask the policy oracle before forwarding (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the oracle
    #[serde(default = "default_policy_endpoint")]
    pub endpoint: String,

    /// Policy package; dots become path separators
    #[serde(default = "default_policy_package")]
    pub package: String,

    /// Rule evaluated inside the package
    #[serde(default = "default_policy_rule")]
    pub rule: String,

    /// Request timeout in seconds (default: 5)
    #[serde(default = "default_policy_timeout")]
    pub timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_policy_endpoint(),
            package: default_policy_package(),
            rule: default_policy_rule(),
            timeout_secs: default_policy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DirectoryConfig {
    /// Base URL of the cluster directory service
    pub endpoint: Option<String>,

    /// Static cluster id to infrastructure name mapping, used when no
    /// endpoint is configured
    #[serde(default)]
    pub clusters: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    /// Scheme the browser uses to reach the tunnel
    #[serde(default = "default_ws_protocol")]
    pub protocol: String,

    /// Public host name; `X-Forwarded-Host` must match it
    #[serde(default)]
    pub hostname: String,

    /// Accepted `Origin` header values
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Concurrent sessions per client IP (0 = unlimited)
    #[serde(default)]
    pub session_limit_per_ip: u32,

    /// Concurrent sessions per account (0 = unlimited)
    #[serde(default)]
    pub session_limit_per_account: u32,

    /// Maximum inbound WebSocket message size in bytes (0 = unlimited)
    #[serde(default)]
    pub read_limit_bytes: usize,

    /// Download (VM to browser) idle timeout in minutes (0 = disabled)
    #[serde(default)]
    pub dl_idle_timeout_min: u64,

    /// Upload (browser to VM) idle timeout in minutes (0 = disabled)
    #[serde(default)]
    pub ul_idle_timeout_min: u64,

    /// Cookie prefix of the split access token
    #[serde(default = "default_ws_token_prefix")]
    pub token_cookie_prefix: String,

    /// Backend console URL. Placeholders: {gateway}, {project}, {infra},
    /// {app}, {cluster}, {vm}
    #[serde(default = "default_console_url_template")]
    pub console_url_template: String,
}

impl WebSocketConfig {
    pub fn dl_idle_timeout(&self) -> Option<Duration> {
        minutes(self.dl_idle_timeout_min)
    }

    pub fn ul_idle_timeout(&self) -> Option<Duration> {
        minutes(self.ul_idle_timeout_min)
    }

    pub fn read_limit(&self) -> Option<usize> {
        (self.read_limit_bytes > 0).then_some(self.read_limit_bytes)
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }

    /// Address browsers use to reach `path` on the tunnel
    pub fn public_url(&self, path: &str) -> String {
        format!("{}://{}{}", self.protocol, self.hostname, path)
    }
}

fn minutes(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value.saturating_mul(60)))
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            protocol: default_ws_protocol(),
            hostname: String::new(),
            allowed_origins: Vec::new(),
            session_limit_per_ip: 0,
            session_limit_per_account: 0,
            read_limit_bytes: 0,
            dl_idle_timeout_min: 0,
            ul_idle_timeout_min: 0,
            token_cookie_prefix: default_ws_token_prefix(),
            console_url_template: default_console_url_template(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8123
}

fn default_tunnel_port() -> u16 {
    5900
}

fn default_web_root() -> String {
    "web-login".to_string()
}

fn default_vnc_web_root() -> String {
    "vnc-proxy-web-ui".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_internal_api_host() -> String {
    "kubernetes.default.svc".to_string()
}

fn default_login_page() -> String {
    "/app-service-proxy-index.html".to_string()
}

fn default_max_body_size_mb() -> u64 {
    100
}

fn default_directory_timeout() -> u64 {
    15
}

fn default_proxy_token_prefix() -> String {
    "app-service-proxy-token".to_string()
}

fn default_leeway() -> u64 {
    60
}

fn default_policy_endpoint() -> String {
    "http://localhost:8181".to_string()
}

fn default_policy_package() -> String {
    "deploymentv1".to_string()
}

fn default_policy_rule() -> String {
    "allow".to_string()
}

fn default_policy_timeout() -> u64 {
    5
}

fn default_ws_protocol() -> String {
    "wss".to_string()
}

fn default_ws_token_prefix() -> String {
    "keycloak-token".to_string()
}

fn default_console_url_template() -> String {
    "ws://{gateway}/kubernetes/{project}-{infra}/apis/subresources.kubevirt.io/v1/namespaces/{app}/virtualmachineinstances/{vm}/vnc".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.proxy_port > 0 {
            match self.proxy.gateway_address.as_deref() {
                None | Some("") => errors.push("proxy.gateway_address is required".to_string()),
                Some(_) => {}
            }
            if self.proxy.max_body_size_mb == 0 {
                errors.push("proxy.max_body_size_mb must be greater than 0".to_string());
            }
        }

        if self.server.tunnel_port > 0 {
            if self.websocket.hostname.is_empty() {
                errors.push("websocket.hostname is required".to_string());
            }
            if self.websocket.allowed_origins.is_empty() {
                errors.push("websocket.allowed_origins must not be empty".to_string());
            }
            if !matches!(self.websocket.protocol.as_str(), "ws" | "wss") {
                errors.push(format!(
                    "websocket.protocol must be \"ws\" or \"wss\", got \"{}\"",
                    self.websocket.protocol
                ));
            }
        }

        if self.auth.enabled && self.auth.secret.is_none() && self.auth.public_key_path.is_none() {
            errors.push("auth.secret or auth.public_key_path is required when auth is enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
