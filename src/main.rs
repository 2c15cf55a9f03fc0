use app_proxy::assets::StaticAssets;
use app_proxy::auth::{JwtValidator, TokenValidator};
use app_proxy::config::{Config, SharedTunnelSettings};
use app_proxy::console::GatewayConsoleProvider;
use app_proxy::directory;
use app_proxy::policy::{OpaClient, PolicyOracle};
use app_proxy::pool::{GatewayPool, PoolConfig};
use app_proxy::proxy::ProxyServer;
use app_proxy::tunnel::TunnelServer;
use app_proxy::{PKG_NAME, VERSION};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// How long the console dial may take before the session is refused
const CONSOLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("app_proxy=debug".parse().expect("valid log directive")),
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

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = config.proxy.gateway_address.clone().unwrap_or_default();
    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );
    let pool = Arc::new(GatewayPool::new(gateway.clone(), pool_config));

    let cluster_directory = directory::from_config(&config.directory, config.proxy.directory_timeout()).map_err(|e| {
        error!(error = %e, "Failed to set up cluster directory");
        anyhow::anyhow!("Cluster directory: {}", e)
    })?;

    let validator: Option<Arc<dyn TokenValidator>> = if config.auth.enabled {
        let validator = JwtValidator::from_config(&config.auth).map_err(|e| {
            error!(error = %e, "Failed to set up token validation");
            anyhow::anyhow!("Token validation: {}", e)
        })?;
        Some(Arc::new(validator))
    } else {
        None
    };

    let oracle: Option<Arc<dyn PolicyOracle>> = if config.policy.enabled {
        let client = OpaClient::new(&config.policy).map_err(|e| {
            error!(error = %e, "Failed to set up policy client");
            anyhow::anyhow!("Policy client: {}", e)
        })?;
        info!(url = client.url(), "Policy oracle enabled");
        Some(Arc::new(client))
    } else {
        None
    };

    let tunnel_settings: SharedTunnelSettings = Arc::new(RwLock::new(config.websocket.clone()));

    // Create HTTP proxy server (if port > 0)
    let proxy_handle = if config.server.proxy_port > 0 {
        let addr = bind_address(&config.server.bind, config.server.proxy_port)?;
        let mut proxy = ProxyServer::new(
            addr,
            config.proxy.clone(),
            Arc::clone(&pool),
            Arc::clone(&cluster_directory),
            shutdown_rx.clone(),
        )
        .with_assets(StaticAssets::new(&config.server.web_root));
        if let Some(validator) = &validator {
            proxy = proxy.with_validator(Arc::clone(validator));
        }
        if let Some(oracle) = &oracle {
            proxy = proxy.with_oracle(Arc::clone(oracle));
        }

        Some(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }))
    } else {
        None
    };

    // Create VNC tunnel server (if port > 0)
    let tunnel_handle = if config.server.tunnel_port > 0 {
        let addr = bind_address(&config.server.bind, config.server.tunnel_port)?;
        let provider = Arc::new(GatewayConsoleProvider::new(
            gateway,
            config.websocket.console_url_template.clone(),
            Arc::clone(&cluster_directory),
            CONSOLE_CONNECT_TIMEOUT,
        )
        .with_lookup_timeout(config.proxy.directory_timeout()));
        let mut tunnel = TunnelServer::new(addr, Arc::clone(&tunnel_settings), provider, shutdown_rx.clone())
            .with_assets(StaticAssets::new(&config.server.vnc_web_root));
        if let Some(validator) = &validator {
            tunnel = tunnel.with_validator(Arc::clone(validator));
        }
        if let Some(oracle) = &oracle {
            tunnel = tunnel.with_oracle(Arc::clone(oracle));
        }

        Some(tokio::spawn(async move {
            if let Err(e) = tunnel.run().await {
                error!(error = %e, "VNC tunnel server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or tunnel settings reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

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
                    info!(path = %config_path.display(), "Received SIGHUP, reloading tunnel settings...");
                    reload_tunnel_settings(&config_path, &tunnel_settings);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = proxy_handle {
            let _ = handle.await;
        }
        if let Some(handle) = tunnel_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!(
        total_requests = pool.stats().get_total_requests(),
        failed_requests = pool.stats().get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

fn bind_address(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address: {}", e)
    })
}

/// Swap in the `[websocket]` section of the config file. Live sessions keep
/// running; new limits apply from the next admission.
fn reload_tunnel_settings(path: &Path, settings: &SharedTunnelSettings) {
    match Config::load(path) {
        Ok(config) => {
            let new = config.websocket;
            info!(
                hostname = %new.hostname,
                allowed_origins = ?new.allowed_origins,
                session_limit_per_ip = new.session_limit_per_ip,
                session_limit_per_account = new.session_limit_per_account,
                "Tunnel settings reloaded"
            );
            *settings.write() = new;
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration, keeping current settings");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting app service proxy");
    info!(
        bind = %config.server.bind,
        proxy_port = if config.server.proxy_port > 0 { Some(config.server.proxy_port) } else { None },
        tunnel_port = if config.server.tunnel_port > 0 { Some(config.server.tunnel_port) } else { None },
        "Server configuration"
    );
    info!(
        gateway = ?config.proxy.gateway_address,
        internal_api_host = %config.proxy.internal_api_host,
        max_body_size_mb = config.proxy.max_body_size_mb,
        directory_timeout_secs = config.proxy.directory_timeout_secs,
        "HTTP proxy settings"
    );
    info!(
        hostname = %config.websocket.hostname,
        allowed_origins = ?config.websocket.allowed_origins,
        session_limit_per_ip = config.websocket.session_limit_per_ip,
        session_limit_per_account = config.websocket.session_limit_per_account,
        read_limit_bytes = config.websocket.read_limit_bytes,
        dl_idle_timeout_min = config.websocket.dl_idle_timeout_min,
        ul_idle_timeout_min = config.websocket.ul_idle_timeout_min,
        "VNC tunnel settings"
    );
    info!(
        auth = config.auth.enabled,
        policy = config.policy.enabled,
        directory = config.directory.endpoint.as_deref().unwrap_or("static"),
        "Access control"
    );
}
