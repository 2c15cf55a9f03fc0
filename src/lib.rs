//! App Proxy - access to services and VM consoles inside managed clusters
//!
//! This library provides two front doors that share one access-control
//! pipeline:
//! - An HTTP reverse proxy that routes by cookie to a service inside a
//!   downstream cluster and rewrites absolute URLs in HTML, CSS and JS
//!   responses so the application keeps working under the proxy prefix
//! - A WebSocket tunnel that streams the VNC console of a virtual machine,
//!   with per-IP and per-account session caps and idle timeouts
//! - Token reconstruction from split cookies, JWT validation and an external
//!   policy oracle
//! - Pooled connections to the cluster gateway

pub mod assets;
pub mod auth;
pub mod config;
pub mod console;
pub mod cookies;
pub mod copier;
pub mod counter;
pub mod directory;
pub mod error;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod rewrite;
pub mod routing;
pub mod server;
pub mod transport;
pub mod tunnel;
pub mod wsio;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
