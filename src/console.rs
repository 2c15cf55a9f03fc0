//! Backend VM console streams
//!
//! A provider opens the console of one virtual machine; the returned stream
//! then relays bytes between the console and a local pipe until either side
//! goes away.

use crate::directory::{ClusterDirectory, DirectoryError};
use crate::wsio::{WsReader, WsWriter};
use async_trait::async_trait;
use futures::StreamExt;
use hyper::header::HeaderValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Subprotocol KubeVirt uses for raw VNC over WebSocket
const VNC_SUBPROTOCOL: &str = "plain.kubevirt.io";

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("cluster lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("invalid console url {0}")]
    InvalidUrl(String),
    #[error("console connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out opening console")]
    Timeout,
    #[error("cluster lookup timed out after {0:?}")]
    LookupTimeout(Duration),
    #[error("console stream failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The virtual machine addressed by `/vnc/{project}/{app}/{cluster}/{vm}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTarget {
    pub project: String,
    pub app: String,
    pub cluster: String,
    pub vm: String,
}

impl ConsoleTarget {
    pub fn from_path(path: &str) -> Option<Self> {
        let mut segments = path.strip_prefix("/vnc/")?.split('/');
        let target = Self {
            project: segments.next()?.to_string(),
            app: segments.next()?.to_string(),
            cluster: segments.next()?.to_string(),
            vm: segments.next()?.to_string(),
        };
        if segments.next().is_some() {
            return None;
        }
        let all = [&target.project, &target.app, &target.cluster, &target.vm];
        if all.iter().any(|s| s.is_empty() || s.as_str() == "." || s.as_str() == "..") {
            return None;
        }
        Some(target)
    }
}

#[async_trait]
pub trait ConsoleStream: Send {
    /// Relay between the console and `io` until either side closes
    async fn stream(self: Box<Self>, io: DuplexStream) -> Result<(), ConsoleError>;
}

#[async_trait]
pub trait ConsoleProvider: Send + Sync {
    async fn open(&self, target: &ConsoleTarget) -> Result<Box<dyn ConsoleStream>, ConsoleError>;
}

/// Opens the KubeVirt VNC subresource through the cluster gateway
pub struct GatewayConsoleProvider {
    gateway: String,
    url_template: String,
    directory: Arc<dyn ClusterDirectory>,
    connect_timeout: Duration,
    lookup_timeout: Duration,
}

impl GatewayConsoleProvider {
    pub fn new(
        gateway: impl Into<String>,
        url_template: impl Into<String>,
        directory: Arc<dyn ClusterDirectory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            gateway: gateway.into(),
            url_template: url_template.into(),
            directory,
            connect_timeout,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Deadline for resolving the cluster before the console is dialed
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn console_url(&self, target: &ConsoleTarget, infra: &str) -> String {
        self.url_template
            .replace("{gateway}", &self.gateway)
            .replace("{project}", &target.project)
            .replace("{infra}", infra)
            .replace("{app}", &target.app)
            .replace("{cluster}", &target.cluster)
            .replace("{vm}", &target.vm)
    }
}

#[async_trait]
impl ConsoleProvider for GatewayConsoleProvider {
    async fn open(&self, target: &ConsoleTarget) -> Result<Box<dyn ConsoleStream>, ConsoleError> {
        let infra = tokio::time::timeout(
            self.lookup_timeout,
            self.directory.infra_name(&target.cluster, &target.project),
        )
        .await
        .map_err(|_| ConsoleError::LookupTimeout(self.lookup_timeout))??;
        let url = self.console_url(target, &infra);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|_| ConsoleError::InvalidUrl(url.clone()))?;
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_static(VNC_SUBPROTOCOL));
        if let Ok(project) = HeaderValue::from_str(&target.project) {
            request.headers_mut().insert("activeprojectid", project);
        }

        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ConsoleError::Timeout)??;
        debug!(url = %url, "Opened VM console");
        Ok(Box::new(GatewayConsole { ws }))
    }
}

struct GatewayConsole {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ConsoleStream for GatewayConsole {
    async fn stream(self: Box<Self>, io: DuplexStream) -> Result<(), ConsoleError> {
        let (sink, stream) = self.ws.split();
        let mut console_rx = WsReader::new(stream);
        let mut console_tx = WsWriter::new(sink);
        let (mut pipe_rx, mut pipe_tx) = tokio::io::split(io);

        tokio::select! {
            result = tokio::io::copy(&mut console_rx, &mut pipe_tx) => result?,
            result = tokio::io::copy(&mut pipe_rx, &mut console_tx) => result?,
        };
        Ok(())
    }
}
