//! Cluster directory: maps a cluster id to the infrastructure name used in
//! the gateway path `/kubernetes/<project>-<infra>/...`

use crate::config::DirectoryConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("cluster {cluster} not found in project {project}")]
    NotFound { cluster: String, project: String },
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("directory returned status {0}")]
    Status(u16),
    #[error("directory returned an empty infrastructure name for cluster {0}")]
    EmptyName(String),
}

#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn infra_name(&self, cluster: &str, project: &str) -> Result<String, DirectoryError>;
}

/// Fixed mapping from configuration
#[derive(Debug, Default)]
pub struct StaticClusterDirectory {
    clusters: HashMap<String, String>,
}

impl StaticClusterDirectory {
    pub fn new(clusters: HashMap<String, String>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl ClusterDirectory for StaticClusterDirectory {
    async fn infra_name(&self, cluster: &str, project: &str) -> Result<String, DirectoryError> {
        self.clusters.get(cluster).cloned().ok_or_else(|| DirectoryError::NotFound {
            cluster: cluster.to_string(),
            project: project.to_string(),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterRecord {
    #[serde(default)]
    infra_name: String,
}

/// Deployment manager lookup: `GET {endpoint}/v1/projects/{project}/clusters/{cluster}`.
///
/// Only dialing is bounded here; callers wrap the whole lookup in their own
/// deadline (the proxy honors a per-request `?timeout=` override).
pub struct HttpClusterDirectory {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClusterDirectory {
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, DirectoryError> {
        Ok(Self {
            client: reqwest::Client::builder().connect_timeout(connect_timeout).build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ClusterDirectory for HttpClusterDirectory {
    async fn infra_name(&self, cluster: &str, project: &str) -> Result<String, DirectoryError> {
        let url = format!("{}/v1/projects/{}/clusters/{}", self.endpoint, project, cluster);
        let response = self
            .client
            .get(&url)
            .header("ActiveProjectID", project)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(DirectoryError::NotFound {
                    cluster: cluster.to_string(),
                    project: project.to_string(),
                })
            }
            status => return Err(DirectoryError::Status(status)),
        }

        let record: ClusterRecord = response.json().await?;
        if record.infra_name.is_empty() {
            return Err(DirectoryError::EmptyName(cluster.to_string()));
        }
        debug!(cluster, project, infra = %record.infra_name, "Resolved cluster");
        Ok(record.infra_name)
    }
}

/// Pick the HTTP directory when an endpoint is configured, otherwise the
/// static map
pub fn from_config(config: &DirectoryConfig, timeout: Duration) -> Result<Arc<dyn ClusterDirectory>, DirectoryError> {
    match config.endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => Ok(Arc::new(HttpClusterDirectory::new(endpoint, timeout)?)),
        _ => Ok(Arc::new(StaticClusterDirectory::new(config.clusters.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn serve_once(listener: TcpListener, status: &'static str, body: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    }

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticClusterDirectory::new(HashMap::from([("c1".to_string(), "x".to_string())]));
        assert_eq!(directory.infra_name("c1", "p1").await.unwrap(), "x");
        assert!(matches!(
            directory.infra_name("c2", "p1").await,
            Err(DirectoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_directory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let directory = HttpClusterDirectory::new(&format!("http://{}/", listener.local_addr().unwrap()), TIMEOUT).unwrap();
        let server = tokio::spawn(serve_once(listener, "200 OK", r#"{"id":"c1","infraName":"infra-7"}"#));

        assert_eq!(directory.infra_name("c1", "p1").await.unwrap(), "infra-7");
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /v1/projects/p1/clusters/c1 "));
        assert!(request.to_ascii_lowercase().contains("activeprojectid: p1"));
    }

    #[tokio::test]
    async fn test_http_directory_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let directory = HttpClusterDirectory::new(&format!("http://{}", listener.local_addr().unwrap()), TIMEOUT).unwrap();
        tokio::spawn(serve_once(listener, "404 Not Found", "{}"));
        assert!(matches!(
            directory.infra_name("c1", "p1").await,
            Err(DirectoryError::NotFound { .. })
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let directory = HttpClusterDirectory::new(&format!("http://{}", listener.local_addr().unwrap()), TIMEOUT).unwrap();
        tokio::spawn(serve_once(listener, "200 OK", r#"{"infraName":""}"#));
        assert!(matches!(directory.infra_name("c1", "p1").await, Err(DirectoryError::EmptyName(_))));
    }

    #[test]
    fn test_from_config_falls_back_to_static() {
        let config = DirectoryConfig {
            endpoint: Some(String::new()),
            clusters: HashMap::new(),
        };
        assert!(from_config(&config, TIMEOUT).is_ok());
    }
}
