//! Remote policy oracle client
//!
//! The oracle speaks the Open Policy Agent data API: the input document is
//! POSTed to `/v1/data/<package>/<rule>` and a boolean `result` decides.

use crate::config::PolicyConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("policy oracle returned status {0}")]
    Status(u16),
}

/// Document evaluated by the oracle
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyInput {
    pub method: String,
    /// gRPC-style metadata: `authorization`, `activeprojectid`, ...
    pub metadata: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl PolicyInput {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.entry(key.to_string()).or_default().push(value.into());
        self
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request = Some(request);
        self
    }
}

#[async_trait]
pub trait PolicyOracle: Send + Sync {
    /// `Ok(false)` is a denial; `Err` means the oracle could not answer
    async fn authorize(&self, input: &PolicyInput) -> Result<bool, PolicyError>;
}

#[derive(Serialize)]
struct OpaRequest<'a> {
    input: &'a PolicyInput,
}

#[derive(Deserialize)]
struct OpaResponse {
    #[serde(default)]
    result: Value,
}

pub struct OpaClient {
    client: reqwest::Client,
    url: String,
}

impl OpaClient {
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: rule_url(&config.endpoint, &config.package, &config.rule),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn rule_url(endpoint: &str, package: &str, rule: &str) -> String {
    format!(
        "{}/v1/data/{}/{}",
        endpoint.trim_end_matches('/'),
        package.replace('.', "/"),
        rule
    )
}

#[async_trait]
impl PolicyOracle for OpaClient {
    async fn authorize(&self, input: &PolicyInput) -> Result<bool, PolicyError> {
        let response = self.client.post(&self.url).json(&OpaRequest { input }).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::Status(status.as_u16()));
        }

        let body: OpaResponse = response.json().await?;
        let allowed = body.result == Value::Bool(true);
        debug!(method = %input.method, allowed, "Policy decision");
        Ok(allowed)
    }
}
