// src/generate.rs
//! Generation collaborator: the quota-limited external API the batch
//! processor throttles calls to.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::GeneratorConfig;

/// Produces an artifact (e.g. an image URL) for a payload.
///
/// Errors are ordinary values here: the batch processor turns them into
/// `failed` transitions and keeps going.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, payload: &Value) -> Result<Value>;
    fn name(&self) -> &'static str;
}

/// POSTs the payload as JSON and reads the artifact from the response.
///
/// The response's `artifact` field is used when present, otherwise the whole
/// body. The client timeout bounds every call.
pub struct HttpGenerator {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building generator http client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(cfg: &GeneratorConfig) -> Result<Option<Self>> {
        let Some(endpoint) = cfg.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        let generator = Self::new(
            endpoint,
            cfg.api_key.clone(),
            Duration::from_secs(cfg.timeout_secs.max(1)),
        )?;
        Ok(Some(generator))
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, payload: &Value) -> Result<Value> {
        let mut req = self.client.post(&self.endpoint).json(payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("calling generation endpoint")?;
        let status = resp.status();
        let body = resp.text().await.context("reading generation response")?;

        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(anyhow!("generation endpoint returned {status}: {snippet}"));
        }

        let v: Value = serde_json::from_str(body.trim())
            .with_context(|| format!("parsing generation response (status {status})"))?;
        extract_artifact(v)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Stand-in used when no endpoint is configured. Every call fails, so items
/// would land in `failed`; the binary does not start a batch worker with it.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn generate(&self, _payload: &Value) -> Result<Value> {
        Err(anyhow!("generator not configured"))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

fn extract_artifact(v: Value) -> Result<Value> {
    let artifact = match v {
        Value::Object(mut m) => match m.remove("artifact") {
            Some(a) => a,
            None => Value::Object(m),
        },
        other => other,
    };
    if is_empty_artifact(&artifact) {
        return Err(anyhow!("generation response carried no artifact"));
    }
    Ok(artifact)
}

/// Null, empty strings and empty containers do not count as an artifact.
pub(crate) fn is_empty_artifact(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
