//! Uplink: posts inventory deltas to the ingest service.

use crate::config::UplinkConfig;
use crate::delta::{filter_deltas, PostDeltaBody, PostDeltaResponse, RawDelta};
use crate::error::AgentError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

pub const DELTAS_PATH: &str = "inventory/deltas";
pub const LICENSE_HEADER: &str = "X-License-Key";
pub const ENTITY_KEY_HEADER: &str = "X-Entity-Key";
pub const AGENT_ID_HEADER: &str = "X-Agent-Id";

pub fn user_agent() -> String {
    format!("inventory-agent/{}", env!("CARGO_PKG_VERSION"))
}

/// Where delta blocks go.
#[async_trait]
pub trait DeltaPoster: Send + Sync {
    async fn post_deltas(
        &self,
        entity_keys: Vec<String>,
        is_agent: bool,
        deltas: Vec<RawDelta>,
    ) -> Result<PostDeltaResponse, AgentError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResponseBody {
    Wrapped { payload: PostDeltaResponse },
    Plain(PostDeltaResponse),
}

pub struct IngestClient {
    client: reqwest::Client,
    url: String,
    license_key: String,
    entity_key: String,
    agent_id: String,
}

impl IngestClient {
    pub fn new(config: &UplinkConfig, entity_key: &str, agent_id: &str) -> Result<Self, AgentError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AgentError::Config("uplink endpoint is not configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(user_agent())
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/{}", endpoint.trim_end_matches('/'), DELTAS_PATH),
            license_key: config.license_key.clone().unwrap_or_default(),
            entity_key: entity_key.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, body: &PostDeltaBody) -> Result<reqwest::Request, AgentError> {
        Ok(self
            .client
            .post(&self.url)
            .header(LICENSE_HEADER, &self.license_key)
            .header(ENTITY_KEY_HEADER, &self.entity_key)
            .header(AGENT_ID_HEADER, &self.agent_id)
            .json(body)
            .build()?)
    }
}

#[async_trait]
impl DeltaPoster for IngestClient {
    async fn post_deltas(
        &self,
        entity_keys: Vec<String>,
        is_agent: bool,
        deltas: Vec<RawDelta>,
    ) -> Result<PostDeltaResponse, AgentError> {
        let body = PostDeltaBody {
            entity_keys,
            is_agent,
            deltas: filter_deltas(deltas),
        };
        let res = self.client.execute(self.request(&body)?).await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(AgentError::Uplink {
                status: status.as_u16(),
                body: text,
            });
        }
        debug!(status = status.as_u16(), deltas = body.deltas.len(), "deltas accepted");
        parse_response(&text)
    }
}

fn parse_response(text: &str) -> Result<PostDeltaResponse, AgentError> {
    if text.trim().is_empty() {
        return Ok(PostDeltaResponse::default());
    }
    Ok(match serde_json::from_str(text)? {
        ResponseBody::Wrapped { payload } => payload,
        ResponseBody::Plain(res) => res,
    })
}

/// Offline logging mode: deltas are logged and acknowledged without leaving the host.
#[derive(Debug, Default)]
pub struct OfflineLogger;

#[async_trait]
impl DeltaPoster for OfflineLogger {
    async fn post_deltas(
        &self,
        entity_keys: Vec<String>,
        is_agent: bool,
        deltas: Vec<RawDelta>,
    ) -> Result<PostDeltaResponse, AgentError> {
        let deltas = filter_deltas(deltas);
        info!(entity = ?entity_keys, deltas = deltas.len(), "suppressed delta post");
        for d in &deltas {
            debug!(
                source = %d.source,
                id = d.id,
                full = d.full_diff,
                is_agent,
                diff = %serde_json::Value::Object(d.diff.clone()),
                "delta"
            );
        }
        Ok(PostDeltaResponse::default())
    }
}
