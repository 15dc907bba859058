//! Adapter for the legacy router, reached over HTTP.
//!
//! The legacy service accepts the same inbound payload as our webhook and
//! answers with the same result body, so both implementations are
//! interchangeable behind [`MessageHandler`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::pipeline::types::{InboundMessage, MessageHandler, PipelineResult};

pub struct LegacyHttpHandler {
    url: String,
    client: reqwest::Client,
}

impl LegacyHttpHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("legacy client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn call(
        &self,
        message: &InboundMessage,
        correlation_id: Uuid,
    ) -> Result<PipelineResult, ChannelError> {
        let mut payload = message.clone();
        if let Some(meta) = payload.metadata.as_object_mut() {
            meta.insert(
                "correlation_id".into(),
                serde_json::Value::String(correlation_id.to_string()),
            );
        }

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "legacy".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ChannelError::Http(format!("legacy body: {e}")))?;

        // The legacy service reports its own failures in a structured body,
        // even on non-2xx responses.
        match serde_json::from_str::<PipelineResult>(&body) {
            Ok(result) => Ok(result),
            Err(e) => Err(ChannelError::Http(format!(
                "legacy returned {status} with unreadable body: {e}"
            ))),
        }
    }
}

#[async_trait]
impl MessageHandler for LegacyHttpHandler {
    fn name(&self) -> &str {
        "legacy"
    }

    async fn handle(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
        let start = Instant::now();
        match self.call(message, correlation_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(correlation_id = %correlation_id, "Legacy call failed: {e}");
                PipelineResult::failure(
                    correlation_id,
                    start.elapsed().as_millis() as u64,
                    e.to_string(),
                )
            }
        }
    }
}
