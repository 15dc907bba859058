//! Webhook notifier: one URL per human queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::{QueueNotification, QueueNotifier};
use crate::error::ChannelError;
use crate::pipeline::area::Area;

pub struct WebhookNotifier {
    urls: HashMap<Area, String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(urls: HashMap<Area, String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("notifier client: {e}")))?;
        Ok(Self { urls, client })
    }

    pub fn has_target(&self, area: Area) -> bool {
        self.urls.contains_key(&area)
    }
}

#[async_trait]
impl QueueNotifier for WebhookNotifier {
    async fn notify(&self, notification: &QueueNotification) -> Result<(), ChannelError> {
        let Some(url) = self.urls.get(&notification.area) else {
            tracing::debug!(area = %notification.area, "No notification webhook configured");
            return Ok(());
        };

        let resp = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| ChannelError::NotifyFailed {
                target: notification.area.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ChannelError::NotifyFailed {
                target: notification.area.to_string(),
                reason: format!("webhook returned {}", resp.status()),
            });
        }

        tracing::debug!(
            area = %notification.area,
            kind = ?notification.kind,
            correlation_id = %notification.correlation_id,
            "Queue notified"
        );
        Ok(())
    }
}
