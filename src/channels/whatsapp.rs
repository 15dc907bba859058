//! WhatsApp Cloud API channel: sends text replies through the Graph API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{OutboundChannel, SendReceipt};
use crate::error::ChannelError;

/// Maximum body length accepted for a text message.
const WHATSAPP_MAX_TEXT_LENGTH: usize = 4096;

const CHANNEL_NAME: &str = "whatsapp";

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

pub struct WhatsAppChannel {
    api_base: String,
    phone_number_id: String,
    access_token: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(
        api_base: impl Into<String>,
        phone_number_id: impl Into<String>,
        access_token: SecretString,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("whatsapp client: {e}")))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            phone_number_id: phone_number_id.into(),
            access_token,
            timeout,
            client,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base, self.phone_number_id)
    }
}

/// Truncate on a char boundary.
fn clamp_text(text: &str) -> &str {
    match text.char_indices().nth(WHATSAPP_MAX_TEXT_LENGTH) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl OutboundChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn send(&self, contact: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": contact.trim_start_matches('+'),
            "type": "text",
            "text": { "preview_url": false, "body": clamp_text(text) },
        });

        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout {
                        name: CHANNEL_NAME.into(),
                        timeout: self.timeout,
                    }
                } else {
                    ChannelError::SendFailed {
                        name: CHANNEL_NAME.into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("messages returned {status}: {err}"),
            });
        }

        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("whatsapp response: {e}")))?;

        let channel_message_id = parsed.messages.into_iter().next().map(|m| m.id);
        tracing::debug!(
            contact,
            channel_message_id = channel_message_id.as_deref().unwrap_or(""),
            "WhatsApp message sent"
        );
        Ok(SendReceipt { channel_message_id })
    }
}
