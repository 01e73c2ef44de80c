//! Channel webhook notifications
//!
//! Posts notification payloads as JSON to one webhook URL per channel kind.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::agents::{ChannelSender, NotificationPayload};
use crate::config::ChannelWebhooks;
use crate::domain::ChannelKind;
use crate::error::{OrraError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Webhook client for all notification channels
#[derive(Clone)]
pub struct WebhookChannelSender {
    client: Client,
    webhooks: ChannelWebhooks,
}

impl WebhookChannelSender {
    /// Fails when the urgent channel has no webhook; 2FA escalations depend on it
    pub fn new(webhooks: ChannelWebhooks) -> Result<Self> {
        if webhooks.urgent.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(OrraError::Configuration(
                "notification.channels.urgent webhook URL is required".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        info!("Channel webhook notifications enabled");
        Ok(Self { client, webhooks })
    }

    fn url_for(&self, channel: ChannelKind) -> Option<&str> {
        let url = match channel {
            ChannelKind::Chat => &self.webhooks.chat,
            ChannelKind::Messaging => &self.webhooks.messaging,
            ChannelKind::Email => &self.webhooks.email,
            ChannelKind::Urgent => &self.webhooks.urgent,
        };
        url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

#[async_trait]
impl ChannelSender for WebhookChannelSender {
    async fn send(&self, channel: ChannelKind, payload: &NotificationPayload) -> Result<()> {
        let Some(url) = self.url_for(channel) else {
            return Err(OrraError::Configuration(format!(
                "no webhook configured for channel {}",
                channel
            )));
        };

        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| OrraError::TransientIo(format!("{} webhook unreachable: {}", channel, e)))?;

        if resp.status().is_success() {
            debug!(channel = %channel, event_id = %payload.event_id, "Notification sent successfully");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!(channel = %channel, "Notification webhook failed: {} - {}", status, body);
            Err(OrraError::TransientIo(format!("HTTP {}: {}", status, body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhooks() -> ChannelWebhooks {
        ChannelWebhooks {
            chat: Some("http://localhost:9/chat".to_string()),
            messaging: None,
            email: Some(" ".to_string()),
            urgent: Some("http://localhost:9/urgent".to_string()),
        }
    }

    #[test]
    fn test_urgent_webhook_required() {
        let mut cfg = webhooks();
        cfg.urgent = None;
        let err = WebhookChannelSender::new(cfg).err().unwrap();
        assert!(err.is_fatal_at_boot());
    }

    #[test]
    fn test_channel_urls() {
        let sender = WebhookChannelSender::new(webhooks()).unwrap();
        assert_eq!(sender.url_for(ChannelKind::Chat), Some("http://localhost:9/chat"));
        assert_eq!(sender.url_for(ChannelKind::Messaging), None);
        assert_eq!(sender.url_for(ChannelKind::Email), None);
        assert!(sender.url_for(ChannelKind::Urgent).is_some());
    }
}
