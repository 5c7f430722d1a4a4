//! Outbound channel providers.
//!
//! A provider takes one batch of messages for a single channel and reports
//! an outcome per message. Providers never touch the database; the send
//! pipeline turns their outcomes into delivery status updates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use unveil_types::Channel;

use crate::signature::{SIGNATURE_HEADER, sign};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub delivery_id: Uuid,
    pub channel: Channel,
    /// Phone number, email address or user id, depending on the channel.
    pub to: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub delivery_id: Uuid,
    pub accepted: bool,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProviderOutcome {
    pub fn accepted(delivery_id: Uuid, provider_message_id: impl Into<String>) -> Self {
        Self {
            delivery_id,
            accepted: true,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    pub fn rejected(delivery_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            delivery_id,
            accepted: false,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// One delivery channel's transport.
///
/// `send_batch` returning `Err` means the whole batch failed to reach the
/// provider. Per-message rejections are reported as outcomes instead.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send_batch(&self, batch: Vec<OutboundMessage>) -> Result<Vec<ProviderOutcome>>;
}

// -- Log provider --

/// Dry-run provider: logs every message and accepts it with a synthetic id.
pub struct LogProvider {
    channel: Channel,
}

impl LogProvider {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_batch(&self, batch: Vec<OutboundMessage>) -> Result<Vec<ProviderOutcome>> {
        Ok(batch
            .into_iter()
            .map(|msg| {
                info!("[dry-run {}] to {}: {:?}", self.channel, msg.to, msg.body);
                ProviderOutcome::accepted(msg.delivery_id, format!("log-{}", Uuid::new_v4()))
            })
            .collect())
    }
}

// -- Webhook provider --

#[derive(Serialize)]
struct RelayRequest<'a> {
    channel: Channel,
    messages: &'a [OutboundMessage],
}

#[derive(Deserialize)]
struct RelayResponse {
    outcomes: Vec<ProviderOutcome>,
}

/// Posts each batch as JSON to a relay service that fronts the real
/// carrier (Twilio, APNs/FCM, an SMTP gateway). The body is signed with
/// the shared webhook secret so the relay can authenticate us.
pub struct WebhookProvider {
    channel: Channel,
    url: String,
    secret: Vec<u8>,
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(channel: Channel, url: impl Into<String>, secret: impl Into<Vec<u8>>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            channel,
            url: url.into(),
            secret: secret.into(),
            client,
        })
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_batch(&self, batch: Vec<OutboundMessage>) -> Result<Vec<ProviderOutcome>> {
        let body = serde_json::to_vec(&RelayRequest {
            channel: self.channel,
            messages: &batch,
        })?;
        let signature = sign(&self.secret, &body)?;

        debug!("POST {} ({} {} messages)", self.url, batch.len(), self.channel);
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .with_context(|| format!("{} relay unreachable", self.channel))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("{} relay returned {}: {}", self.channel, status, text.chars().take(256).collect::<String>());
        }

        let parsed: RelayResponse = resp
            .json()
            .await
            .with_context(|| format!("{} relay sent an unreadable response", self.channel))?;
        Ok(parsed.outcomes)
    }
}

// -- Provider set --

/// One provider per channel.
#[derive(Clone)]
pub struct ProviderSet {
    pub sms: Arc<dyn ChannelProvider>,
    pub push: Arc<dyn ChannelProvider>,
    pub email: Arc<dyn ChannelProvider>,
}

impl ProviderSet {
    /// Dry-run providers on every channel.
    pub fn logging() -> Self {
        Self {
            sms: Arc::new(LogProvider::new(Channel::Sms)),
            push: Arc::new(LogProvider::new(Channel::Push)),
            email: Arc::new(LogProvider::new(Channel::Email)),
        }
    }

    pub fn get(&self, channel: Channel) -> &Arc<dyn ChannelProvider> {
        match channel {
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
            Channel::Email => &self.email,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_provider_accepts_everything() {
        let provider = LogProvider::new(Channel::Sms);
        let batch = vec![
            OutboundMessage {
                delivery_id: Uuid::new_v4(),
                channel: Channel::Sms,
                to: "+15551111111".into(),
                body: "hello".into(),
            },
            OutboundMessage {
                delivery_id: Uuid::new_v4(),
                channel: Channel::Sms,
                to: "+15552222222".into(),
                body: "hello".into(),
            },
        ];
        let outcomes = provider.send_batch(batch.clone()).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        for (msg, outcome) in batch.iter().zip(&outcomes) {
            assert_eq!(outcome.delivery_id, msg.delivery_id);
            assert!(outcome.accepted);
            assert!(outcome.provider_message_id.as_deref().unwrap().starts_with("log-"));
        }
    }

    #[test]
    fn relay_outcomes_tolerate_missing_optionals() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"outcomes":[{{"delivery_id":"{id}","accepted":false}}]}}"#);
        let parsed: RelayResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.outcomes[0].delivery_id, id);
        assert!(!parsed.outcomes[0].accepted);
        assert!(parsed.outcomes[0].error.is_none());
    }
}
