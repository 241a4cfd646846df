//! Delivery through an HTTP webhook owned by the host's messaging stack.

use async_trait::async_trait;
use serde::Serialize;

use super::{DeliveryError, DeliveryProvider, OutboundMessage};
use crate::error::Result;
use crate::http::{HttpClientConfig, JsonHttpClient};
use crate::types::{ChallengeId, Channel};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    challenge_id: ChallengeId,
    channel: Channel,
    destination: &'a str,
    body: &'a str,
}

/// Posts each message as JSON. Retrying is left to the dispatcher.
pub struct WebhookProvider {
    client: JsonHttpClient,
    url: String,
    token: Option<String>,
}

impl WebhookProvider {
    pub fn new(url: impl Into<String>, token: Option<String>, config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            client: JsonHttpClient::new(config)?,
            url: url.into(),
            token,
        })
    }
}

impl std::fmt::Debug for WebhookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProvider")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeliveryProvider for WebhookProvider {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError> {
        let payload = WebhookPayload {
            challenge_id: message.challenge_id,
            channel: message.channel,
            destination: &message.destination,
            body: message.body.as_str(),
        };

        self.client
            .send_once(&self.url, self.token.as_deref(), &payload, "delivery webhook")
            .await
            .map(|_| ())
            .map_err(|e| match e {
                backoff::Error::Transient { err, .. } => DeliveryError::Transient(err.to_string()),
                backoff::Error::Permanent(err) => DeliveryError::Permanent(err.to_string()),
            })
    }
}

/// Used when no delivery channel is configured. Every send is refused.
#[derive(Debug, Default)]
pub struct DisabledProvider;

#[async_trait]
impl DeliveryProvider for DisabledProvider {
    async fn send(&self, _message: &OutboundMessage) -> std::result::Result<(), DeliveryError> {
        Err(DeliveryError::Permanent(
            "no delivery provider configured".into(),
        ))
    }
}
