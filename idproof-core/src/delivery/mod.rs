//! Outbound delivery of one-time codes.
//!
//! Sending is an explicit async task: the [`Dispatcher`] spawns it, retries
//! transient failures with exponential backoff, and reports the outcome on a
//! oneshot channel. A failed delivery never touches the challenge it carries.

mod mock;
mod webhook;

pub use mock::{RecordedMessage, RecordingProvider};
pub use webhook::{DisabledProvider, WebhookProvider};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry_notify, ExponentialBackoff};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::types::{ChallengeId, Channel};

/// A rendered message ready for a provider. The body holds the plaintext code
/// and is wiped on drop.
pub struct OutboundMessage {
    pub challenge_id: ChallengeId,
    pub channel: Channel,
    pub destination: String,
    pub body: Zeroizing<String>,
}

impl std::fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("challenge_id", &self.challenge_id)
            .field("channel", &self.channel)
            .field("body", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("delivery rejected: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Outcome of a dispatch, reported separately from challenge validity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl DeliveryStatus {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryStatus::Sent { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl DispatchPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        }
    }
}

pub struct Dispatcher {
    provider: Arc<dyn DeliveryProvider>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn DeliveryProvider>, policy: DispatchPolicy) -> Self {
        Self { provider, policy }
    }

    /// Spawn delivery of `message`; the receiver yields its final status.
    pub fn dispatch(&self, message: OutboundMessage) -> oneshot::Receiver<DeliveryStatus> {
        let (tx, rx) = oneshot::channel();
        let provider = Arc::clone(&self.provider);
        let policy = self.policy.clone();

        tokio::spawn(async move {
            let status = deliver(provider.as_ref(), &message, &policy).await;
            match &status {
                DeliveryStatus::Sent { attempts } => info!(
                    challenge_id = %message.challenge_id,
                    channel = message.channel.as_str(),
                    attempts,
                    "Code delivered"
                ),
                DeliveryStatus::Failed { attempts, reason } => warn!(
                    challenge_id = %message.challenge_id,
                    channel = message.channel.as_str(),
                    attempts,
                    reason = %reason,
                    "Code delivery failed"
                ),
            }
            let _ = tx.send(status);
        });

        rx
    }

    /// Dispatch and wait for the outcome.
    pub async fn dispatch_and_wait(&self, message: OutboundMessage) -> DeliveryStatus {
        self.dispatch(message)
            .await
            .unwrap_or_else(|_| DeliveryStatus::Failed {
                attempts: 0,
                reason: "delivery task aborted".into(),
            })
    }
}

async fn deliver(
    provider: &dyn DeliveryProvider,
    message: &OutboundMessage,
    policy: &DispatchPolicy,
) -> DeliveryStatus {
    let attempts = AtomicU32::new(0);
    let attempts_ref = &attempts;
    let max_attempts = policy.max_attempts.max(1);

    let result = retry_notify(
        policy.backoff(),
        move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            match provider.send(message).await {
                Ok(()) => Ok(()),
                Err(DeliveryError::Transient(reason)) if attempt < max_attempts => {
                    Err(backoff::Error::transient(reason))
                }
                Err(DeliveryError::Transient(reason)) | Err(DeliveryError::Permanent(reason)) => {
                    Err(backoff::Error::permanent(reason))
                }
            }
        },
        |reason: String, duration: Duration| {
            warn!(
                reason = %reason,
                retry_after_ms = duration.as_millis() as u64,
                "Delivery retry scheduled"
            );
        },
    )
    .await;

    let attempts = attempts.load(Ordering::SeqCst);
    match result {
        Ok(()) => DeliveryStatus::Sent { attempts },
        Err(reason) => DeliveryStatus::Failed { attempts, reason },
    }
}
