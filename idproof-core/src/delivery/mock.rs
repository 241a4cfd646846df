//! Recording delivery provider for tests and local runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DeliveryError, DeliveryProvider, OutboundMessage};
use crate::types::{ChallengeId, Channel};

/// Copy of a delivered message. Holds the plaintext body; test use only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub challenge_id: ChallengeId,
    pub channel: Channel,
    pub destination: String,
    pub body: String,
}

impl RecordedMessage {
    /// First run of six consecutive digits in the body.
    pub fn code(&self) -> Option<String> {
        self.body
            .split(|c: char| !c.is_ascii_digit())
            .find(|run| run.len() == 6)
            .map(str::to_string)
    }
}

/// Keeps every message it accepts. Can be told to fail the next N sends.
#[derive(Default)]
pub struct RecordingProvider {
    sent: Mutex<Vec<RecordedMessage>>,
    transient_failures: AtomicU32,
    reject_all: bool,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_transiently(times: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(times),
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_all: true,
            ..Self::default()
        }
    }

    /// Fail the next `times` sends with a transient error.
    pub fn fail_next(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RecordedMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn last(&self) -> Option<RecordedMessage> {
        self.sent().pop()
    }
}

#[async_trait]
impl DeliveryProvider for RecordingProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if self.reject_all {
            return Err(DeliveryError::Permanent("destination rejected".into()));
        }
        let should_fail = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DeliveryError::Transient("provider unavailable".into()));
        }

        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedMessage {
                challenge_id: message.challenge_id,
                channel: message.channel,
                destination: message.destination.clone(),
                body: message.body.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_extraction() {
        let message = RecordedMessage {
            challenge_id: uuid::Uuid::new_v4(),
            channel: Channel::Email,
            destination: "a@example.com".into(),
            body: "Your code is 482913. It expires in 5 minutes.".into(),
        };
        assert_eq!(message.code().as_deref(), Some("482913"));
    }
}
