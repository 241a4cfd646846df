//! Folds proof records into the user's verification level.
//!
//! The level itself is a pure function of four signals. [`Aggregator`] reads
//! the proof records, applies that function, and overwrites the stored state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::repository::Repository;
use crate::types::{Channel, UserId};

/// Ordered trust ladder. Comparisons follow declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationLevel {
    #[default]
    None,
    Email,
    Phone,
    Identity,
    #[serde(rename = "IDENTITY_2FA")]
    Identity2fa,
}

impl VerificationLevel {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationLevel::None => "NONE",
            VerificationLevel::Email => "EMAIL",
            VerificationLevel::Phone => "PHONE",
            VerificationLevel::Identity => "IDENTITY",
            VerificationLevel::Identity2fa => "IDENTITY_2FA",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "EMAIL" => VerificationLevel::Email,
            "PHONE" => VerificationLevel::Phone,
            "IDENTITY" => VerificationLevel::Identity,
            "IDENTITY_2FA" => VerificationLevel::Identity2fa,
            _ => VerificationLevel::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub phone_verified: bool,
    pub email_verified: bool,
    pub two_factor_enabled: bool,
    pub identity_verified: bool,
}

pub fn compute_level(signals: &Signals) -> VerificationLevel {
    match signals {
        Signals {
            identity_verified: true,
            two_factor_enabled: true,
            ..
        } => VerificationLevel::Identity2fa,
        Signals {
            identity_verified: true,
            ..
        } => VerificationLevel::Identity,
        Signals {
            phone_verified: true,
            ..
        } => VerificationLevel::Phone,
        Signals {
            email_verified: true,
            ..
        } => VerificationLevel::Email,
        _ => VerificationLevel::None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVerificationState {
    pub user_id: UserId,
    pub phone_verified: bool,
    pub email_verified: bool,
    pub two_factor_enabled: bool,
    pub identity_verified: bool,
    pub verification_level: VerificationLevel,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserVerificationState {
    /// All-false state for a user with no proofs.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            phone_verified: false,
            email_verified: false,
            two_factor_enabled: false,
            identity_verified: false,
            verification_level: VerificationLevel::None,
            updated_at: None,
        }
    }

    pub fn from_signals(user_id: UserId, signals: Signals, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            phone_verified: signals.phone_verified,
            email_verified: signals.email_verified,
            two_factor_enabled: signals.two_factor_enabled,
            identity_verified: signals.identity_verified,
            verification_level: compute_level(&signals),
            updated_at: Some(now),
        }
    }
}

pub struct Aggregator {
    repo: Arc<dyn Repository>,
    /// Serializes recomputation per user so the last write reflects the latest reads.
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Aggregator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            locks: DashMap::new(),
        }
    }

    pub async fn signals(&self, user_id: UserId) -> Result<Signals> {
        let contacts = self.repo.contact_points(user_id).await?;
        let totp_confirmed = self
            .repo
            .get_authenticator(user_id)
            .await?
            .map(|c| c.confirmed)
            .unwrap_or(false);
        let has_passkey = !self.repo.list_credentials(user_id).await?.is_empty();

        Ok(Signals {
            phone_verified: contacts.iter().any(|c| c.channel == Channel::Phone),
            email_verified: contacts.iter().any(|c| c.channel == Channel::Email),
            two_factor_enabled: totp_confirmed || has_passkey,
            identity_verified: self.repo.has_approved_attempt(user_id).await?,
        })
    }

    /// Re-read every proof for `user_id` and persist the resulting state.
    pub async fn recompute(&self, user_id: UserId, now: DateTime<Utc>) -> Result<UserVerificationState> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.recompute_locked(user_id, now).await
        };
        drop(lock);
        // Only the map's own handle left means no recompute is queued for this user.
        self.locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn recompute_locked(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<UserVerificationState> {
        let previous = self.repo.get_state(user_id).await?;
        let state = UserVerificationState::from_signals(user_id, self.signals(user_id).await?, now);
        self.repo.put_state(state.clone()).await?;

        let previous_level = previous.map(|s| s.verification_level).unwrap_or_default();
        if previous_level != state.verification_level {
            tracing::info!(
                user_id = %user_id,
                from = previous_level.as_str(),
                to = state.verification_level.as_str(),
                "Verification level changed"
            );
        }
        Ok(state)
    }

    /// Stored state, or the all-false default for an unknown user.
    pub async fn current(&self, user_id: UserId) -> Result<UserVerificationState> {
        Ok(self
            .repo
            .get_state(user_id)
            .await?
            .unwrap_or_else(|| UserVerificationState::empty(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ContactPoint, MemoryRepository};
    use uuid::Uuid;

    fn signals(phone: bool, email: bool, two_factor: bool, identity: bool) -> Signals {
        Signals {
            phone_verified: phone,
            email_verified: email,
            two_factor_enabled: two_factor,
            identity_verified: identity,
        }
    }

    #[test]
    fn test_ladder_order() {
        assert!(VerificationLevel::None < VerificationLevel::Email);
        assert!(VerificationLevel::Email < VerificationLevel::Phone);
        assert!(VerificationLevel::Phone < VerificationLevel::Identity);
        assert!(VerificationLevel::Identity < VerificationLevel::Identity2fa);
        assert_eq!(VerificationLevel::Identity2fa.rank(), 4);
    }

    #[test]
    fn test_compute_level_table() {
        assert_eq!(compute_level(&Signals::default()), VerificationLevel::None);
        assert_eq!(compute_level(&signals(false, true, false, false)), VerificationLevel::Email);
        assert_eq!(compute_level(&signals(true, true, false, false)), VerificationLevel::Phone);
        assert_eq!(compute_level(&signals(false, false, true, false)), VerificationLevel::None);
        assert_eq!(compute_level(&signals(false, false, false, true)), VerificationLevel::Identity);
        assert_eq!(
            compute_level(&signals(false, false, true, true)),
            VerificationLevel::Identity2fa
        );
    }

    #[test]
    fn test_adding_a_signal_never_lowers_level() {
        for bits in 0u8..16 {
            let base = signals(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
            for extra in 0..4 {
                let mut more = base;
                match extra {
                    0 => more.phone_verified = true,
                    1 => more.email_verified = true,
                    2 => more.two_factor_enabled = true,
                    _ => more.identity_verified = true,
                }
                assert!(compute_level(&more) >= compute_level(&base));
            }
        }
    }

    #[test]
    fn test_level_serializes_as_ladder_name() {
        assert_eq!(
            serde_json::to_string(&VerificationLevel::Identity2fa).unwrap(),
            "\"IDENTITY_2FA\""
        );
        assert_eq!(VerificationLevel::from_str_lossy("PHONE"), VerificationLevel::Phone);
    }

    #[tokio::test]
    async fn test_recompute_persists_state() {
        let repo = Arc::new(MemoryRepository::new());
        let aggregator = Aggregator::new(repo.clone());
        let user = Uuid::new_v4();

        assert_eq!(
            aggregator.current(user).await.unwrap(),
            UserVerificationState::empty(user)
        );

        repo.mark_contact_verified(ContactPoint {
            user_id: user,
            channel: Channel::Phone,
            destination: "+15551234567".into(),
            verified_at: Utc::now(),
        })
        .await
        .unwrap();

        let state = aggregator.recompute(user, Utc::now()).await.unwrap();
        assert!(state.phone_verified);
        assert_eq!(state.verification_level, VerificationLevel::Phone);
        assert_eq!(aggregator.current(user).await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_recompute_releases_per_user_lock() {
        let repo = Arc::new(MemoryRepository::new());
        let aggregator = Arc::new(Aggregator::new(repo));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let aggregator = aggregator.clone();
                let user = if i % 2 == 0 { Uuid::new_v4() } else { Uuid::nil() };
                tokio::spawn(async move { aggregator.recompute(user, Utc::now()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(aggregator.locks.is_empty());
    }
}
