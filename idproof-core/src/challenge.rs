//! Ephemeral challenge storage backing OTP codes and WebAuthn ceremonies.
//!
//! Every challenge lives in a single slot keyed by `(subject, purpose, kind)`.
//! Issuing into an occupied slot replaces the previous challenge, so at most one
//! is ever live per key. Challenges are single-use and attempt-counted; checks
//! against an expired or exhausted challenge fail closed.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::types::{Channel, ChallengeId, ChallengeKey};

/// Secret material held by a challenge.
#[derive(Clone)]
pub enum Material {
    /// Digest of a one-time code. The plaintext is never stored here.
    Code {
        digest: [u8; 32],
        channel: Channel,
        destination: String,
    },
    /// Serialized ceremony state from the WebAuthn verifier.
    Ceremony {
        state: String,
        device_label: Option<String>,
    },
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Material::Code { channel, .. } => f
                .debug_struct("Code")
                .field("digest", &"[REDACTED]")
                .field("channel", channel)
                .finish_non_exhaustive(),
            Material::Ceremony { device_label, .. } => f
                .debug_struct("Ceremony")
                .field("state", &"[REDACTED]")
                .field("device_label", device_label)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: ChallengeId,
    pub key: ChallengeKey,
    pub material: Material,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub consumed: bool,
}

impl Challenge {
    /// Live means neither consumed nor past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && now <= self.expires_at
    }
}

/// Result of presenting a secret to a challenge.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The secret matched and the challenge is now consumed.
    Matched(Challenge),
    Mismatch { attempts_remaining: u32 },
    /// Absent, replaced, expired, exhausted or already consumed.
    Closed,
}

#[derive(Default)]
pub struct ChallengeStore {
    /// One slot per key; a consumed entry stays until replaced or swept.
    live: DashMap<ChallengeKey, Challenge>,
    /// Reverse lookup from challenge id to its slot.
    index: DashMap<ChallengeId, ChallengeKey>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a challenge for `key`, replacing whatever occupied the slot.
    pub fn issue(
        &self,
        key: ChallengeKey,
        material: Material,
        ttl: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> ChallengeId {
        let id = Uuid::new_v4();
        let challenge = Challenge {
            id,
            key,
            material,
            created_at: now,
            expires_at: now + ttl,
            attempts_used: 0,
            max_attempts: max_attempts.max(1),
            consumed: false,
        };

        self.index.insert(id, key);
        if let Some(previous) = self.live.insert(key, challenge) {
            self.index.remove(&previous.id);
            tracing::debug!(
                challenge_id = %previous.id,
                purpose = %key.purpose,
                "Replaced previous challenge"
            );
        }
        id
    }

    /// Id of the unconsumed challenge in `key`'s slot, if any.
    pub fn current_id(&self, key: &ChallengeKey) -> Option<ChallengeId> {
        self.live
            .get(key)
            .filter(|entry| !entry.consumed)
            .map(|entry| entry.id)
    }

    /// Snapshot of a challenge by id.
    pub fn get(&self, id: ChallengeId) -> Option<Challenge> {
        let key = self.index.get(&id).map(|entry| *entry.value())?;
        self.live
            .get(&key)
            .filter(|entry| entry.id == id)
            .map(|entry| entry.clone())
    }

    /// Present a code digest to the challenge.
    ///
    /// The whole check runs under the slot's entry lock, so two concurrent
    /// presentations of the right code yield at most one `Matched`.
    pub fn record_attempt(
        &self,
        id: ChallengeId,
        presented: &[u8; 32],
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        let Some(key) = self.index.get(&id).map(|entry| *entry.value()) else {
            return AttemptOutcome::Closed;
        };
        let Some(mut entry) = self.live.get_mut(&key) else {
            return AttemptOutcome::Closed;
        };
        let challenge = entry.value_mut();
        if challenge.id != id || challenge.consumed {
            return AttemptOutcome::Closed;
        }
        if now > challenge.expires_at || challenge.attempts_used >= challenge.max_attempts {
            challenge.consumed = true;
            return AttemptOutcome::Closed;
        }

        let Material::Code { digest, .. } = &challenge.material else {
            return AttemptOutcome::Closed;
        };
        let matched: bool = digest.ct_eq(presented).into();
        challenge.attempts_used += 1;

        if matched {
            challenge.consumed = true;
            return AttemptOutcome::Matched(challenge.clone());
        }

        let attempts_remaining = challenge.max_attempts - challenge.attempts_used;
        if attempts_remaining == 0 {
            challenge.consumed = true;
        }
        AttemptOutcome::Mismatch { attempts_remaining }
    }

    /// Mark a challenge consumed. Returns false if it was not live.
    pub fn consume(&self, id: ChallengeId, now: DateTime<Utc>) -> bool {
        let Some(key) = self.index.get(&id).map(|entry| *entry.value()) else {
            return false;
        };
        match self.live.get_mut(&key) {
            Some(mut entry) if entry.id == id && entry.is_live(now) => {
                entry.consumed = true;
                true
            }
            _ => false,
        }
    }

    /// Drop a challenge outright.
    pub fn expire(&self, id: ChallengeId) {
        if let Some((_, key)) = self.index.remove(&id) {
            self.live.remove_if(&key, |_, challenge| challenge.id == id);
        }
    }

    /// Atomically claim the live challenge in `key`'s slot.
    ///
    /// Used by ceremonies: the material is handed out exactly once, and an
    /// expired or consumed entry yields `None`.
    pub fn take(&self, key: &ChallengeKey, now: DateTime<Utc>) -> Option<Challenge> {
        let (_, challenge) = self.live.remove(key)?;
        self.index.remove(&challenge.id);
        if challenge.is_live(now) {
            Some(challenge)
        } else {
            None
        }
    }

    /// Remove expired and consumed challenges. Returns how many were dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.live.len();
        self.live.retain(|_, challenge| challenge.is_live(now));
        let removed = before.saturating_sub(self.live.len());

        self.index.retain(|id, key| {
            self.live
                .get(key)
                .map(|entry| entry.id == *id)
                .unwrap_or(false)
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
