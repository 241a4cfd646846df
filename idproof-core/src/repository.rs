//! Durable proof records and the storage seam the engine writes through.
//!
//! Every method that changes state is a single atomic read-modify-write.
//! Status changes are compare-and-set against the value the caller read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::aggregate::UserVerificationState;
use crate::document::{
    AttemptStatus, DocumentAnalysisResult, IdentityVerificationAttempt, ReviewDecisionRecord,
};
use crate::error::StorageError;
use crate::types::{Channel, UserId};

type StoreResult<T> = std::result::Result<T, StorageError>;

/// A phone number or email address proven through an OTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub user_id: UserId,
    pub channel: Channel,
    pub destination: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCode {
    /// Hex SHA3-256 of the salted code.
    pub code_hash: String,
    pub used: bool,
}

/// Per-user TOTP credential. Only a confirmed credential counts as a factor.
#[derive(Clone)]
pub struct AuthenticatorCredential {
    pub user_id: UserId,
    pub secret: Zeroizing<Vec<u8>>,
    pub confirmed: bool,
    pub backup_codes: Vec<BackupCode>,
    /// Highest time step accepted so far.
    pub last_used_step: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for AuthenticatorCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatorCredential")
            .field("user_id", &self.user_id)
            .field("secret", &"[REDACTED]")
            .field("confirmed", &self.confirmed)
            .field("backup_codes", &self.backup_codes.len())
            .field("last_used_step", &self.last_used_step)
            .finish()
    }
}

impl AuthenticatorCredential {
    pub fn unused_backup_codes(&self) -> usize {
        self.backup_codes.iter().filter(|c| !c.used).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    /// Base64url credential id as reported by the authenticator.
    pub id: String,
    pub user_id: UserId,
    /// Verifier-specific public key material.
    pub public_key: serde_json::Value,
    pub sign_count: u32,
    pub device_label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Upsert on `(user_id, channel)`.
    async fn mark_contact_verified(&self, point: ContactPoint) -> StoreResult<()>;
    async fn contact_points(&self, user_id: UserId) -> StoreResult<Vec<ContactPoint>>;

    async fn get_authenticator(&self, user_id: UserId)
        -> StoreResult<Option<AuthenticatorCredential>>;
    /// Store a pending credential. Returns false if a confirmed one already exists.
    async fn put_pending_authenticator(&self, credential: AuthenticatorCredential)
        -> StoreResult<bool>;
    /// Flip `confirmed` false to true and record the accepted step, but only
    /// while the pending credential still holds `secret`.
    async fn confirm_authenticator(
        &self,
        user_id: UserId,
        secret: &[u8],
        step: i64,
    ) -> StoreResult<bool>;
    /// Accept `step` if it is newer than the last accepted one.
    async fn advance_totp_step(&self, user_id: UserId, step: i64) -> StoreResult<bool>;
    /// Mark the unused code with this hash used. Returns unused codes left, or
    /// `None` when nothing matched.
    async fn consume_backup_code(&self, user_id: UserId, code_hash: &str)
        -> StoreResult<Option<usize>>;
    async fn replace_backup_codes(&self, user_id: UserId, hashes: Vec<String>) -> StoreResult<bool>;
    async fn delete_authenticator(&self, user_id: UserId) -> StoreResult<bool>;

    async fn list_credentials(&self, user_id: UserId) -> StoreResult<Vec<WebAuthnCredential>>;
    async fn get_credential(&self, credential_id: &str) -> StoreResult<Option<WebAuthnCredential>>;
    /// Returns false if the id is already registered.
    async fn insert_credential(&self, credential: WebAuthnCredential) -> StoreResult<bool>;
    /// Compare-and-set the counter from `expected` to `new`.
    async fn update_sign_count(
        &self,
        credential_id: &str,
        expected: u32,
        new: u32,
        public_key: serde_json::Value,
        used_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn delete_credential(&self, user_id: UserId, credential_id: &str) -> StoreResult<bool>;

    /// Returns false if the user already has an active attempt.
    async fn insert_attempt(&self, attempt: IdentityVerificationAttempt) -> StoreResult<bool>;
    async fn get_attempt(&self, attempt_id: Uuid) -> StoreResult<Option<IdentityVerificationAttempt>>;
    /// Most recent by submission time, ties broken by resubmission count.
    async fn latest_attempt(&self, user_id: UserId)
        -> StoreResult<Option<IdentityVerificationAttempt>>;
    /// Overwrite the attempt only if its stored status still equals `expected`.
    async fn update_attempt_if(
        &self,
        attempt: &IdentityVerificationAttempt,
        expected: AttemptStatus,
    ) -> StoreResult<bool>;
    /// Oldest first.
    async fn attempts_with_status(
        &self,
        status: AttemptStatus,
        limit: usize,
    ) -> StoreResult<Vec<IdentityVerificationAttempt>>;
    async fn has_approved_attempt(&self, user_id: UserId) -> StoreResult<bool>;
    /// Move active attempts submitted before `cutoff` to `EXPIRED`.
    async fn expire_stale_attempts(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<UserId>>;

    /// Returns false if the attempt already has an analysis.
    async fn insert_analysis(&self, analysis: DocumentAnalysisResult) -> StoreResult<bool>;
    async fn get_analysis(&self, attempt_id: Uuid) -> StoreResult<Option<DocumentAnalysisResult>>;

    async fn record_review(&self, record: ReviewDecisionRecord) -> StoreResult<()>;
    async fn review_history(&self, attempt_id: Uuid) -> StoreResult<Vec<ReviewDecisionRecord>>;

    async fn get_state(&self, user_id: UserId) -> StoreResult<Option<UserVerificationState>>;
    async fn put_state(&self, state: UserVerificationState) -> StoreResult<()>;
}

/// In-process repository for tests and single-node runs without a database.
#[derive(Default)]
pub struct MemoryRepository {
    contacts: DashMap<(UserId, Channel), ContactPoint>,
    authenticators: DashMap<UserId, AuthenticatorCredential>,
    credentials: DashMap<String, WebAuthnCredential>,
    attempts: DashMap<Uuid, IdentityVerificationAttempt>,
    /// The one active attempt per user.
    active: DashMap<UserId, Uuid>,
    analyses: DashMap<Uuid, DocumentAnalysisResult>,
    reviews: DashMap<Uuid, Vec<ReviewDecisionRecord>>,
    states: DashMap<UserId, UserVerificationState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn mark_contact_verified(&self, point: ContactPoint) -> StoreResult<()> {
        self.contacts.insert((point.user_id, point.channel), point);
        Ok(())
    }

    async fn contact_points(&self, user_id: UserId) -> StoreResult<Vec<ContactPoint>> {
        let mut points: Vec<_> = [Channel::Phone, Channel::Email]
            .into_iter()
            .filter_map(|channel| self.contacts.get(&(user_id, channel)).map(|p| p.clone()))
            .collect();
        points.sort_by_key(|p| p.verified_at);
        Ok(points)
    }

    async fn get_authenticator(
        &self,
        user_id: UserId,
    ) -> StoreResult<Option<AuthenticatorCredential>> {
        Ok(self.authenticators.get(&user_id).map(|c| c.clone()))
    }

    async fn put_pending_authenticator(
        &self,
        credential: AuthenticatorCredential,
    ) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;

        match self.authenticators.entry(credential.user_id) {
            Entry::Occupied(existing) if existing.get().confirmed => Ok(false),
            Entry::Occupied(mut existing) => {
                existing.insert(credential);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(credential);
                Ok(true)
            }
        }
    }

    async fn confirm_authenticator(
        &self,
        user_id: UserId,
        secret: &[u8],
        step: i64,
    ) -> StoreResult<bool> {
        match self.authenticators.get_mut(&user_id) {
            Some(mut credential)
                if !credential.confirmed
                    && bool::from(credential.secret.as_slice().ct_eq(secret)) =>
            {
                credential.confirmed = true;
                credential.last_used_step = Some(step);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_totp_step(&self, user_id: UserId, step: i64) -> StoreResult<bool> {
        match self.authenticators.get_mut(&user_id) {
            Some(mut credential) if credential.last_used_step.map_or(true, |last| step > last) => {
                credential.last_used_step = Some(step);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_backup_code(
        &self,
        user_id: UserId,
        code_hash: &str,
    ) -> StoreResult<Option<usize>> {
        let Some(mut credential) = self.authenticators.get_mut(&user_id) else {
            return Ok(None);
        };
        let Some(code) = credential
            .backup_codes
            .iter_mut()
            .find(|c| !c.used && c.code_hash == code_hash)
        else {
            return Ok(None);
        };
        code.used = true;
        Ok(Some(credential.unused_backup_codes()))
    }

    async fn replace_backup_codes(&self, user_id: UserId, hashes: Vec<String>) -> StoreResult<bool> {
        match self.authenticators.get_mut(&user_id) {
            Some(mut credential) => {
                credential.backup_codes = hashes
                    .into_iter()
                    .map(|code_hash| BackupCode {
                        code_hash,
                        used: false,
                    })
                    .collect();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_authenticator(&self, user_id: UserId) -> StoreResult<bool> {
        Ok(self.authenticators.remove(&user_id).is_some())
    }

    async fn list_credentials(&self, user_id: UserId) -> StoreResult<Vec<WebAuthnCredential>> {
        let mut creds: Vec<_> = self
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.clone())
            .collect();
        creds.sort_by_key(|c| c.created_at);
        Ok(creds)
    }

    async fn get_credential(&self, credential_id: &str) -> StoreResult<Option<WebAuthnCredential>> {
        Ok(self.credentials.get(credential_id).map(|c| c.clone()))
    }

    async fn insert_credential(&self, credential: WebAuthnCredential) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;

        match self.credentials.entry(credential.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(credential);
                Ok(true)
            }
        }
    }

    async fn update_sign_count(
        &self,
        credential_id: &str,
        expected: u32,
        new: u32,
        public_key: serde_json::Value,
        used_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.credentials.get_mut(credential_id) {
            Some(mut credential) if credential.sign_count == expected => {
                credential.sign_count = new;
                credential.public_key = public_key;
                credential.last_used_at = Some(used_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_credential(&self, user_id: UserId, credential_id: &str) -> StoreResult<bool> {
        Ok(self
            .credentials
            .remove_if(credential_id, |_, c| c.user_id == user_id)
            .is_some())
    }

    async fn insert_attempt(&self, attempt: IdentityVerificationAttempt) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;

        // Lock order: `active` then `attempts`.
        match self.active.entry(attempt.user_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(attempt.id);
                self.attempts.insert(attempt.id, attempt);
                Ok(true)
            }
        }
    }

    async fn get_attempt(
        &self,
        attempt_id: Uuid,
    ) -> StoreResult<Option<IdentityVerificationAttempt>> {
        Ok(self.attempts.get(&attempt_id).map(|a| a.clone()))
    }

    async fn latest_attempt(
        &self,
        user_id: UserId,
    ) -> StoreResult<Option<IdentityVerificationAttempt>> {
        Ok(self
            .attempts
            .iter()
            .filter(|a| a.user_id == user_id)
            .max_by_key(|a| (a.submitted_at, a.resubmission_count))
            .map(|a| a.clone()))
    }

    async fn update_attempt_if(
        &self,
        attempt: &IdentityVerificationAttempt,
        expected: AttemptStatus,
    ) -> StoreResult<bool> {
        {
            let Some(mut stored) = self.attempts.get_mut(&attempt.id) else {
                return Ok(false);
            };
            if stored.status != expected {
                return Ok(false);
            }
            *stored = attempt.clone();
        }

        if !attempt.status.is_active() {
            self.active
                .remove_if(&attempt.user_id, |_, active_id| *active_id == attempt.id);
        }
        Ok(true)
    }

    async fn attempts_with_status(
        &self,
        status: AttemptStatus,
        limit: usize,
    ) -> StoreResult<Vec<IdentityVerificationAttempt>> {
        let mut matching: Vec<_> = self
            .attempts
            .iter()
            .filter(|a| a.status == status)
            .map(|a| a.clone())
            .collect();
        matching.sort_by_key(|a| a.submitted_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn has_approved_attempt(&self, user_id: UserId) -> StoreResult<bool> {
        Ok(self
            .attempts
            .iter()
            .any(|a| a.user_id == user_id && a.status.is_approval()))
    }

    async fn expire_stale_attempts(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<UserId>> {
        let mut expired = Vec::new();
        for mut attempt in self.attempts.iter_mut() {
            if attempt.status.is_active() && attempt.submitted_at < cutoff {
                attempt.reject(AttemptStatus::Expired, "attempt expired before a decision");
                expired.push((attempt.user_id, attempt.id));
            }
        }

        let mut users = Vec::with_capacity(expired.len());
        for (user_id, attempt_id) in expired {
            self.active.remove_if(&user_id, |_, id| *id == attempt_id);
            users.push(user_id);
        }
        Ok(users)
    }

    async fn insert_analysis(&self, analysis: DocumentAnalysisResult) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;

        match self.analyses.entry(analysis.attempt_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(analysis);
                Ok(true)
            }
        }
    }

    async fn get_analysis(&self, attempt_id: Uuid) -> StoreResult<Option<DocumentAnalysisResult>> {
        Ok(self.analyses.get(&attempt_id).map(|a| a.clone()))
    }

    async fn record_review(&self, record: ReviewDecisionRecord) -> StoreResult<()> {
        self.reviews.entry(record.attempt_id).or_default().push(record);
        Ok(())
    }

    async fn review_history(&self, attempt_id: Uuid) -> StoreResult<Vec<ReviewDecisionRecord>> {
        Ok(self
            .reviews
            .get(&attempt_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn get_state(&self, user_id: UserId) -> StoreResult<Option<UserVerificationState>> {
        Ok(self.states.get(&user_id).map(|s| s.clone()))
    }

    async fn put_state(&self, state: UserVerificationState) -> StoreResult<()> {
        self.states.insert(state.user_id, state);
        Ok(())
    }
}
