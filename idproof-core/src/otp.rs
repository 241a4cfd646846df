//! Six-digit one-time codes sent to a phone number or email address.
//!
//! Only a peppered SHA3 digest of each code reaches the challenge store. The
//! plaintext lives in a zeroize-on-drop outbox until its challenge is consumed
//! or expires, so a failed delivery can be retried without minting a new code.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use zeroize::Zeroizing;

use crate::aggregate::{Aggregator, UserVerificationState};
use crate::challenge::{AttemptOutcome, ChallengeStore, Material};
use crate::clock::Clock;
use crate::delivery::{DeliveryStatus, Dispatcher, OutboundMessage};
use crate::error::{Result, VerificationError};
use crate::random;
use crate::rate_limit::{Operation, RateLimiter};
use crate::repository::{ContactPoint, Repository};
use crate::types::{ChallengeId, ChallengeKey, Channel, Purpose, UserId};

pub const CODE_LENGTH: usize = 6;

/// Source of plaintext codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> Result<Zeroizing<String>>;
}

#[derive(Debug, Default)]
pub struct SecureCodeGenerator;

impl CodeGenerator for SecureCodeGenerator {
    fn generate(&self) -> Result<Zeroizing<String>> {
        random::digits(CODE_LENGTH)
    }
}

/// Hands out a fixed sequence of codes, repeating the last one. Tests only.
pub struct SequenceCodeGenerator {
    codes: Mutex<VecDeque<String>>,
}

impl SequenceCodeGenerator {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: Mutex::new(codes.into_iter().map(Into::into).collect()),
        }
    }
}

impl CodeGenerator for SequenceCodeGenerator {
    fn generate(&self) -> Result<Zeroizing<String>> {
        let mut codes = self.codes.lock().unwrap_or_else(|p| p.into_inner());
        let code = if codes.len() > 1 {
            codes.pop_front()
        } else {
            codes.front().cloned()
        };
        code.map(Zeroizing::new)
            .ok_or_else(|| VerificationError::provider("code sequence exhausted"))
    }
}

#[derive(Clone)]
pub struct OtpConfig {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub pepper: Zeroizing<String>,
}

impl std::fmt::Debug for OtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpConfig")
            .field("ttl", &self.ttl)
            .field("max_attempts", &self.max_attempts)
            .field("pepper", &"[REDACTED]")
            .finish()
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(300),
            max_attempts: 5,
            pepper: Zeroizing::new(uuid::Uuid::new_v4().simple().to_string()),
        }
    }
}

/// Returned to the caller of `initiate`. Never carries the code.
#[derive(Debug, Clone, Serialize)]
pub struct OtpInitiation {
    pub challenge_ref: ChallengeId,
    pub expires_at: DateTime<Utc>,
    pub delivery: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpVerification {
    pub purpose: Purpose,
    pub state: UserVerificationState,
}

/// Check a destination and infer its channel.
///
/// Phones must be E.164 (`+` then 8 to 15 digits). Emails need one `@`, a
/// non-empty local part and a dotted domain.
pub fn validate_destination(destination: &str) -> Result<(Channel, String)> {
    let destination = destination.trim();
    if let Some(digits) = destination.strip_prefix('+') {
        let valid = (8..=15).contains(&digits.len())
            && digits.chars().all(|c| c.is_ascii_digit())
            && !digits.starts_with('0');
        return if valid {
            Ok((Channel::Phone, destination.to_string()))
        } else {
            Err(VerificationError::validation(
                "phone number must be in E.164 format",
            ))
        };
    }

    let invalid = || VerificationError::validation("invalid email address");
    if destination.chars().any(char::is_whitespace) || destination.len() > 254 {
        return Err(invalid());
    }
    let (local, domain) = destination.split_once('@').ok_or_else(invalid)?;
    let domain_ok = domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
        && !domain.contains('@');
    if local.is_empty() || !domain_ok {
        return Err(invalid());
    }
    Ok((
        Channel::Email,
        format!("{local}@{}", domain.to_ascii_lowercase()),
    ))
}

struct OutboxEntry {
    channel: Channel,
    destination: String,
    body: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

pub struct OtpManager {
    store: Arc<ChallengeStore>,
    repo: Arc<dyn Repository>,
    aggregator: Arc<Aggregator>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<Dispatcher>,
    codes: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    config: OtpConfig,
    /// Keyed by challenge id so a replaced challenge never lends its code.
    outbox: DashMap<ChallengeId, OutboxEntry>,
}

impl OtpManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChallengeStore>,
        repo: Arc<dyn Repository>,
        aggregator: Arc<Aggregator>,
        limiter: Arc<RateLimiter>,
        dispatcher: Arc<Dispatcher>,
        codes: Arc<dyn CodeGenerator>,
        clock: Arc<dyn Clock>,
        config: OtpConfig,
    ) -> Self {
        Self {
            store,
            repo,
            aggregator,
            limiter,
            dispatcher,
            codes,
            clock,
            config,
            outbox: DashMap::new(),
        }
    }

    fn digest(&self, subject: UserId, purpose: Purpose, code: &str) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.config.pepper.as_bytes());
        hasher.update(subject.as_bytes());
        hasher.update(purpose.as_str().as_bytes());
        hasher.update(code.as_bytes());

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }

    fn limits_for(&self, purpose: Purpose) -> (Duration, u32) {
        let policy = purpose.policy();
        let ttl = policy
            .ttl_cap_secs
            .map(|cap| self.config.ttl.min(Duration::seconds(cap as i64)))
            .unwrap_or(self.config.ttl);
        let attempts = policy
            .max_attempts_cap
            .map(|cap| self.config.max_attempts.min(cap))
            .unwrap_or(self.config.max_attempts);
        (ttl, attempts)
    }

    /// Issue a fresh code for `(subject, purpose)` and send it.
    ///
    /// Any earlier code for the same pair stops working. Delivery failure is
    /// reported in the result; the challenge stays valid.
    pub async fn initiate(
        &self,
        subject: UserId,
        destination: &str,
        purpose: Purpose,
        client_ip: Option<&str>,
    ) -> Result<OtpInitiation> {
        let (channel, destination) = validate_destination(destination)?;
        let now = self.clock.now();

        let subject_scope = subject.to_string();
        let ip_scope = client_ip.map(|ip| format!("ip:{ip}"));
        let mut scopes = vec![subject_scope.as_str()];
        scopes.extend(ip_scope.as_deref());
        self.limiter
            .check_and_count_all(Operation::InitiateOtp, &scopes, now)
            .await?;

        let (ttl, max_attempts) = self.limits_for(purpose);
        let code = self.codes.generate()?;
        let key = ChallengeKey::otp(subject, purpose);
        let challenge_id = self.store.issue(
            key,
            Material::Code {
                digest: self.digest(subject, purpose, &code),
                channel,
                destination: destination.clone(),
            },
            ttl,
            max_attempts,
            now,
        );

        let minutes = ((ttl.num_seconds() + 59) / 60).max(1);
        let body = Zeroizing::new(
            purpose
                .policy()
                .template
                .replace("{code}", &code)
                .replace("{minutes}", &minutes.to_string()),
        );
        self.outbox.insert(
            challenge_id,
            OutboxEntry {
                channel,
                destination: destination.clone(),
                body: body.clone(),
                expires_at: now + ttl,
            },
        );

        tracing::info!(
            user_id = %subject,
            purpose = %purpose,
            challenge_id = %challenge_id,
            channel = channel.as_str(),
            "OTP challenge issued"
        );

        let delivery = self
            .dispatcher
            .dispatch_and_wait(OutboundMessage {
                challenge_id,
                channel,
                destination,
                body,
            })
            .await;

        Ok(OtpInitiation {
            challenge_ref: challenge_id,
            expires_at: now + ttl,
            delivery,
        })
    }

    /// Send the pending code for `(subject, purpose)` again, unchanged.
    pub async fn retry_dispatch(&self, subject: UserId, purpose: Purpose) -> Result<OtpInitiation> {
        let now = self.clock.now();
        let key = ChallengeKey::otp(subject, purpose);

        let live = self
            .store
            .current_id(&key)
            .and_then(|id| self.store.get(id))
            .filter(|c| c.is_live(now));
        let Some(challenge) = live else {
            return Err(VerificationError::ExpiredOrConsumedChallenge);
        };
        let Some(message) = self.outbox.get(&challenge.id).map(|entry| OutboundMessage {
            challenge_id: challenge.id,
            channel: entry.channel,
            destination: entry.destination.clone(),
            body: entry.body.clone(),
        }) else {
            return Err(VerificationError::ExpiredOrConsumedChallenge);
        };

        self.limiter
            .check_and_count(Operation::InitiateOtp, &subject.to_string(), now)
            .await?;

        let challenge_ref = challenge.id;
        let expires_at = challenge.expires_at;
        tracing::info!(
            user_id = %subject,
            purpose = %purpose,
            challenge_id = %challenge_ref,
            "Retrying OTP delivery"
        );
        let delivery = self.dispatcher.dispatch_and_wait(message).await;

        Ok(OtpInitiation {
            challenge_ref,
            expires_at,
            delivery,
        })
    }

    /// Check `code` against the live challenge for `(subject, purpose)`.
    pub async fn verify(
        &self,
        subject: UserId,
        purpose: Purpose,
        code: &str,
    ) -> Result<OtpVerification> {
        let code = code.trim();
        if code.len() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(VerificationError::validation(format!(
                "code must be {CODE_LENGTH} digits"
            )));
        }
        let now = self.clock.now();
        let scope = subject.to_string();
        self.limiter
            .ensure_allowed(Operation::VerifyOtp, &scope, now)
            .await?;

        let key = ChallengeKey::otp(subject, purpose);
        let Some(challenge_id) = self.store.current_id(&key) else {
            return Err(VerificationError::ExpiredOrConsumedChallenge);
        };

        match self
            .store
            .record_attempt(challenge_id, &self.digest(subject, purpose, code), now)
        {
            AttemptOutcome::Matched(challenge) => {
                self.outbox.remove(&challenge_id);
                tracing::info!(
                    user_id = %subject,
                    purpose = %purpose,
                    challenge_id = %challenge_id,
                    "OTP verified"
                );

                let state = match challenge.material {
                    Material::Code {
                        channel,
                        destination,
                        ..
                    } if purpose.policy().marks_contact_verified => {
                        self.repo
                            .mark_contact_verified(ContactPoint {
                                user_id: subject,
                                channel,
                                destination,
                                verified_at: now,
                            })
                            .await?;
                        self.aggregator.recompute(subject, now).await?
                    }
                    _ => self.aggregator.current(subject).await?,
                };
                Ok(OtpVerification { purpose, state })
            }
            AttemptOutcome::Mismatch { attempts_remaining } => {
                self.limiter
                    .record_failure(Operation::VerifyOtp, &scope, now)
                    .await?;
                tracing::warn!(
                    user_id = %subject,
                    purpose = %purpose,
                    challenge_id = %challenge_id,
                    attempts_remaining,
                    "OTP mismatch"
                );
                if attempts_remaining == 0 {
                    self.outbox.remove(&challenge_id);
                }
                Err(VerificationError::invalid_proof(format!(
                    "code did not match; {attempts_remaining} attempts remaining"
                )))
            }
            AttemptOutcome::Closed => {
                self.outbox.remove(&challenge_id);
                Err(VerificationError::ExpiredOrConsumedChallenge)
            }
        }
    }

    /// Drop outbox entries whose challenge is gone.
    pub fn sweep_outbox(&self, now: DateTime<Utc>) -> usize {
        let before = self.outbox.len();
        self.outbox.retain(|challenge_id, entry| {
            entry.expires_at >= now
                && self
                    .store
                    .get(*challenge_id)
                    .is_some_and(|c| c.is_live(now))
        });
        before.saturating_sub(self.outbox.len())
    }
}
