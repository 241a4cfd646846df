//! WebAuthn registration and authentication ceremonies.
//!
//! The orchestrator owns sequencing: challenges, exclusion lists, duplicate
//! detection and the signature-counter rule. Cryptographic checks belong to a
//! [`CeremonyVerifier`]; production uses [`PasskeyVerifier`].

mod fake;
mod passkey;

pub use fake::FakeCeremonyVerifier;
pub use passkey::{ConfigError, PasskeyVerifier};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::aggregate::{Aggregator, UserVerificationState};
use crate::challenge::{ChallengeStore, Material};
use crate::clock::Clock;
use crate::error::{Result, VerificationError};
use crate::rate_limit::{Operation, RateLimiter};
use crate::repository::{Repository, WebAuthnCredential};
use crate::types::{ChallengeId, ChallengeKey, UserId};

/// Options for the client plus the opaque state to hold until the response.
pub struct RegistrationChallenge {
    pub options: serde_json::Value,
    pub state: String,
}

pub struct AuthenticationChallenge {
    pub options: serde_json::Value,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct VerifiedRegistration {
    pub credential_id: String,
    pub public_key: serde_json::Value,
    pub sign_count: u32,
}

#[derive(Debug, Clone)]
pub struct VerifiedAssertion {
    pub credential_id: String,
    pub sign_count: u32,
    /// Key material after applying the assertion.
    pub public_key: serde_json::Value,
}

/// Library-grade ceremony checks: origin, challenge, attestation and signature.
pub trait CeremonyVerifier: Send + Sync {
    fn start_registration(
        &self,
        user_id: UserId,
        user_name: &str,
        exclude: &[String],
    ) -> Result<RegistrationChallenge>;

    fn finish_registration(
        &self,
        response: &serde_json::Value,
        state: &str,
    ) -> Result<VerifiedRegistration>;

    fn start_authentication(&self, credentials: &[WebAuthnCredential])
        -> Result<AuthenticationChallenge>;

    fn finish_authentication(
        &self,
        response: &serde_json::Value,
        state: &str,
        credential: &WebAuthnCredential,
    ) -> Result<VerifiedAssertion>;
}

/// Counter rule: when either side reports a non-zero count, the new value
/// must be strictly greater than the stored one.
pub fn sign_count_acceptable(stored: u32, reported: u32) -> bool {
    (stored == 0 && reported == 0) || reported > stored
}

#[derive(Debug, Clone, Serialize)]
pub struct CeremonyOptions {
    pub challenge_ref: ChallengeId,
    pub expires_at: DateTime<Utc>,
    pub options: serde_json::Value,
}

/// Public view of a stored credential.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub id: String,
    pub device_label: Option<String>,
    pub sign_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&WebAuthnCredential> for CredentialSummary {
    fn from(credential: &WebAuthnCredential) -> Self {
        Self {
            id: credential.id.clone(),
            device_label: credential.device_label.clone(),
            sign_count: credential.sign_count,
            created_at: credential.created_at,
            last_used_at: credential.last_used_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredCredential {
    pub credential: CredentialSummary,
    pub state: UserVerificationState,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationOutcome {
    pub credential_id: String,
    pub sign_count: u32,
    /// The ceremony may stand in as a second factor for this session.
    pub second_factor: bool,
}

pub struct WebAuthnOrchestrator {
    store: Arc<ChallengeStore>,
    repo: Arc<dyn Repository>,
    aggregator: Arc<Aggregator>,
    limiter: Arc<RateLimiter>,
    verifier: Arc<dyn CeremonyVerifier>,
    clock: Arc<dyn Clock>,
    challenge_ttl: Duration,
}

impl WebAuthnOrchestrator {
    pub fn new(
        store: Arc<ChallengeStore>,
        repo: Arc<dyn Repository>,
        aggregator: Arc<Aggregator>,
        limiter: Arc<RateLimiter>,
        verifier: Arc<dyn CeremonyVerifier>,
        clock: Arc<dyn Clock>,
        challenge_ttl: Duration,
    ) -> Self {
        Self {
            store,
            repo,
            aggregator,
            limiter,
            verifier,
            clock,
            challenge_ttl,
        }
    }

    /// Issue a registration challenge excluding the user's existing credentials.
    pub async fn begin_registration(
        &self,
        user_id: UserId,
        device_label: Option<String>,
        user_name: Option<&str>,
    ) -> Result<CeremonyOptions> {
        let existing: Vec<String> = self
            .repo
            .list_credentials(user_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let user_name = user_name
            .map(str::to_string)
            .unwrap_or_else(|| user_id.to_string());

        let challenge = self
            .verifier
            .start_registration(user_id, &user_name, &existing)?;

        let now = self.clock.now();
        let challenge_ref = self.store.issue(
            ChallengeKey::registration(user_id),
            Material::Ceremony {
                state: challenge.state,
                device_label,
            },
            self.challenge_ttl,
            1,
            now,
        );

        tracing::info!(
            user_id = %user_id,
            challenge_id = %challenge_ref,
            excluded = existing.len(),
            "WebAuthn registration started"
        );
        Ok(CeremonyOptions {
            challenge_ref,
            expires_at: now + self.challenge_ttl,
            options: challenge.options,
        })
    }

    pub async fn finish_registration(
        &self,
        user_id: UserId,
        response: &serde_json::Value,
    ) -> Result<RegisteredCredential> {
        let now = self.clock.now();
        let challenge = self
            .store
            .take(&ChallengeKey::registration(user_id), now)
            .ok_or(VerificationError::ExpiredOrConsumedChallenge)?;
        let Material::Ceremony {
            state,
            device_label,
        } = challenge.material
        else {
            return Err(VerificationError::ExpiredOrConsumedChallenge);
        };

        let verified = self.verifier.finish_registration(response, &state)?;

        if self.repo.get_credential(&verified.credential_id).await?.is_some() {
            tracing::warn!(user_id = %user_id, "Duplicate WebAuthn credential rejected");
            return Err(VerificationError::validation("credential already registered"));
        }

        let credential = WebAuthnCredential {
            id: verified.credential_id,
            user_id,
            public_key: verified.public_key,
            sign_count: verified.sign_count,
            device_label,
            created_at: now,
            last_used_at: None,
        };
        if !self.repo.insert_credential(credential.clone()).await? {
            return Err(VerificationError::validation("credential already registered"));
        }

        let state = self.aggregator.recompute(user_id, now).await?;
        tracing::info!(
            user_id = %user_id,
            credential_id = %credential.id,
            "WebAuthn registration completed"
        );
        Ok(RegisteredCredential {
            credential: CredentialSummary::from(&credential),
            state,
        })
    }

    pub async fn begin_authentication(&self, user_id: UserId) -> Result<CeremonyOptions> {
        let credentials = self.repo.list_credentials(user_id).await?;
        if credentials.is_empty() {
            return Err(VerificationError::not_found("no registered security keys"));
        }

        let challenge = self.verifier.start_authentication(&credentials)?;
        let now = self.clock.now();
        let challenge_ref = self.store.issue(
            ChallengeKey::authentication(user_id),
            Material::Ceremony {
                state: challenge.state,
                device_label: None,
            },
            self.challenge_ttl,
            1,
            now,
        );

        tracing::info!(
            user_id = %user_id,
            challenge_id = %challenge_ref,
            "WebAuthn authentication started"
        );
        Ok(CeremonyOptions {
            challenge_ref,
            expires_at: now + self.challenge_ttl,
            options: challenge.options,
        })
    }

    /// Verify an assertion and advance the credential's counter.
    ///
    /// Any failure consumes the ceremony; the client must begin again.
    pub async fn finish_authentication(
        &self,
        user_id: UserId,
        response: &serde_json::Value,
    ) -> Result<AuthenticationOutcome> {
        let now = self.clock.now();
        let scope = user_id.to_string();
        self.limiter
            .ensure_allowed(Operation::FinishWebAuthnAuthentication, &scope, now)
            .await?;

        let challenge = self
            .store
            .take(&ChallengeKey::authentication(user_id), now)
            .ok_or(VerificationError::ExpiredOrConsumedChallenge)?;
        let Material::Ceremony { state, .. } = challenge.material else {
            return Err(VerificationError::ExpiredOrConsumedChallenge);
        };

        match self.verify_assertion(user_id, response, &state, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if matches!(err, VerificationError::InvalidProof(_)) {
                    self.limiter
                        .record_failure(Operation::FinishWebAuthnAuthentication, &scope, now)
                        .await?;
                }
                tracing::warn!(user_id = %user_id, error = %err, "WebAuthn authentication failed");
                Err(err)
            }
        }
    }

    async fn verify_assertion(
        &self,
        user_id: UserId,
        response: &serde_json::Value,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthenticationOutcome> {
        let presented_id = response
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| VerificationError::validation("assertion is missing a credential id"))?;

        let credential = self
            .repo
            .get_credential(presented_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| VerificationError::invalid_proof("credential not recognised"))?;

        let verified = self
            .verifier
            .finish_authentication(response, state, &credential)?;
        if verified.credential_id != credential.id {
            return Err(VerificationError::invalid_proof("credential mismatch"));
        }

        if !sign_count_acceptable(credential.sign_count, verified.sign_count) {
            tracing::warn!(
                user_id = %user_id,
                credential_id = %credential.id,
                stored = credential.sign_count,
                reported = verified.sign_count,
                "Signature counter did not advance, possible cloned authenticator"
            );
            return Err(VerificationError::invalid_proof("signature counter did not advance"));
        }

        let updated = self
            .repo
            .update_sign_count(
                &credential.id,
                credential.sign_count,
                verified.sign_count,
                verified.public_key,
                now,
            )
            .await?;
        if !updated {
            return Err(VerificationError::invalid_proof(
                "signature counter changed concurrently",
            ));
        }

        tracing::info!(
            user_id = %user_id,
            credential_id = %credential.id,
            sign_count = verified.sign_count,
            "WebAuthn authentication completed"
        );
        Ok(AuthenticationOutcome {
            credential_id: credential.id,
            sign_count: verified.sign_count,
            second_factor: true,
        })
    }

    pub async fn list_credentials(&self, user_id: UserId) -> Result<Vec<CredentialSummary>> {
        Ok(self
            .repo
            .list_credentials(user_id)
            .await?
            .iter()
            .map(CredentialSummary::from)
            .collect())
    }

    pub async fn revoke_credential(
        &self,
        user_id: UserId,
        credential_id: &str,
    ) -> Result<UserVerificationState> {
        if !self.repo.delete_credential(user_id, credential_id).await? {
            return Err(VerificationError::not_found("credential not found"));
        }
        tracing::info!(user_id = %user_id, credential_id, "WebAuthn credential revoked");
        self.aggregator.recompute(user_id, self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::{MemoryCounterStore, RateLimitPolicy};
    use crate::repository::MemoryRepository;
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        orchestrator: WebAuthnOrchestrator,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let orchestrator = WebAuthnOrchestrator::new(
            Arc::new(ChallengeStore::new()),
            repo.clone(),
            Arc::new(Aggregator::new(repo)),
            Arc::new(RateLimiter::new(
                Arc::new(MemoryCounterStore::new()),
                RateLimitPolicy::default(),
            )),
            Arc::new(FakeCeremonyVerifier::new()),
            clock.clone(),
            Duration::minutes(5),
        );
        Fixture {
            orchestrator,
            clock,
        }
    }

    fn challenge_of(options: &CeremonyOptions) -> String {
        options.options["challenge"].as_str().unwrap().to_string()
    }

    async fn register(f: &Fixture, user: UserId, id: &str) -> RegisteredCredential {
        let options = f
            .orchestrator
            .begin_registration(user, Some("YubiKey 5".into()), None)
            .await
            .unwrap();
        f.orchestrator
            .finish_registration(
                user,
                &FakeCeremonyVerifier::registration_response(id, &challenge_of(&options), 0),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_sign_count_rule() {
        assert!(sign_count_acceptable(0, 0));
        assert!(sign_count_acceptable(0, 1));
        assert!(sign_count_acceptable(5, 6));
        assert!(!sign_count_acceptable(5, 5));
        assert!(!sign_count_acceptable(5, 4));
        assert!(!sign_count_acceptable(5, 0));
    }

    #[tokio::test]
    async fn test_registration_sets_two_factor() {
        let f = fixture();
        let user = Uuid::new_v4();
        let registered = register(&f, user, "cred-1").await;
        assert!(registered.state.two_factor_enabled);
        assert_eq!(registered.credential.device_label.as_deref(), Some("YubiKey 5"));
    }

    #[tokio::test]
    async fn test_exclude_list_contains_existing_credentials() {
        let f = fixture();
        let user = Uuid::new_v4();
        register(&f, user, "cred-1").await;
        register(&f, user, "cred-2").await;

        let options = f
            .orchestrator
            .begin_registration(user, None, None)
            .await
            .unwrap();
        let excluded = options.options["excludeCredentials"].as_array().unwrap();
        assert_eq!(excluded, &vec![json!("cred-1"), json!("cred-2")]);
    }

    #[tokio::test]
    async fn test_duplicate_credential_rejected() {
        let f = fixture();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        register(&f, alice, "shared").await;

        let options = f.orchestrator.begin_registration(bob, None, None).await.unwrap();
        let err = f
            .orchestrator
            .finish_registration(
                bob,
                &FakeCeremonyVerifier::registration_response("shared", &challenge_of(&options), 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_registration_challenge_is_single_use() {
        let f = fixture();
        let user = Uuid::new_v4();
        let options = f.orchestrator.begin_registration(user, None, None).await.unwrap();
        let response = FakeCeremonyVerifier::registration_response("c", &challenge_of(&options), 0);
        f.orchestrator.finish_registration(user, &response).await.unwrap();
        assert!(matches!(
            f.orchestrator.finish_registration(user, &response).await,
            Err(VerificationError::ExpiredOrConsumedChallenge)
        ));
    }

    #[tokio::test]
    async fn test_wrong_challenge_fails_whole_ceremony() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.orchestrator.begin_registration(user, None, None).await.unwrap();
        let err = f
            .orchestrator
            .finish_registration(user, &FakeCeremonyVerifier::registration_response("c", "forged", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidProof(_)));
        assert!(f.orchestrator.list_credentials(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authentication_requires_credentials() {
        let f = fixture();
        assert!(matches!(
            f.orchestrator.begin_authentication(Uuid::new_v4()).await,
            Err(VerificationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_authentication_enforces_counter() {
        let f = fixture();
        let user = Uuid::new_v4();
        register(&f, user, "cred-1").await;

        let options = f.orchestrator.begin_authentication(user).await.unwrap();
        let outcome = f
            .orchestrator
            .finish_authentication(
                user,
                &FakeCeremonyVerifier::assertion_response("cred-1", &challenge_of(&options), 5),
            )
            .await
            .unwrap();
        assert_eq!(outcome.sign_count, 5);
        assert!(outcome.second_factor);

        // Replayed counter value.
        let options = f.orchestrator.begin_authentication(user).await.unwrap();
        let err = f
            .orchestrator
            .finish_authentication(
                user,
                &FakeCeremonyVerifier::assertion_response("cred-1", &challenge_of(&options), 5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidProof(_)));

        let stored = f.orchestrator.list_credentials(user).await.unwrap();
        assert_eq!(stored[0].sign_count, 5);
    }

    #[tokio::test]
    async fn test_authentication_rejects_foreign_credential() {
        let f = fixture();
        let alice = Uuid::new_v4();
        let mallory = Uuid::new_v4();
        register(&f, alice, "alice-key").await;
        register(&f, mallory, "mallory-key").await;

        let options = f.orchestrator.begin_authentication(alice).await.unwrap();
        let err = f
            .orchestrator
            .finish_authentication(
                alice,
                &FakeCeremonyVerifier::assertion_response("mallory-key", &challenge_of(&options), 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidProof(_)));
    }

    #[tokio::test]
    async fn test_expired_ceremony() {
        let f = fixture();
        let user = Uuid::new_v4();
        register(&f, user, "cred-1").await;
        let options = f.orchestrator.begin_authentication(user).await.unwrap();
        f.clock.advance(Duration::minutes(6));
        assert!(matches!(
            f.orchestrator
                .finish_authentication(
                    user,
                    &FakeCeremonyVerifier::assertion_response("cred-1", &challenge_of(&options), 1),
                )
                .await,
            Err(VerificationError::ExpiredOrConsumedChallenge)
        ));
    }

    #[tokio::test]
    async fn test_revoke_recomputes_level() {
        let f = fixture();
        let user = Uuid::new_v4();
        register(&f, user, "cred-1").await;
        let state = f.orchestrator.revoke_credential(user, "cred-1").await.unwrap();
        assert!(!state.two_factor_enabled);
        assert!(matches!(
            f.orchestrator.revoke_credential(user, "cred-1").await,
            Err(VerificationError::NotFound(_))
        ));
    }
}
