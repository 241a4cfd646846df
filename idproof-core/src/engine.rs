//! The assembled engine: every component wired to one repository, one
//! challenge store and one clock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::aggregate::{Aggregator, UserVerificationState};
use crate::challenge::ChallengeStore;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::delivery::{DeliveryProvider, DisabledProvider, DispatchPolicy, Dispatcher};
use crate::document::{DocumentClassifier, DocumentEngine, UnavailableClassifier};
use crate::error::{Result, VerificationError};
use crate::otp::{CodeGenerator, OtpManager, SecureCodeGenerator};
use crate::rate_limit::{CounterStore, MemoryCounterStore, RateLimiter};
use crate::repository::{MemoryRepository, Repository};
use crate::review::ReviewQueue;
use crate::totp::TotpManager;
use crate::types::UserId;
use crate::webauthn::{CeremonyVerifier, PasskeyVerifier, WebAuthnOrchestrator};

/// What one sweep removed or expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub challenges: usize,
    pub outbox: usize,
    pub attempts: usize,
    pub counters: usize,
    /// Authenticator setups whose backup codes were never confirmed.
    pub enrollments: usize,
}

pub struct VerificationEngine {
    pub otp: OtpManager,
    pub totp: TotpManager,
    pub webauthn: WebAuthnOrchestrator,
    pub documents: DocumentEngine,
    pub reviews: ReviewQueue,
    aggregator: Arc<Aggregator>,
    challenges: Arc<ChallengeStore>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl VerificationEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn verification_state(&self, user_id: UserId) -> Result<UserVerificationState> {
        self.aggregator.current(user_id).await
    }

    /// Expire stale challenges, outbox entries, identity attempts, counters and
    /// abandoned authenticator setups.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = SweepReport {
            challenges: self.challenges.sweep(now),
            outbox: self.otp.sweep_outbox(now),
            attempts: self.documents.expire_stale(now).await?,
            counters: self.limiter.purge_expired(now).await?,
            enrollments: self.totp.sweep_pending(now),
        };
        if report != SweepReport::default() {
            tracing::debug!(
                challenges = report.challenges,
                outbox = report.outbox,
                attempts = report.attempts,
                counters = report.counters,
                enrollments = report.enrollments,
                "Sweep completed"
            );
        }
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep(engine.clock.now()).await {
                    tracing::error!(error = %e, "Sweep failed");
                }
            }
        })
    }
}

/// Collaborators default to in-memory storage, no delivery, no classifier and
/// the system clock.
pub struct EngineBuilder {
    config: EngineConfig,
    repository: Option<Arc<dyn Repository>>,
    counters: Option<Arc<dyn CounterStore>>,
    delivery: Option<Arc<dyn DeliveryProvider>>,
    dispatch: DispatchPolicy,
    classifier: Option<Arc<dyn DocumentClassifier>>,
    verifier: Option<Arc<dyn CeremonyVerifier>>,
    clock: Option<Arc<dyn Clock>>,
    codes: Option<Arc<dyn CodeGenerator>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            repository: None,
            counters: None,
            delivery: None,
            dispatch: DispatchPolicy::default(),
            classifier: None,
            verifier: None,
            clock: None,
            codes: None,
        }
    }

    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn counter_store(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn delivery(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.delivery = Some(provider);
        self
    }

    pub fn dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch = policy;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn DocumentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn ceremony_verifier(mut self, verifier: Arc<dyn CeremonyVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = Some(codes);
        self
    }

    pub fn build(self) -> Result<VerificationEngine> {
        self.config.validate()?;

        let verifier: Arc<dyn CeremonyVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(PasskeyVerifier::from_env().map_err(|e| {
                VerificationError::validation(format!("WebAuthn configuration: {e}"))
            })?),
        };
        let repo = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryRepository::new()));
        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new()));
        let delivery = self.delivery.unwrap_or_else(|| Arc::new(DisabledProvider));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(UnavailableClassifier));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let codes = self.codes.unwrap_or_else(|| Arc::new(SecureCodeGenerator));

        let config = self.config;
        let challenges = Arc::new(ChallengeStore::new());
        let aggregator = Arc::new(Aggregator::new(repo.clone()));
        let limiter = Arc::new(RateLimiter::new(counters, config.rate_limit));
        let dispatcher = Arc::new(Dispatcher::new(delivery, self.dispatch));

        let otp = OtpManager::new(
            challenges.clone(),
            repo.clone(),
            aggregator.clone(),
            limiter.clone(),
            dispatcher,
            codes,
            clock.clone(),
            config.otp.clone(),
        );
        let totp = TotpManager::new(
            repo.clone(),
            aggregator.clone(),
            limiter.clone(),
            clock.clone(),
            config.totp.clone(),
        );
        let webauthn = WebAuthnOrchestrator::new(
            challenges.clone(),
            repo.clone(),
            aggregator.clone(),
            limiter.clone(),
            verifier,
            clock.clone(),
            config.webauthn_challenge_ttl,
        );
        let documents = DocumentEngine::new(
            repo.clone(),
            aggregator.clone(),
            limiter.clone(),
            classifier,
            clock.clone(),
            config.decision,
            config.uploads.clone(),
            config.attempt_review_ttl,
        );
        let reviews = ReviewQueue::new(repo, aggregator.clone(), clock.clone());

        Ok(VerificationEngine {
            otp,
            totp,
            webauthn,
            documents,
            reviews,
            aggregator,
            challenges,
            limiter,
            clock,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::delivery::RecordingProvider;
    use crate::document::ScriptedClassifier;
    use crate::otp::SequenceCodeGenerator;
    use crate::types::Purpose;
    use crate::webauthn::FakeCeremonyVerifier;
    use chrono::Duration;
    use uuid::Uuid;

    fn engine(clock: Arc<ManualClock>) -> VerificationEngine {
        VerificationEngine::builder(EngineConfig::default())
            .delivery(Arc::new(RecordingProvider::new()))
            .classifier(Arc::new(ScriptedClassifier::new()))
            .ceremony_verifier(Arc::new(FakeCeremonyVerifier::new()))
            .code_generator(Arc::new(SequenceCodeGenerator::new(["123456"])))
            .clock(clock)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.otp.max_attempts = 0;
        let result = VerificationEngine::builder(config)
            .ceremony_verifier(Arc::new(FakeCeremonyVerifier::new()))
            .build();
        assert!(matches!(result, Err(VerificationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_user_has_empty_state() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(clock);
        let state = engine.verification_state(Uuid::new_v4()).await.unwrap();
        assert!(!state.phone_verified);
        assert!(state.updated_at.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_challenges() {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let engine = engine(clock.clone());
        let user = Uuid::new_v4();
        engine
            .otp
            .initiate(user, "+15551234567", Purpose::Login, None)
            .await
            .unwrap();

        assert_eq!(engine.sweep(clock.now()).await.unwrap().challenges, 0);
        clock.advance(Duration::minutes(20));
        let report = engine.sweep(clock.now()).await.unwrap();
        assert_eq!(report.challenges, 1);
        assert_eq!(report.outbox, 1);
        assert!(report.counters >= 1);
        assert_eq!(report.enrollments, 0);

        assert!(matches!(
            engine.otp.verify(user, Purpose::Login, "123456").await,
            Err(VerificationError::ExpiredOrConsumedChallenge)
        ));
    }
}
