//! idproof core - identity and multi-factor verification engine
//!
//! Proves facts about a user and folds the proofs into a single trust level.
//!
//! # Features
//!
//! - One-time codes to a phone or email, stored only as peppered SHA3 digests
//! - TOTP authenticators (RFC 6238) with hashed single-use backup codes
//! - WebAuthn registration and assertion via `webauthn-rs`, with counter checks
//! - Identity document routing on classifier confidence, plus manual review
//! - Fixed-window rate limiting behind a pluggable counter store
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use idproof_core::{EngineConfig, Purpose, RecordingProvider, VerificationEngine};
//!
//! # async fn example() -> idproof_core::Result<()> {
//! let engine = VerificationEngine::builder(EngineConfig::default())
//!     .delivery(Arc::new(RecordingProvider::new()))
//!     .build()?;
//!
//! let user = uuid::Uuid::new_v4();
//! let issued = engine
//!     .otp
//!     .initiate(user, "+15551234567", Purpose::Login, None)
//!     .await?;
//! println!("challenge {}", issued.challenge_ref);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod document;
pub mod engine;
pub mod error;
pub mod http;
pub mod otp;
pub mod random;
pub mod rate_limit;
pub mod repository;
pub mod review;
pub mod totp;
pub mod types;
pub mod webauthn;

pub use aggregate::{compute_level, Aggregator, Signals, UserVerificationState, VerificationLevel};
pub use challenge::{Challenge, ChallengeStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use delivery::{
    DeliveryProvider, DeliveryStatus, DisabledProvider, DispatchPolicy, RecordingProvider,
    WebhookProvider,
};
pub use document::{
    AnalysisResult, AttemptStatus, DecisionPolicy, DocumentAnalysisResult, DocumentClassifier,
    DocumentEngine, DocumentImage, DocumentSubmission, DocumentType, FraudIndicator,
    HttpClassifier, IdentityVerificationAttempt, ReviewDecision, ReviewDecisionRecord,
    ScriptedClassifier, SubmissionOutcome, UnavailableClassifier, UploadLimits,
};
pub use engine::{EngineBuilder, SweepReport, VerificationEngine};
pub use error::{Result, StorageError, VerificationError};
pub use http::HttpClientConfig;
pub use otp::{
    validate_destination, CodeGenerator, OtpConfig, OtpInitiation, OtpVerification,
    SecureCodeGenerator, SequenceCodeGenerator,
};
pub use rate_limit::{CounterStore, MemoryCounterStore, Operation, RateLimitPolicy, WindowCount};
pub use repository::{
    AuthenticatorCredential, BackupCode, ContactPoint, MemoryRepository, Repository,
    WebAuthnCredential,
};
pub use review::{PendingReview, ReviewOutcome, ReviewQueue};
pub use totp::{TotpConfig, TotpConfirmation, TotpMethod, TotpSetup, TotpVerification};
pub use types::{Channel, ChallengeId, Purpose, UserId};
pub use webauthn::{
    AuthenticationOutcome, CeremonyOptions, CeremonyVerifier, CredentialSummary,
    FakeCeremonyVerifier, PasskeyVerifier, RegisteredCredential,
};
