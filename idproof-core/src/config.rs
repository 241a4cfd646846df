//! Engine configuration
//!
//! Loaded from environment variables with defaults. `Default` is what tests use.

use std::str::FromStr;

use chrono::Duration;
use zeroize::Zeroizing;

use crate::document::{DecisionPolicy, UploadLimits};
use crate::error::{Result, VerificationError};
use crate::otp::OtpConfig;
use crate::rate_limit::RateLimitPolicy;
use crate::totp::TotpConfig;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub otp: OtpConfig,
    pub totp: TotpConfig,
    /// Lifetime of a WebAuthn registration or authentication challenge.
    pub webauthn_challenge_ttl: Duration,
    pub decision: DecisionPolicy,
    pub uploads: UploadLimits,
    /// Open identity attempts older than this expire (default: 14 days)
    pub attempt_review_ttl: Duration,
    pub rate_limit: RateLimitPolicy,
    /// Seconds between background sweeps (default: 60)
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            otp: OtpConfig::default(),
            totp: TotpConfig::default(),
            webauthn_challenge_ttl: Duration::seconds(300),
            decision: DecisionPolicy::default(),
            uploads: UploadLimits::default(),
            attempt_review_ttl: Duration::days(14),
            rate_limit: RateLimitPolicy::default(),
            sweep_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pepper = std::env::var("OTP_CODE_PEPPER")
            .ok()
            .filter(|p| !p.is_empty())
            .map(Zeroizing::new)
            .unwrap_or_else(|| {
                tracing::warn!("OTP_CODE_PEPPER not set, using a per-process pepper");
                defaults.otp.pepper.clone()
            });

        let otp = OtpConfig {
            ttl: Duration::seconds(env_or("OTP_TTL_SECS", 300)),
            max_attempts: env_or("OTP_MAX_ATTEMPTS", defaults.otp.max_attempts),
            pepper,
        };

        let totp = TotpConfig {
            issuer: env_or("TOTP_ISSUER", defaults.totp.issuer.clone()),
            digits: env_or("TOTP_DIGITS", defaults.totp.digits),
            step: env_or("TOTP_STEP_SECS", defaults.totp.step),
            window: env_or("TOTP_WINDOW", defaults.totp.window),
            backup_code_count: env_or("BACKUP_CODE_COUNT", defaults.totp.backup_code_count),
            low_watermark: env_or("BACKUP_CODES_LOW_WATERMARK", defaults.totp.low_watermark),
            enrollment_ttl: Duration::seconds(env_or("TOTP_ENROLLMENT_TTL_SECS", 900)),
        };

        let decision = DecisionPolicy {
            high_threshold: env_or("DOC_HIGH_THRESHOLD", defaults.decision.high_threshold),
            low_threshold: env_or("DOC_LOW_THRESHOLD", defaults.decision.low_threshold),
            max_resubmissions: env_or("DOC_MAX_RESUBMISSIONS", defaults.decision.max_resubmissions),
        };

        let uploads = UploadLimits {
            max_image_bytes: env_or("DOC_MAX_IMAGE_BYTES", defaults.uploads.max_image_bytes),
            max_images: env_or("DOC_MAX_IMAGES", defaults.uploads.max_images),
            allowed_content_types: defaults.uploads.allowed_content_types.clone(),
        };

        let rate_limit = RateLimitPolicy {
            window: Duration::seconds(env_or("RATE_LIMIT_WINDOW_SECS", 900)),
            max_initiations: env_or("RATE_LIMIT_MAX_INITIATIONS", defaults.rate_limit.max_initiations),
            max_failures: env_or("RATE_LIMIT_MAX_FAILURES", defaults.rate_limit.max_failures),
        };

        Self {
            otp,
            totp,
            webauthn_challenge_ttl: Duration::seconds(env_or("WEBAUTHN_CHALLENGE_TTL_SECS", 300)),
            decision,
            uploads,
            attempt_review_ttl: Duration::seconds(env_or(
                "ATTEMPT_REVIEW_TTL_SECS",
                14 * 24 * 60 * 60,
            )),
            rate_limit,
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = |d: Duration| d > Duration::zero();
        if !positive(self.otp.ttl) || self.otp.max_attempts == 0 {
            return Err(VerificationError::validation(
                "OTP ttl and max attempts must be positive",
            ));
        }
        if !(6..=8).contains(&self.totp.digits) || self.totp.step == 0 || self.totp.window < 0 {
            return Err(VerificationError::validation(
                "TOTP digits must be 6 to 8 with a positive step",
            ));
        }
        if self.totp.backup_code_count == 0 {
            return Err(VerificationError::validation("at least one backup code is required"));
        }
        if !positive(self.webauthn_challenge_ttl) || !positive(self.attempt_review_ttl) {
            return Err(VerificationError::validation("challenge and review ttl must be positive"));
        }
        self.decision.validate()?;
        if self.uploads.max_images == 0 || self.uploads.max_image_bytes == 0 {
            return Err(VerificationError::validation("upload limits must be positive"));
        }
        if !positive(self.rate_limit.window)
            || self.rate_limit.max_initiations == 0
            || self.rate_limit.max_failures == 0
        {
            return Err(VerificationError::validation("rate limits must be positive"));
        }
        Ok(())
    }
}
