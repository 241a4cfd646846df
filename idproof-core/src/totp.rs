//! Authenticator-app (TOTP) enrollment, confirmation and verification.
//!
//! Codes follow RFC 6238 with HMAC-SHA1. A code accepted once cannot be
//! replayed: the credential remembers the highest time step it has accepted
//! and only newer steps pass. Backup codes are stored as salted SHA3 digests
//! and each one can be spent exactly once.

use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use data_encoding::BASE32_NOPAD;
use qrcode::{render::svg, QrCode};
use ring::hmac;
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::aggregate::{Aggregator, UserVerificationState};
use crate::clock::Clock;
use crate::error::{Result, VerificationError};
use crate::random;
use crate::rate_limit::{Operation, RateLimiter};
use crate::repository::{AuthenticatorCredential, BackupCode, Repository};
use crate::types::UserId;

/// 160-bit shared secret.
const SECRET_BYTES: usize = 20;
/// Raw entropy per backup code; encodes to eight base32 characters.
const BACKUP_CODE_BYTES: usize = 5;

#[derive(Debug, Clone)]
pub struct TotpConfig {
    pub issuer: String,
    pub digits: u32,
    /// Time step in seconds.
    pub step: u64,
    /// Steps accepted on either side of the current one.
    pub window: i64,
    pub backup_code_count: usize,
    /// At or below this many unused backup codes, verification flags the user.
    pub low_watermark: usize,
    /// How long plaintext backup codes from setup are held for confirmation.
    pub enrollment_ttl: Duration,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: "idproof".into(),
            digits: 6,
            step: 30,
            window: 1,
            backup_code_count: 10,
            low_watermark: 3,
            enrollment_ttl: Duration::seconds(900),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpProvisioning {
    pub uri: String,
    /// `data:image/svg+xml;base64,...`
    pub qr_code: String,
    /// Base32 secret for manual entry.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpSetup {
    pub provisioning: TotpProvisioning,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpConfirmation {
    /// Present only on the confirmation that completed enrollment.
    pub backup_codes: Option<Vec<String>>,
    pub state: UserVerificationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TotpMethod {
    Totp,
    BackupCode,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpVerification {
    pub method: TotpMethod,
    pub backup_codes_remaining: usize,
    pub low_backup_codes: bool,
}

pub fn encode_secret_base32(secret: &[u8]) -> String {
    BASE32_NOPAD.encode(secret)
}

pub fn build_otpauth_uri(label: &str, secret: &str, config: &TotpConfig) -> String {
    let label = urlencoding::encode(label);
    let issuer = urlencoding::encode(&config.issuer);
    format!(
        "otpauth://totp/{issuer}:{label}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={digits}&period={period}",
        digits = config.digits,
        period = config.step,
    )
}

pub fn qr_code_data_uri(data: &str) -> Result<String> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| VerificationError::validation(format!("cannot encode QR code: {e}")))?;
    let svg = code.render::<svg::Color>().min_dimensions(256, 256).build();

    Ok(format!(
        "data:image/svg+xml;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(svg.as_bytes())
    ))
}

/// RFC 4226 value for `counter`, truncated to `digits`.
pub fn compute_totp(secret: &[u8], counter: u64, digits: u32) -> u32 {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
    let tag = hmac::sign(&key, &counter.to_be_bytes());
    let bytes = tag.as_ref();
    let offset = (bytes[bytes.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ]) & 0x7fff_ffff;

    binary % 10u32.pow(digits)
}

pub fn time_step(now: DateTime<Utc>, step: u64) -> i64 {
    now.timestamp().div_euclid(step.max(1) as i64)
}

fn is_totp_shaped(code: &str, digits: u32) -> bool {
    code.len() == digits as usize && code.chars().all(|c| c.is_ascii_digit())
}

/// Step whose code equals `code` within the window around `now`.
pub fn matching_step(
    secret: &[u8],
    code: &str,
    now: DateTime<Utc>,
    config: &TotpConfig,
) -> Option<i64> {
    if !is_totp_shaped(code, config.digits) {
        return None;
    }
    let base = time_step(now, config.step);
    let width = config.digits as usize;

    (-config.window..=config.window)
        .map(|offset| base + offset)
        .filter(|step| *step >= 0)
        .find(|step| {
            let expected = format!("{:0width$}", compute_totp(secret, *step as u64, config.digits));
            bool::from(expected.as_bytes().ct_eq(code.as_bytes()))
        })
}

fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn hash_backup_code(user_id: UserId, code: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(normalize_backup_code(code).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh plaintext codes formatted `XXXX-XXXX`.
pub fn generate_backup_codes(count: usize) -> Result<Vec<Zeroizing<String>>> {
    (0..count)
        .map(|_| {
            let raw = random::bytes(BACKUP_CODE_BYTES)?;
            let encoded = Zeroizing::new(BASE32_NOPAD.encode(&raw));
            Ok(Zeroizing::new(format!("{}-{}", &encoded[..4], &encoded[4..])))
        })
        .collect()
}

/// Backup codes from a setup that has not been confirmed yet.
struct PendingCodes {
    /// Digest of the secret they were issued with.
    fingerprint: [u8; 32],
    codes: Vec<Zeroizing<String>>,
    expires_at: DateTime<Utc>,
}

fn secret_fingerprint(secret: &[u8]) -> [u8; 32] {
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&Sha3_256::digest(secret));
    fingerprint
}

pub struct TotpManager {
    repo: Arc<dyn Repository>,
    aggregator: Arc<Aggregator>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: TotpConfig,
    /// Plaintext backup codes from setup, released once at confirmation.
    pending_codes: DashMap<UserId, PendingCodes>,
}

impl TotpManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        aggregator: Arc<Aggregator>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        config: TotpConfig,
    ) -> Self {
        Self {
            repo,
            aggregator,
            limiter,
            clock,
            config,
            pending_codes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// Start (or restart) enrollment. Refused once a credential is confirmed.
    pub async fn setup(&self, user_id: UserId, account_label: Option<&str>) -> Result<TotpSetup> {
        if let Some(existing) = self.repo.get_authenticator(user_id).await? {
            if existing.confirmed {
                return Err(VerificationError::validation("authenticator already confirmed"));
            }
        }

        let now = self.clock.now();
        let secret = random::bytes(SECRET_BYTES)?;
        let codes = generate_backup_codes(self.config.backup_code_count)?;
        let credential = AuthenticatorCredential {
            user_id,
            secret: secret.clone(),
            confirmed: false,
            backup_codes: codes
                .iter()
                .map(|code| BackupCode {
                    code_hash: hash_backup_code(user_id, code),
                    used: false,
                })
                .collect(),
            last_used_step: None,
            created_at: now,
        };

        if !self.repo.put_pending_authenticator(credential).await? {
            return Err(VerificationError::validation("authenticator already confirmed"));
        }

        let secret_b32 = encode_secret_base32(&secret);
        let label = account_label
            .map(str::to_string)
            .unwrap_or_else(|| user_id.to_string());
        let uri = build_otpauth_uri(&label, &secret_b32, &self.config);
        let qr_code = qr_code_data_uri(&uri)?;

        let backup_codes = codes.iter().map(|c| c.to_string()).collect();
        self.pending_codes.insert(
            user_id,
            PendingCodes {
                fingerprint: secret_fingerprint(&secret),
                codes,
                expires_at: now + self.config.enrollment_ttl,
            },
        );

        tracing::info!(user_id = %user_id, "Authenticator enrollment started");
        Ok(TotpSetup {
            provisioning: TotpProvisioning {
                uri,
                qr_code,
                secret: secret_b32,
            },
            backup_codes,
        })
    }

    /// Complete enrollment with a first rolling code.
    pub async fn confirm(&self, user_id: UserId, code: &str) -> Result<TotpConfirmation> {
        let code = code.trim();
        if !is_totp_shaped(code, self.config.digits) {
            return Err(VerificationError::validation(format!(
                "code must be {} digits",
                self.config.digits
            )));
        }
        let now = self.clock.now();
        let scope = user_id.to_string();
        self.limiter
            .ensure_allowed(Operation::ConfirmAuthenticator, &scope, now)
            .await?;

        let credential = self
            .repo
            .get_authenticator(user_id)
            .await?
            .ok_or_else(|| VerificationError::not_found("no authenticator enrollment in progress"))?;
        if credential.confirmed {
            return Err(VerificationError::validation("authenticator already confirmed"));
        }

        let Some(step) = matching_step(&credential.secret, code, now, &self.config) else {
            self.limiter
                .record_failure(Operation::ConfirmAuthenticator, &scope, now)
                .await?;
            tracing::warn!(user_id = %user_id, "Authenticator confirmation code mismatch");
            return Err(VerificationError::invalid_proof("authenticator code did not match"));
        };

        if !self
            .repo
            .confirm_authenticator(user_id, &credential.secret, step)
            .await?
        {
            return Err(VerificationError::validation(
                "authenticator already confirmed or enrollment restarted",
            ));
        }

        let fingerprint = secret_fingerprint(&credential.secret);
        let pending = self
            .pending_codes
            .remove(&user_id)
            .map(|(_, pending)| pending)
            .filter(|p| p.fingerprint == fingerprint && p.expires_at >= now);
        let backup_codes = match pending {
            Some(pending) => pending.codes.iter().map(|c| c.to_string()).collect(),
            None => self.reissue_backup_codes(user_id).await?,
        };
        let state = self.aggregator.recompute(user_id, now).await?;

        tracing::info!(user_id = %user_id, "Authenticator confirmed");
        Ok(TotpConfirmation {
            backup_codes: Some(backup_codes),
            state,
        })
    }

    /// Check a rolling code, falling back to an unused backup code.
    pub async fn verify(&self, user_id: UserId, code: &str) -> Result<TotpVerification> {
        let code = code.trim();
        if code.is_empty() || code.len() > 32 {
            return Err(VerificationError::validation("code is required"));
        }
        let now = self.clock.now();
        let scope = user_id.to_string();
        self.limiter
            .ensure_allowed(Operation::VerifyAuthenticator, &scope, now)
            .await?;

        let credential = self
            .repo
            .get_authenticator(user_id)
            .await?
            .filter(|c| c.confirmed)
            .ok_or_else(|| VerificationError::not_found("no confirmed authenticator"))?;

        if let Some(step) = matching_step(&credential.secret, code, now, &self.config) {
            if self.repo.advance_totp_step(user_id, step).await? {
                tracing::info!(user_id = %user_id, "Authenticator code accepted");
                let remaining = credential.unused_backup_codes();
                return Ok(TotpVerification {
                    method: TotpMethod::Totp,
                    backup_codes_remaining: remaining,
                    low_backup_codes: remaining <= self.config.low_watermark,
                });
            }
            self.limiter
                .record_failure(Operation::VerifyAuthenticator, &scope, now)
                .await?;
            tracing::warn!(user_id = %user_id, "Authenticator code replayed");
            return Err(VerificationError::invalid_proof("code already used"));
        }

        let hash = hash_backup_code(user_id, code);
        if let Some(remaining) = self.repo.consume_backup_code(user_id, &hash).await? {
            let low = remaining <= self.config.low_watermark;
            tracing::info!(user_id = %user_id, remaining, low, "Backup code accepted");
            return Ok(TotpVerification {
                method: TotpMethod::BackupCode,
                backup_codes_remaining: remaining,
                low_backup_codes: low,
            });
        }

        self.limiter
            .record_failure(Operation::VerifyAuthenticator, &scope, now)
            .await?;
        tracing::warn!(user_id = %user_id, "Authenticator code mismatch");
        Err(VerificationError::invalid_proof("authenticator code did not match"))
    }

    /// Replace every backup code after a fresh rolling-code proof.
    pub async fn regenerate_backup_codes(&self, user_id: UserId, code: &str) -> Result<Vec<String>> {
        let code = code.trim();
        let now = self.clock.now();
        let scope = user_id.to_string();
        self.limiter
            .ensure_allowed(Operation::VerifyAuthenticator, &scope, now)
            .await?;

        let credential = self
            .repo
            .get_authenticator(user_id)
            .await?
            .filter(|c| c.confirmed)
            .ok_or_else(|| VerificationError::not_found("no confirmed authenticator"))?;

        let accepted = match matching_step(&credential.secret, code, now, &self.config) {
            Some(step) => self.repo.advance_totp_step(user_id, step).await?,
            None => false,
        };
        if !accepted {
            self.limiter
                .record_failure(Operation::VerifyAuthenticator, &scope, now)
                .await?;
            return Err(VerificationError::invalid_proof("authenticator code did not match"));
        }

        let codes = generate_backup_codes(self.config.backup_code_count)?;
        let hashes = codes.iter().map(|c| hash_backup_code(user_id, c)).collect();
        if !self.repo.replace_backup_codes(user_id, hashes).await? {
            return Err(VerificationError::not_found("no confirmed authenticator"));
        }

        tracing::info!(user_id = %user_id, count = codes.len(), "Backup codes regenerated");
        Ok(codes.iter().map(|c| c.to_string()).collect())
    }

    /// Setup codes are no longer held here (expired, or issued by another
    /// instance), so the confirmation hands out a fresh set instead.
    async fn reissue_backup_codes(&self, user_id: UserId) -> Result<Vec<String>> {
        let codes = generate_backup_codes(self.config.backup_code_count)?;
        let hashes = codes.iter().map(|c| hash_backup_code(user_id, c)).collect();
        if !self.repo.replace_backup_codes(user_id, hashes).await? {
            return Err(VerificationError::not_found("no confirmed authenticator"));
        }
        tracing::info!(user_id = %user_id, "Backup codes reissued at confirmation");
        Ok(codes.iter().map(|c| c.to_string()).collect())
    }

    /// Drop setup codes whose enrollment window has closed.
    pub fn sweep_pending(&self, now: DateTime<Utc>) -> usize {
        let before = self.pending_codes.len();
        self.pending_codes.retain(|_, pending| pending.expires_at >= now);
        before.saturating_sub(self.pending_codes.len())
    }

    /// Remove the credential and recompute the level downward.
    pub async fn disable(&self, user_id: UserId) -> Result<UserVerificationState> {
        self.pending_codes.remove(&user_id);
        if !self.repo.delete_authenticator(user_id).await? {
            return Err(VerificationError::not_found("no authenticator configured"));
        }
        tracing::info!(user_id = %user_id, "Authenticator removed");
        self.aggregator.recompute(user_id, self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::{MemoryCounterStore, RateLimitPolicy};
    use crate::repository::MemoryRepository;
    use uuid::Uuid;

    const RFC_SECRET: &[u8] = b"12345678901234567890";

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    fn code_at(secret: &[u8], ts: i64) -> String {
        format!("{:06}", compute_totp(secret, (ts / 30) as u64, 6))
    }

    struct Fixture {
        manager: TotpManager,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(1_700_000_000)));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            RateLimitPolicy::default(),
        ));
        let manager = TotpManager::new(
            repo.clone(),
            Arc::new(Aggregator::new(repo)),
            limiter,
            clock.clone(),
            TotpConfig::default(),
        );
        Fixture { manager, clock }
    }

    fn secret_from(setup: &TotpSetup) -> Vec<u8> {
        BASE32_NOPAD
            .decode(setup.provisioning.secret.as_bytes())
            .unwrap()
    }

    #[test]
    fn test_rfc6238_sha1_vectors() {
        let vectors = [
            (59_u64, 94_287_082_u32),
            (1_111_111_109, 7_081_804),
            (1_111_111_111, 14_050_471),
            (1_234_567_890, 89_005_924),
            (2_000_000_000, 69_279_037),
            (20_000_000_000, 65_353_130),
        ];
        for (time, expected) in vectors {
            assert_eq!(compute_totp(RFC_SECRET, time / 30, 8), expected, "t={time}");
        }
    }

    #[test]
    fn test_window_accepts_adjacent_steps_only() {
        let config = TotpConfig::default();
        let now = at(1_700_000_000);
        let previous = code_at(RFC_SECRET, 1_700_000_000 - 30);
        let far = code_at(RFC_SECRET, 1_700_000_000 - 90);

        assert!(matching_step(RFC_SECRET, &previous, now, &config).is_some());
        assert!(matching_step(RFC_SECRET, &far, now, &config).is_none());
        assert!(matching_step(RFC_SECRET, "12345", now, &config).is_none());
    }

    #[test]
    fn test_otpauth_uri_shape() {
        let uri = build_otpauth_uri("alice@example.com", "JBSWY3DPEHPK3PXP", &TotpConfig::default());
        assert!(uri.starts_with("otpauth://totp/idproof:alice%40example.com?"));
        assert!(uri.contains("secret=JBSWY3DPEHPK3PXP"));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }

    #[test]
    fn test_backup_code_format_and_hash_normalization() {
        let codes = generate_backup_codes(3).unwrap();
        let user = Uuid::new_v4();
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert_eq!(
                hash_backup_code(user, code),
                hash_backup_code(user, &code.to_lowercase().replace('-', " "))
            );
        }
        assert_ne!(
            hash_backup_code(user, &codes[0]),
            hash_backup_code(Uuid::new_v4(), &codes[0])
        );
    }

    #[tokio::test]
    async fn test_setup_confirm_verify_flow() {
        let f = fixture();
        let user = Uuid::new_v4();

        let setup = f.manager.setup(user, Some("alice")).await.unwrap();
        assert_eq!(setup.backup_codes.len(), 10);
        assert!(setup.provisioning.qr_code.starts_with("data:image/svg+xml;base64,"));
        let secret = secret_from(&setup);
        assert_eq!(secret.len(), 20);

        // Unconfirmed credentials cannot be used to verify.
        let now = f.clock.now().timestamp();
        assert!(matches!(
            f.manager.verify(user, &code_at(&secret, now)).await,
            Err(VerificationError::NotFound(_))
        ));

        let confirmation = f.manager.confirm(user, &code_at(&secret, now)).await.unwrap();
        assert_eq!(confirmation.backup_codes.as_ref().unwrap(), &setup.backup_codes);
        assert!(confirmation.state.two_factor_enabled);

        // Same step again is a replay.
        assert!(matches!(
            f.manager.verify(user, &code_at(&secret, now)).await,
            Err(VerificationError::InvalidProof(_))
        ));

        f.clock.advance(chrono::Duration::seconds(30));
        let now = f.clock.now().timestamp();
        let verification = f.manager.verify(user, &code_at(&secret, now)).await.unwrap();
        assert_eq!(verification.method, TotpMethod::Totp);

        assert!(matches!(
            f.manager.setup(user, None).await,
            Err(VerificationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_setup_codes_are_swept() {
        let f = fixture();
        f.manager.setup(Uuid::new_v4(), None).await.unwrap();
        f.manager.setup(Uuid::new_v4(), None).await.unwrap();

        assert_eq!(f.manager.sweep_pending(f.clock.now()), 0);
        f.clock.advance(chrono::Duration::seconds(901));
        assert_eq!(f.manager.sweep_pending(f.clock.now()), 2);
        assert!(f.manager.pending_codes.is_empty());
    }

    #[tokio::test]
    async fn test_late_confirmation_reissues_backup_codes() {
        let f = fixture();
        let user = Uuid::new_v4();
        let setup = f.manager.setup(user, None).await.unwrap();
        let secret = secret_from(&setup);

        f.clock.advance(chrono::Duration::seconds(901));
        f.manager.sweep_pending(f.clock.now());
        let now = f.clock.now().timestamp();
        let confirmation = f.manager.confirm(user, &code_at(&secret, now)).await.unwrap();

        let reissued = confirmation.backup_codes.unwrap();
        assert_eq!(reissued.len(), 10);
        assert_ne!(reissued, setup.backup_codes);
        assert!(matches!(
            f.manager.verify(user, &setup.backup_codes[0]).await,
            Err(VerificationError::InvalidProof(_))
        ));
        let spent = f.manager.verify(user, &reissued[0]).await.unwrap();
        assert_eq!(spent.method, TotpMethod::BackupCode);
        assert_eq!(spent.backup_codes_remaining, 9);
    }

    #[tokio::test]
    async fn test_restarted_setup_releases_only_its_own_codes() {
        let f = fixture();
        let user = Uuid::new_v4();
        let first = f.manager.setup(user, None).await.unwrap();
        let second = f.manager.setup(user, None).await.unwrap();

        let now = f.clock.now().timestamp();
        assert!(matches!(
            f.manager.confirm(user, &code_at(&secret_from(&first), now)).await,
            Err(VerificationError::InvalidProof(_))
        ));
        let confirmation = f
            .manager
            .confirm(user, &code_at(&secret_from(&second), now))
            .await
            .unwrap();
        assert_eq!(confirmation.backup_codes.unwrap(), second.backup_codes);
    }

    #[tokio::test]
    async fn test_backup_codes_single_use_and_low_flag() {
        let f = fixture();
        let user = Uuid::new_v4();
        let setup = f.manager.setup(user, None).await.unwrap();
        let secret = secret_from(&setup);
        let now = f.clock.now().timestamp();
        f.manager.confirm(user, &code_at(&secret, now)).await.unwrap();

        let first = f.manager.verify(user, &setup.backup_codes[0]).await.unwrap();
        assert_eq!(first.method, TotpMethod::BackupCode);
        assert_eq!(first.backup_codes_remaining, 9);
        assert!(!first.low_backup_codes);

        assert!(matches!(
            f.manager.verify(user, &setup.backup_codes[0]).await,
            Err(VerificationError::InvalidProof(_))
        ));

        for code in &setup.backup_codes[1..7] {
            f.manager.verify(user, code).await.unwrap();
        }
        let low = f.manager.verify(user, &setup.backup_codes[7]).await.unwrap();
        assert_eq!(low.backup_codes_remaining, 2);
        assert!(low.low_backup_codes);
    }

    #[tokio::test]
    async fn test_regenerate_requires_fresh_code() {
        let f = fixture();
        let user = Uuid::new_v4();
        let setup = f.manager.setup(user, None).await.unwrap();
        let secret = secret_from(&setup);
        let now = f.clock.now().timestamp();
        f.manager.confirm(user, &code_at(&secret, now)).await.unwrap();

        assert!(f
            .manager
            .regenerate_backup_codes(user, &code_at(&secret, now))
            .await
            .is_err());

        f.clock.advance(chrono::Duration::seconds(30));
        let now = f.clock.now().timestamp();
        let fresh = f
            .manager
            .regenerate_backup_codes(user, &code_at(&secret, now))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 10);
        assert!(f.manager.verify(user, &setup.backup_codes[0]).await.is_err());
        assert!(f.manager.verify(user, &fresh[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_confirm_returns_no_codes() {
        let f = fixture();
        let user = Uuid::new_v4();
        let setup = f.manager.setup(user, None).await.unwrap();
        let secret = secret_from(&setup);
        let now = f.clock.now().timestamp();
        f.manager.confirm(user, &code_at(&secret, now)).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(30));
        let now = f.clock.now().timestamp();
        assert!(matches!(
            f.manager.confirm(user, &code_at(&secret, now)).await,
            Err(VerificationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_lowers_two_factor() {
        let f = fixture();
        let user = Uuid::new_v4();
        let setup = f.manager.setup(user, None).await.unwrap();
        let secret = secret_from(&setup);
        let now = f.clock.now().timestamp();
        f.manager.confirm(user, &code_at(&secret, now)).await.unwrap();

        let state = f.manager.disable(user).await.unwrap();
        assert!(!state.two_factor_enabled);
        assert!(matches!(
            f.manager.disable(user).await,
            Err(VerificationError::NotFound(_))
        ));
    }
}
