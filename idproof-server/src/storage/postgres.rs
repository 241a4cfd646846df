//! PostgreSQL implementations of the engine's storage seams.
//!
//! Every state change is one statement (or one transaction) whose `WHERE`
//! clause carries the expected prior value, so concurrent writers cannot both win.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use idproof_core::{
    AnalysisResult, AttemptStatus, AuthenticatorCredential, BackupCode, Channel, ContactPoint,
    CounterStore, DocumentAnalysisResult, DocumentType, FraudIndicator,
    IdentityVerificationAttempt, Repository, ReviewDecision, ReviewDecisionRecord, StorageError,
    UserId, UserVerificationState, VerificationLevel, WebAuthnCredential, WindowCount,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;
use zeroize::Zeroizing;

type StoreResult<T> = Result<T, StorageError>;

fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

fn decode_err(field: &str, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Serialization(format!("{field}: {detail}"))
}

fn to_u32(value: i64, field: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|e| decode_err(field, e))
}

fn to_i32(value: u32, field: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|e| decode_err(field, e))
}

const ATTEMPT_COLUMNS: &str = "id, user_id, document_type, status, submitted_at, reviewed_at, \
     reviewer_id, confidence, resubmission_count, max_resubmissions, resubmission_allowed, \
     rejection_reason, metadata";

const CREDENTIAL_COLUMNS: &str =
    "credential_id, user_id, public_key, sign_count, device_label, created_at, last_used_at";

#[derive(FromRow)]
struct ContactRow {
    user_id: Uuid,
    channel: String,
    destination: String,
    verified_at: DateTime<Utc>,
}

impl TryFrom<ContactRow> for ContactPoint {
    type Error = StorageError;

    fn try_from(row: ContactRow) -> StoreResult<Self> {
        Ok(Self {
            user_id: row.user_id,
            channel: Channel::from_str(&row.channel).map_err(|e| decode_err("channel", e))?,
            destination: row.destination,
            verified_at: row.verified_at,
        })
    }
}

#[derive(FromRow)]
struct AuthenticatorRow {
    user_id: Uuid,
    secret: Vec<u8>,
    confirmed: bool,
    last_used_step: Option<i64>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct BackupCodeRow {
    code_hash: String,
    used: bool,
}

#[derive(FromRow)]
struct CredentialRow {
    credential_id: String,
    user_id: Uuid,
    public_key: serde_json::Value,
    sign_count: i64,
    device_label: Option<String>,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<CredentialRow> for WebAuthnCredential {
    type Error = StorageError;

    fn try_from(row: CredentialRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.credential_id,
            user_id: row.user_id,
            public_key: row.public_key,
            sign_count: to_u32(row.sign_count, "sign_count")?,
            device_label: row.device_label,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    id: Uuid,
    user_id: Uuid,
    document_type: String,
    status: String,
    submitted_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
    reviewer_id: Option<String>,
    confidence: Option<f64>,
    resubmission_count: i32,
    max_resubmissions: i32,
    resubmission_allowed: bool,
    rejection_reason: Option<String>,
    metadata: serde_json::Value,
}

impl TryFrom<AttemptRow> for IdentityVerificationAttempt {
    type Error = StorageError;

    fn try_from(row: AttemptRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            document_type: DocumentType::from_str(&row.document_type)
                .map_err(|e| decode_err("document_type", e))?,
            status: AttemptStatus::from_str(&row.status).map_err(|e| decode_err("status", e))?,
            submitted_at: row.submitted_at,
            reviewed_at: row.reviewed_at,
            reviewer_id: row.reviewer_id,
            confidence: row.confidence,
            resubmission_count: to_u32(row.resubmission_count.into(), "resubmission_count")?,
            max_resubmissions: to_u32(row.max_resubmissions.into(), "max_resubmissions")?,
            resubmission_allowed: row.resubmission_allowed,
            rejection_reason: row.rejection_reason,
            metadata: row.metadata,
        })
    }
}

#[derive(FromRow)]
struct AnalysisRow {
    attempt_id: Uuid,
    confidence: f64,
    authenticity_score: f64,
    quality_score: f64,
    fraud_indicators: serde_json::Value,
    extracted_fields: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AnalysisRow> for DocumentAnalysisResult {
    type Error = StorageError;

    fn try_from(row: AnalysisRow) -> StoreResult<Self> {
        let fraud_indicators: Vec<FraudIndicator> = serde_json::from_value(row.fraud_indicators)
            .map_err(|e| decode_err("fraud_indicators", e))?;
        let extracted_fields: BTreeMap<String, String> =
            serde_json::from_value(row.extracted_fields)
                .map_err(|e| decode_err("extracted_fields", e))?;
        Ok(Self {
            attempt_id: row.attempt_id,
            result: AnalysisResult {
                confidence: row.confidence,
                authenticity_score: row.authenticity_score,
                quality_score: row.quality_score,
                fraud_indicators,
                extracted_fields,
            },
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct ReviewRow {
    attempt_id: Uuid,
    reviewer_id: String,
    decision: String,
    notes: String,
    decided_at: DateTime<Utc>,
}

impl TryFrom<ReviewRow> for ReviewDecisionRecord {
    type Error = StorageError;

    fn try_from(row: ReviewRow) -> StoreResult<Self> {
        Ok(Self {
            attempt_id: row.attempt_id,
            reviewer_id: row.reviewer_id,
            decision: ReviewDecision::from_str(&row.decision)
                .map_err(|e| decode_err("decision", e))?,
            notes: row.notes,
            decided_at: row.decided_at,
        })
    }
}

#[derive(FromRow)]
struct StateRow {
    user_id: Uuid,
    phone_verified: bool,
    email_verified: bool,
    two_factor_enabled: bool,
    identity_verified: bool,
    verification_level: String,
    updated_at: Option<DateTime<Utc>>,
}

impl From<StateRow> for UserVerificationState {
    fn from(row: StateRow) -> Self {
        Self {
            user_id: row.user_id,
            phone_verified: row.phone_verified,
            email_verified: row.email_verified,
            two_factor_enabled: row.two_factor_enabled,
            identity_verified: row.identity_verified,
            verification_level: VerificationLevel::from_str_lossy(&row.verification_level),
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL-backed proof records.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_backup_codes(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: UserId,
        hashes: &[String],
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_codes (user_id, code_hash, position)
            SELECT $1, code_hash, position
            FROM UNNEST($2::text[]) WITH ORDINALITY AS t(code_hash, position)
            "#,
        )
        .bind(user_id)
        .bind(hashes)
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresRepository")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn mark_contact_verified(&self, point: ContactPoint) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contact_points (user_id, channel, destination, verified_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, channel) DO UPDATE SET
                destination = EXCLUDED.destination,
                verified_at = EXCLUDED.verified_at
            "#,
        )
        .bind(point.user_id)
        .bind(point.channel.as_str())
        .bind(&point.destination)
        .bind(point.verified_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn contact_points(&self, user_id: UserId) -> StoreResult<Vec<ContactPoint>> {
        let rows = sqlx::query_as::<_, ContactRow>(
            r#"
            SELECT user_id, channel, destination, verified_at
            FROM contact_points
            WHERE user_id = $1
            ORDER BY verified_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.into_iter().map(ContactPoint::try_from).collect()
    }

    async fn get_authenticator(
        &self,
        user_id: UserId,
    ) -> StoreResult<Option<AuthenticatorCredential>> {
        let Some(row) = sqlx::query_as::<_, AuthenticatorRow>(
            r#"
            SELECT user_id, secret, confirmed, last_used_step, created_at
            FROM authenticators
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?
        else {
            return Ok(None);
        };

        let codes = sqlx::query_as::<_, BackupCodeRow>(
            "SELECT code_hash, used FROM backup_codes WHERE user_id = $1 ORDER BY position",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(Some(AuthenticatorCredential {
            user_id: row.user_id,
            secret: Zeroizing::new(row.secret),
            confirmed: row.confirmed,
            backup_codes: codes
                .into_iter()
                .map(|c| BackupCode {
                    code_hash: c.code_hash,
                    used: c.used,
                })
                .collect(),
            last_used_step: row.last_used_step,
            created_at: row.created_at,
        }))
    }

    async fn put_pending_authenticator(
        &self,
        credential: AuthenticatorCredential,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        // A confirmed row is never overwritten.
        let written = sqlx::query(
            r#"
            INSERT INTO authenticators (user_id, secret, confirmed, last_used_step, created_at)
            VALUES ($1, $2, FALSE, NULL, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                secret = EXCLUDED.secret,
                confirmed = FALSE,
                last_used_step = NULL,
                created_at = EXCLUDED.created_at
            WHERE authenticators.confirmed = FALSE
            "#,
        )
        .bind(credential.user_id)
        .bind(credential.secret.as_slice())
        .bind(credential.created_at)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        if written == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(credential.user_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        let hashes: Vec<String> = credential
            .backup_codes
            .iter()
            .map(|c| c.code_hash.clone())
            .collect();
        Self::insert_backup_codes(&mut tx, credential.user_id, &hashes).await?;

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn confirm_authenticator(
        &self,
        user_id: UserId,
        secret: &[u8],
        step: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE authenticators
            SET confirmed = TRUE, last_used_step = $2
            WHERE user_id = $1 AND confirmed = FALSE AND secret = $3
            "#,
        )
        .bind(user_id)
        .bind(step)
        .bind(secret)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_totp_step(&self, user_id: UserId, step: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE authenticators
            SET last_used_step = $2
            WHERE user_id = $1 AND (last_used_step IS NULL OR last_used_step < $2)
            "#,
        )
        .bind(user_id)
        .bind(step)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume_backup_code(
        &self,
        user_id: UserId,
        code_hash: &str,
    ) -> StoreResult<Option<usize>> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let consumed = sqlx::query(
            r#"
            UPDATE backup_codes SET used = TRUE
            WHERE user_id = $1 AND code_hash = $2 AND used = FALSE
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        if consumed == 0 {
            return Ok(None);
        }

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_codes WHERE user_id = $1 AND used = FALSE",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(Some(usize::try_from(remaining).unwrap_or_default()))
    }

    async fn replace_backup_codes(&self, user_id: UserId, hashes: Vec<String>) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM authenticators WHERE user_id = $1 FOR UPDATE)",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;

        if !exists {
            return Ok(false);
        }

        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        Self::insert_backup_codes(&mut tx, user_id, &hashes).await?;

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn delete_authenticator(&self, user_id: UserId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM authenticators WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_credentials(&self, user_id: UserId) -> StoreResult<Vec<WebAuthnCredential>> {
        let rows = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM webauthn_credentials WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.into_iter().map(WebAuthnCredential::try_from).collect()
    }

    async fn get_credential(&self, credential_id: &str) -> StoreResult<Option<WebAuthnCredential>> {
        sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM webauthn_credentials WHERE credential_id = $1"
        ))
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?
        .map(WebAuthnCredential::try_from)
        .transpose()
    }

    async fn insert_credential(&self, credential: WebAuthnCredential) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webauthn_credentials
                (credential_id, user_id, public_key, sign_count, device_label, created_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (credential_id) DO NOTHING
            "#,
        )
        .bind(&credential.id)
        .bind(credential.user_id)
        .bind(&credential.public_key)
        .bind(i64::from(credential.sign_count))
        .bind(&credential.device_label)
        .bind(credential.created_at)
        .bind(credential.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_sign_count(
        &self,
        credential_id: &str,
        expected: u32,
        new: u32,
        public_key: serde_json::Value,
        used_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webauthn_credentials
            SET sign_count = $3, public_key = $4, last_used_at = $5
            WHERE credential_id = $1 AND sign_count = $2
            "#,
        )
        .bind(credential_id)
        .bind(i64::from(expected))
        .bind(i64::from(new))
        .bind(&public_key)
        .bind(used_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_credential(&self, user_id: UserId, credential_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM webauthn_credentials WHERE credential_id = $1 AND user_id = $2",
        )
        .bind(credential_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_attempt(&self, attempt: IdentityVerificationAttempt) -> StoreResult<bool> {
        // The partial unique index turns a second open attempt into a no-op.
        let result = sqlx::query(
            r#"
            INSERT INTO identity_attempts
                (id, user_id, document_type, status, submitted_at, reviewed_at, reviewer_id,
                 confidence, resubmission_count, max_resubmissions, resubmission_allowed,
                 rejection_reason, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(attempt.document_type.as_str())
        .bind(attempt.status.as_str())
        .bind(attempt.submitted_at)
        .bind(attempt.reviewed_at)
        .bind(&attempt.reviewer_id)
        .bind(attempt.confidence)
        .bind(to_i32(attempt.resubmission_count, "resubmission_count")?)
        .bind(to_i32(attempt.max_resubmissions, "max_resubmissions")?)
        .bind(attempt.resubmission_allowed)
        .bind(&attempt.rejection_reason)
        .bind(&attempt.metadata)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_attempt(
        &self,
        attempt_id: Uuid,
    ) -> StoreResult<Option<IdentityVerificationAttempt>> {
        sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM identity_attempts WHERE id = $1"
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?
        .map(IdentityVerificationAttempt::try_from)
        .transpose()
    }

    async fn latest_attempt(
        &self,
        user_id: UserId,
    ) -> StoreResult<Option<IdentityVerificationAttempt>> {
        sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM identity_attempts WHERE user_id = $1 \
             ORDER BY submitted_at DESC, resubmission_count DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?
        .map(IdentityVerificationAttempt::try_from)
        .transpose()
    }

    async fn update_attempt_if(
        &self,
        attempt: &IdentityVerificationAttempt,
        expected: AttemptStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE identity_attempts SET
                document_type = $3,
                status = $4,
                reviewed_at = $5,
                reviewer_id = $6,
                confidence = $7,
                resubmission_count = $8,
                max_resubmissions = $9,
                resubmission_allowed = $10,
                rejection_reason = $11,
                metadata = $12
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(attempt.id)
        .bind(expected.as_str())
        .bind(attempt.document_type.as_str())
        .bind(attempt.status.as_str())
        .bind(attempt.reviewed_at)
        .bind(&attempt.reviewer_id)
        .bind(attempt.confidence)
        .bind(to_i32(attempt.resubmission_count, "resubmission_count")?)
        .bind(to_i32(attempt.max_resubmissions, "max_resubmissions")?)
        .bind(attempt.resubmission_allowed)
        .bind(&attempt.rejection_reason)
        .bind(&attempt.metadata)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn attempts_with_status(
        &self,
        status: AttemptStatus,
        limit: usize,
    ) -> StoreResult<Vec<IdentityVerificationAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM identity_attempts WHERE status = $1 \
             ORDER BY submitted_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.into_iter()
            .map(IdentityVerificationAttempt::try_from)
            .collect()
    }

    async fn has_approved_attempt(&self, user_id: UserId) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM identity_attempts
                WHERE user_id = $1 AND status IN ('AUTO_APPROVED', 'APPROVED')
            )
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)
    }

    async fn expire_stale_attempts(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<UserId>> {
        sqlx::query_scalar(
            r#"
            UPDATE identity_attempts SET
                status = 'EXPIRED',
                rejection_reason = 'attempt expired before a decision',
                resubmission_allowed = resubmission_count < max_resubmissions
            WHERE status IN ('SUBMITTED', 'UNDER_REVIEW') AND submitted_at < $1
            RETURNING user_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    async fn insert_analysis(&self, analysis: DocumentAnalysisResult) -> StoreResult<bool> {
        let indicators = serde_json::to_value(&analysis.result.fraud_indicators)
            .map_err(|e| decode_err("fraud_indicators", e))?;
        let fields = serde_json::to_value(&analysis.result.extracted_fields)
            .map_err(|e| decode_err("extracted_fields", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO document_analyses
                (attempt_id, confidence, authenticity_score, quality_score,
                 fraud_indicators, extracted_fields, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (attempt_id) DO NOTHING
            "#,
        )
        .bind(analysis.attempt_id)
        .bind(analysis.result.confidence)
        .bind(analysis.result.authenticity_score)
        .bind(analysis.result.quality_score)
        .bind(&indicators)
        .bind(&fields)
        .bind(analysis.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_analysis(&self, attempt_id: Uuid) -> StoreResult<Option<DocumentAnalysisResult>> {
        sqlx::query_as::<_, AnalysisRow>(
            r#"
            SELECT attempt_id, confidence, authenticity_score, quality_score,
                   fraud_indicators, extracted_fields, created_at
            FROM document_analyses
            WHERE attempt_id = $1
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?
        .map(DocumentAnalysisResult::try_from)
        .transpose()
    }

    async fn record_review(&self, record: ReviewDecisionRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO review_decisions (attempt_id, reviewer_id, decision, notes, decided_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.attempt_id)
        .bind(&record.reviewer_id)
        .bind(record.decision.as_str())
        .bind(&record.notes)
        .bind(record.decided_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn review_history(&self, attempt_id: Uuid) -> StoreResult<Vec<ReviewDecisionRecord>> {
        let rows = sqlx::query_as::<_, ReviewRow>(
            r#"
            SELECT attempt_id, reviewer_id, decision, notes, decided_at
            FROM review_decisions
            WHERE attempt_id = $1
            ORDER BY decided_at, id
            "#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.into_iter().map(ReviewDecisionRecord::try_from).collect()
    }

    async fn get_state(&self, user_id: UserId) -> StoreResult<Option<UserVerificationState>> {
        let row = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT user_id, phone_verified, email_verified, two_factor_enabled,
                   identity_verified, verification_level, updated_at
            FROM verification_states
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(UserVerificationState::from))
    }

    async fn put_state(&self, state: UserVerificationState) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_states
                (user_id, phone_verified, email_verified, two_factor_enabled,
                 identity_verified, verification_level, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO UPDATE SET
                phone_verified = EXCLUDED.phone_verified,
                email_verified = EXCLUDED.email_verified,
                two_factor_enabled = EXCLUDED.two_factor_enabled,
                identity_verified = EXCLUDED.identity_verified,
                verification_level = EXCLUDED.verification_level,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.user_id)
        .bind(state.phone_verified)
        .bind(state.email_verified)
        .bind(state.two_factor_enabled)
        .bind(state.identity_verified)
        .bind(state.verification_level.as_str())
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }
}

/// Rate-limit windows shared across instances.
#[derive(Clone)]
pub struct PostgresCounterStore {
    pool: PgPool,
}

impl PostgresCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct WindowRow {
    count: i32,
    resets_at: DateTime<Utc>,
}

impl From<WindowRow> for WindowCount {
    fn from(row: WindowRow) -> Self {
        Self {
            count: u32::try_from(row.count).unwrap_or_default(),
            resets_at: row.resets_at,
        }
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount> {
        // A closed window restarts at 1 in the same statement.
        let row = sqlx::query_as::<_, WindowRow>(
            r#"
            INSERT INTO rate_limit_counters (key, count, resets_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_counters.resets_at <= $3 THEN 1
                    ELSE LEAST(rate_limit_counters.count, 2147483646) + 1
                END,
                resets_at = CASE
                    WHEN rate_limit_counters.resets_at <= $3 THEN EXCLUDED.resets_at
                    ELSE rate_limit_counters.resets_at
                END
            RETURNING count, resets_at
            "#,
        )
        .bind(key)
        .bind(now + window)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.into())
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<WindowCount>> {
        let row = sqlx::query_as::<_, WindowRow>(
            "SELECT count, resets_at FROM rate_limit_counters WHERE key = $1 AND resets_at > $2",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(WindowCount::from))
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM rate_limit_counters WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE resets_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

impl std::fmt::Debug for PostgresCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCounterStore")
            .field("pool", &"<PgPool>")
            .finish()
    }
}
