//! Identity document submission and automatic routing.

mod analysis;
mod classifier;
mod model;
mod policy;

pub use analysis::normalize;
pub use classifier::{DocumentClassifier, HttpClassifier, ScriptedClassifier, UnavailableClassifier};
pub use model::{
    AnalysisResult, AttemptStatus, DocumentAnalysisResult, DocumentImage, DocumentType,
    FraudIndicator, IdentityVerificationAttempt, ReviewDecision, ReviewDecisionRecord,
};
pub use policy::{DecisionPolicy, Routing, UploadLimits, DEFAULT_CONTENT_TYPES};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::{Aggregator, UserVerificationState};
use crate::clock::Clock;
use crate::error::{Result, VerificationError};
use crate::rate_limit::{Operation, RateLimiter};
use crate::repository::Repository;
use crate::types::UserId;

/// A document submission as received from the caller.
#[derive(Debug, Clone)]
pub struct DocumentSubmission {
    pub document_type: DocumentType,
    pub images: Vec<DocumentImage>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub attempt: IdentityVerificationAttempt,
    pub analysis: DocumentAnalysisResult,
    pub state: UserVerificationState,
}

pub struct DocumentEngine {
    repo: Arc<dyn Repository>,
    aggregator: Arc<Aggregator>,
    limiter: Arc<RateLimiter>,
    classifier: Arc<dyn DocumentClassifier>,
    clock: Arc<dyn Clock>,
    policy: DecisionPolicy,
    limits: UploadLimits,
    /// Open attempts older than this are expired by the sweep.
    review_ttl: Duration,
}

impl DocumentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        aggregator: Arc<Aggregator>,
        limiter: Arc<RateLimiter>,
        classifier: Arc<dyn DocumentClassifier>,
        clock: Arc<dyn Clock>,
        policy: DecisionPolicy,
        limits: UploadLimits,
        review_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            aggregator,
            limiter,
            classifier,
            clock,
            policy,
            limits,
            review_ttl,
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Validate, classify and route a submission.
    ///
    /// A classifier failure leaves the attempt `SUBMITTED`; submitting again
    /// analyzes the new images against that same attempt.
    pub async fn submit(
        &self,
        user_id: UserId,
        submission: DocumentSubmission,
    ) -> Result<SubmissionOutcome> {
        self.limits.check(&submission.images)?;

        let now = self.clock.now();
        self.limiter
            .check_and_count(Operation::SubmitDocument, &user_id.to_string(), now)
            .await?;

        let attempt = self.open_attempt(user_id, &submission, now).await?;
        tracing::info!(
            user_id = %user_id,
            attempt_id = %attempt.id,
            document_type = attempt.document_type.as_str(),
            resubmission_count = attempt.resubmission_count,
            images = submission.images.len(),
            "Identity document submitted"
        );

        let raw = self
            .classifier
            .classify(
                attempt.id,
                attempt.document_type,
                &submission.images,
                &attempt.metadata,
            )
            .await
            .and_then(normalize)
            .inspect_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    attempt_id = %attempt.id,
                    error = %e,
                    "Document classification failed"
                );
            })?;

        let analysis = DocumentAnalysisResult {
            attempt_id: attempt.id,
            result: raw,
            created_at: self.clock.now(),
        };
        let analysis = if self.repo.insert_analysis(analysis.clone()).await? {
            analysis
        } else {
            // Analyses are immutable; route on the one already stored.
            self.repo
                .get_analysis(attempt.id)
                .await?
                .ok_or_else(|| VerificationError::not_found("analysis not found"))?
        };

        self.route(attempt, analysis).await
    }

    async fn open_attempt(
        &self,
        user_id: UserId,
        submission: &DocumentSubmission,
        now: DateTime<Utc>,
    ) -> Result<IdentityVerificationAttempt> {
        let resubmission_count = match self.repo.latest_attempt(user_id).await? {
            None => 0,
            Some(mut previous) if previous.status == AttemptStatus::Submitted => {
                previous.document_type = submission.document_type;
                previous.metadata = submission.metadata.clone();
                return Ok(previous);
            }
            Some(previous) if previous.status == AttemptStatus::UnderReview => {
                return Err(VerificationError::validation(
                    "an identity verification attempt is already under review",
                ));
            }
            Some(previous) if previous.status.is_approval() => {
                return Err(VerificationError::validation("identity is already verified"));
            }
            Some(previous) => {
                if !previous.can_resubmit() {
                    tracing::warn!(
                        user_id = %user_id,
                        attempt_id = %previous.id,
                        resubmission_count = previous.resubmission_count,
                        "Resubmission refused"
                    );
                    return Err(VerificationError::ResubmissionNotAllowed(
                        "resubmission limit reached".to_string(),
                    ));
                }
                previous.resubmission_count + 1
            }
        };

        let attempt = IdentityVerificationAttempt {
            id: Uuid::new_v4(),
            user_id,
            document_type: submission.document_type,
            status: AttemptStatus::Submitted,
            submitted_at: now,
            reviewed_at: None,
            reviewer_id: None,
            confidence: None,
            resubmission_count,
            max_resubmissions: self.policy.max_resubmissions,
            resubmission_allowed: false,
            rejection_reason: None,
            metadata: submission.metadata.clone(),
        };
        if !self.repo.insert_attempt(attempt.clone()).await? {
            return Err(VerificationError::validation(
                "an identity verification attempt is already in progress",
            ));
        }
        Ok(attempt)
    }

    async fn route(
        &self,
        mut attempt: IdentityVerificationAttempt,
        analysis: DocumentAnalysisResult,
    ) -> Result<SubmissionOutcome> {
        let routing = self.policy.route(&analysis.result);
        attempt.confidence = Some(analysis.result.confidence);
        match routing.status {
            AttemptStatus::AutoRejected => {
                let reason = routing.reason.unwrap_or_else(|| "rejected".to_string());
                attempt.reject(AttemptStatus::AutoRejected, reason);
            }
            status => attempt.status = status,
        }
        if attempt.status != AttemptStatus::UnderReview {
            attempt.reviewed_at = Some(analysis.created_at);
        }

        if !self
            .repo
            .update_attempt_if(&attempt, AttemptStatus::Submitted)
            .await?
        {
            return Err(VerificationError::ConflictingDecision(attempt.id));
        }

        let state = self
            .aggregator
            .recompute(attempt.user_id, self.clock.now())
            .await?;
        tracing::info!(
            user_id = %attempt.user_id,
            attempt_id = %attempt.id,
            status = %attempt.status,
            confidence = analysis.result.confidence,
            indicators = analysis.result.fraud_indicators.len(),
            "Identity document routed"
        );
        Ok(SubmissionOutcome {
            attempt,
            analysis,
            state,
        })
    }

    pub async fn get_attempt(&self, attempt_id: Uuid) -> Result<IdentityVerificationAttempt> {
        self.repo
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| VerificationError::not_found("attempt not found"))
    }

    pub async fn latest_attempt(&self, user_id: UserId) -> Result<IdentityVerificationAttempt> {
        self.repo
            .latest_attempt(user_id)
            .await?
            .ok_or_else(|| VerificationError::not_found("no identity verification attempts"))
    }

    pub async fn get_analysis(&self, attempt_id: Uuid) -> Result<Option<DocumentAnalysisResult>> {
        Ok(self.repo.get_analysis(attempt_id).await?)
    }

    /// Expire open attempts older than the review TTL. Returns the count.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let users = self.repo.expire_stale_attempts(now - self.review_ttl).await?;
        for user_id in &users {
            self.aggregator.recompute(*user_id, now).await?;
        }
        if !users.is_empty() {
            tracing::info!(count = users.len(), "Stale identity attempts expired");
        }
        Ok(users.len())
    }
}
