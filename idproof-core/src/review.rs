//! Manual review queue and reviewer overrides.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::{Aggregator, UserVerificationState};
use crate::clock::Clock;
use crate::document::{
    AttemptStatus, DocumentAnalysisResult, IdentityVerificationAttempt, ReviewDecision,
    ReviewDecisionRecord,
};
use crate::error::{Result, VerificationError};
use crate::repository::Repository;

pub const MAX_PAGE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PendingReview {
    pub attempt: IdentityVerificationAttempt,
    pub analysis: Option<DocumentAnalysisResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub attempt: IdentityVerificationAttempt,
    pub record: ReviewDecisionRecord,
    pub state: UserVerificationState,
}

pub struct ReviewQueue {
    repo: Arc<dyn Repository>,
    aggregator: Arc<Aggregator>,
    clock: Arc<dyn Clock>,
}

impl ReviewQueue {
    pub fn new(repo: Arc<dyn Repository>, aggregator: Arc<Aggregator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            aggregator,
            clock,
        }
    }

    /// `UNDER_REVIEW` attempts, oldest first, each with its analysis.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<PendingReview>> {
        let attempts = self
            .repo
            .attempts_with_status(AttemptStatus::UnderReview, limit.clamp(1, MAX_PAGE))
            .await?;

        let mut pending = Vec::with_capacity(attempts.len());
        for attempt in attempts {
            let analysis = self.repo.get_analysis(attempt.id).await?;
            pending.push(PendingReview { attempt, analysis });
        }
        Ok(pending)
    }

    /// Apply a reviewer's decision. Only the first decision on an attempt lands.
    pub async fn override_decision(
        &self,
        attempt_id: Uuid,
        reviewer_id: &str,
        decision: ReviewDecision,
        notes: &str,
    ) -> Result<ReviewOutcome> {
        let reviewer_id = reviewer_id.trim();
        let notes = notes.trim();
        if reviewer_id.is_empty() {
            return Err(VerificationError::validation("reviewer id is required"));
        }
        if notes.is_empty() {
            return Err(VerificationError::validation("review notes are required"));
        }

        let mut attempt = self
            .repo
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| VerificationError::not_found("attempt not found"))?;
        if attempt.status != AttemptStatus::UnderReview {
            return Err(VerificationError::ConflictingDecision(attempt_id));
        }

        let now = self.clock.now();
        match decision {
            ReviewDecision::Approve => attempt.status = AttemptStatus::Approved,
            ReviewDecision::Reject => attempt.reject(AttemptStatus::Rejected, notes),
        }
        attempt.reviewed_at = Some(now);
        attempt.reviewer_id = Some(reviewer_id.to_string());

        if !self
            .repo
            .update_attempt_if(&attempt, AttemptStatus::UnderReview)
            .await?
        {
            tracing::warn!(attempt_id = %attempt_id, reviewer_id, "Concurrent review decision lost");
            return Err(VerificationError::ConflictingDecision(attempt_id));
        }

        let record = ReviewDecisionRecord {
            attempt_id,
            reviewer_id: reviewer_id.to_string(),
            decision,
            notes: notes.to_string(),
            decided_at: now,
        };
        self.repo.record_review(record.clone()).await?;

        let state = self.aggregator.recompute(attempt.user_id, now).await?;
        tracing::info!(
            attempt_id = %attempt_id,
            user_id = %attempt.user_id,
            reviewer_id,
            decision = decision.as_str(),
            status = %attempt.status,
            "Review decision recorded"
        );
        Ok(ReviewOutcome {
            attempt,
            record,
            state,
        })
    }

    pub async fn history(&self, attempt_id: Uuid) -> Result<Vec<ReviewDecisionRecord>> {
        Ok(self.repo.review_history(attempt_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document::DocumentType;
    use crate::repository::MemoryRepository;
    use chrono::{DateTime, Duration};

    fn queue() -> (ReviewQueue, Arc<MemoryRepository>, Arc<ManualClock>) {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let queue = ReviewQueue::new(repo.clone(), Arc::new(Aggregator::new(repo.clone())), clock.clone());
        (queue, repo, clock)
    }

    async fn under_review(repo: &MemoryRepository, clock: &ManualClock, count: u32) -> IdentityVerificationAttempt {
        let attempt = IdentityVerificationAttempt {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            document_type: DocumentType::NationalId,
            status: AttemptStatus::UnderReview,
            submitted_at: clock.now(),
            reviewed_at: None,
            reviewer_id: None,
            confidence: Some(0.5),
            resubmission_count: count,
            max_resubmissions: 3,
            resubmission_allowed: false,
            rejection_reason: None,
            metadata: serde_json::Value::Null,
        };
        assert!(repo.insert_attempt(attempt.clone()).await.unwrap());
        clock.advance(Duration::seconds(1));
        attempt
    }

    #[tokio::test]
    async fn test_list_pending_oldest_first() {
        let (queue, repo, clock) = queue();
        let first = under_review(&repo, &clock, 0).await;
        let second = under_review(&repo, &clock, 0).await;

        let pending = queue.list_pending(10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.attempt.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(queue.list_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_approve_sets_identity() {
        let (queue, repo, clock) = queue();
        let attempt = under_review(&repo, &clock, 0).await;
        let outcome = queue
            .override_decision(attempt.id, "rev-7", ReviewDecision::Approve, "matches selfie")
            .await
            .unwrap();
        assert_eq!(outcome.attempt.status, AttemptStatus::Approved);
        assert_eq!(outcome.attempt.reviewer_id.as_deref(), Some("rev-7"));
        assert!(outcome.state.identity_verified);
        assert_eq!(queue.history(attempt.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_at_cap_blocks_resubmission() {
        let (queue, repo, clock) = queue();
        let attempt = under_review(&repo, &clock, 3).await;
        let outcome = queue
            .override_decision(attempt.id, "rev-7", ReviewDecision::Reject, "glare on MRZ")
            .await
            .unwrap();
        assert_eq!(outcome.attempt.resubmission_count, 3);
        assert!(!outcome.attempt.resubmission_allowed);
        assert_eq!(outcome.attempt.rejection_reason.as_deref(), Some("glare on MRZ"));
    }

    #[tokio::test]
    async fn test_empty_notes_rejected() {
        let (queue, repo, clock) = queue();
        let attempt = under_review(&repo, &clock, 0).await;
        assert!(matches!(
            queue
                .override_decision(attempt.id, "rev-7", ReviewDecision::Approve, "   ")
                .await,
            Err(VerificationError::Validation(_))
        ));
        let stored = repo.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::UnderReview);
    }

    #[tokio::test]
    async fn test_second_decision_conflicts() {
        let (queue, repo, clock) = queue();
        let attempt = under_review(&repo, &clock, 0).await;
        queue
            .override_decision(attempt.id, "rev-1", ReviewDecision::Approve, "ok")
            .await
            .unwrap();
        assert!(matches!(
            queue
                .override_decision(attempt.id, "rev-2", ReviewDecision::Reject, "not ok")
                .await,
            Err(VerificationError::ConflictingDecision(id)) if id == attempt.id
        ));
    }

    #[tokio::test]
    async fn test_concurrent_decisions_single_winner() {
        let (queue, repo, clock) = queue();
        let attempt = under_review(&repo, &clock, 0).await;
        let attempt_id = attempt.id;
        let queue = Arc::new(queue);

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let decision = if i % 2 == 0 {
                    ReviewDecision::Approve
                } else {
                    ReviewDecision::Reject
                };
                queue
                    .override_decision(attempt_id, &format!("rev-{i}"), decision, "checked")
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(VerificationError::ConflictingDecision(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(queue.history(attempt_id).await.unwrap().len(), 1);
    }
}
