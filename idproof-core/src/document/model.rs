//! Records produced by the document pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VerificationError;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Passport,
    DriversLicense,
    NationalId,
    ResidencePermit,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Passport => "PASSPORT",
            DocumentType::DriversLicense => "DRIVERS_LICENSE",
            DocumentType::NationalId => "NATIONAL_ID",
            DocumentType::ResidencePermit => "RESIDENCE_PERMIT",
        }
    }
}

impl FromStr for DocumentType {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASSPORT" => Ok(DocumentType::Passport),
            "DRIVERS_LICENSE" => Ok(DocumentType::DriversLicense),
            "NATIONAL_ID" => Ok(DocumentType::NationalId),
            "RESIDENCE_PERMIT" => Ok(DocumentType::ResidencePermit),
            "" => Err(VerificationError::validation("document type is required")),
            other => Err(VerificationError::validation(format!(
                "unsupported document type: {other}"
            ))),
        }
    }
}

/// Lifecycle of an identity verification attempt.
///
/// `SUBMITTED` moves to one of the three routing outcomes; `UNDER_REVIEW`
/// moves to a human decision. Anything else is terminal for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Submitted,
    UnderReview,
    AutoApproved,
    AutoRejected,
    Approved,
    Rejected,
    Expired,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Submitted => "SUBMITTED",
            AttemptStatus::UnderReview => "UNDER_REVIEW",
            AttemptStatus::AutoApproved => "AUTO_APPROVED",
            AttemptStatus::AutoRejected => "AUTO_REJECTED",
            AttemptStatus::Approved => "APPROVED",
            AttemptStatus::Rejected => "REJECTED",
            AttemptStatus::Expired => "EXPIRED",
        }
    }

    /// Counts against the one-open-attempt-per-user rule.
    pub fn is_active(self) -> bool {
        matches!(self, AttemptStatus::Submitted | AttemptStatus::UnderReview)
    }

    pub fn is_approval(self) -> bool {
        matches!(self, AttemptStatus::AutoApproved | AttemptStatus::Approved)
    }

    /// States from which a new attempt may follow.
    pub fn permits_resubmission(self) -> bool {
        matches!(
            self,
            AttemptStatus::AutoRejected | AttemptStatus::Rejected | AttemptStatus::Expired
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(AttemptStatus::Submitted),
            "UNDER_REVIEW" => Ok(AttemptStatus::UnderReview),
            "AUTO_APPROVED" => Ok(AttemptStatus::AutoApproved),
            "AUTO_REJECTED" => Ok(AttemptStatus::AutoRejected),
            "APPROVED" => Ok(AttemptStatus::Approved),
            "REJECTED" => Ok(AttemptStatus::Rejected),
            "EXPIRED" => Ok(AttemptStatus::Expired),
            other => Err(VerificationError::validation(format!(
                "unknown attempt status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityVerificationAttempt {
    pub id: Uuid,
    pub user_id: UserId,
    pub document_type: DocumentType,
    pub status: AttemptStatus,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_id: Option<String>,
    pub confidence: Option<f64>,
    pub resubmission_count: u32,
    pub max_resubmissions: u32,
    pub resubmission_allowed: bool,
    pub rejection_reason: Option<String>,
    /// Caller-supplied context (client, locale). Opaque to the engine.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl IdentityVerificationAttempt {
    /// Whether a new attempt may follow this one.
    pub fn can_resubmit(&self) -> bool {
        self.status.permits_resubmission()
            && self.resubmission_allowed
            && self.resubmission_count < self.max_resubmissions
    }

    /// Move into a rejection state, setting the resubmission flag from the cap.
    pub fn reject(&mut self, status: AttemptStatus, reason: impl Into<String>) {
        self.status = status;
        self.rejection_reason = Some(reason.into());
        self.resubmission_allowed = self.resubmission_count < self.max_resubmissions;
    }
}

/// Fraud heuristics reported by the classifier.
///
/// Disqualifying indicators reject outright. The rest keep an attempt away
/// from auto-approval and send it to a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum FraudIndicator {
    Tampering,
    PhotoSubstitution,
    FontMismatch,
    ScreenCapture,
    ExpiredDocument,
    Glare,
    Blur,
    Cropped,
    Other(String),
}

impl FraudIndicator {
    pub fn code(&self) -> &str {
        match self {
            FraudIndicator::Tampering => "tampering",
            FraudIndicator::PhotoSubstitution => "photo_substitution",
            FraudIndicator::FontMismatch => "font_mismatch",
            FraudIndicator::ScreenCapture => "screen_capture",
            FraudIndicator::ExpiredDocument => "expired_document",
            FraudIndicator::Glare => "glare",
            FraudIndicator::Blur => "blur",
            FraudIndicator::Cropped => "cropped",
            FraudIndicator::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "tampering" => FraudIndicator::Tampering,
            "photo_substitution" => FraudIndicator::PhotoSubstitution,
            "font_mismatch" => FraudIndicator::FontMismatch,
            "screen_capture" => FraudIndicator::ScreenCapture,
            "expired_document" => FraudIndicator::ExpiredDocument,
            "glare" => FraudIndicator::Glare,
            "blur" => FraudIndicator::Blur,
            "cropped" => FraudIndicator::Cropped,
            other => FraudIndicator::Other(other.to_string()),
        }
    }

    pub fn is_disqualifying(&self) -> bool {
        matches!(
            self,
            FraudIndicator::Tampering
                | FraudIndicator::PhotoSubstitution
                | FraudIndicator::FontMismatch
                | FraudIndicator::ScreenCapture
                | FraudIndicator::ExpiredDocument
        )
    }
}

impl From<FraudIndicator> for String {
    fn from(indicator: FraudIndicator) -> Self {
        indicator.code().to_string()
    }
}

impl From<String> for FraudIndicator {
    fn from(code: String) -> Self {
        FraudIndicator::from_code(&code)
    }
}

/// Normalized classifier verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub confidence: f64,
    pub authenticity_score: f64,
    pub quality_score: f64,
    pub fraud_indicators: Vec<FraudIndicator>,
    pub extracted_fields: BTreeMap<String, String>,
}

/// Immutable analysis snapshot, one per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentAnalysisResult {
    pub attempt_id: Uuid,
    #[serde(flatten)]
    pub result: AnalysisResult,
    pub created_at: DateTime<Utc>,
}

/// One uploaded image. Bytes are passed through to the classifier only.
#[derive(Clone)]
pub struct DocumentImage {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for DocumentImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentImage")
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl ReviewDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewDecision::Approve => "APPROVE",
            ReviewDecision::Reject => "REJECT",
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(ReviewDecision::Approve),
            "REJECT" => Ok(ReviewDecision::Reject),
            other => Err(VerificationError::validation(format!(
                "unknown decision: {other}"
            ))),
        }
    }
}

/// Audit row for a manual decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecisionRecord {
    pub attempt_id: Uuid,
    pub reviewer_id: String,
    pub decision: ReviewDecision,
    pub notes: String,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(count: u32) -> IdentityVerificationAttempt {
        IdentityVerificationAttempt {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            document_type: DocumentType::Passport,
            status: AttemptStatus::UnderReview,
            submitted_at: Utc::now(),
            reviewed_at: None,
            reviewer_id: None,
            confidence: Some(0.5),
            resubmission_count: count,
            max_resubmissions: 3,
            resubmission_allowed: false,
            rejection_reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_reject_sets_resubmission_from_cap() {
        let mut under_cap = attempt(2);
        under_cap.reject(AttemptStatus::Rejected, "blurry");
        assert!(under_cap.resubmission_allowed);
        assert!(under_cap.can_resubmit());

        let mut at_cap = attempt(3);
        at_cap.reject(AttemptStatus::AutoRejected, "tampering");
        assert!(!at_cap.resubmission_allowed);
        assert!(!at_cap.can_resubmit());
    }

    #[test]
    fn test_fraud_indicator_codes() {
        assert!(FraudIndicator::from_code("TAMPERING").is_disqualifying());
        assert!(!FraudIndicator::from_code("glare").is_disqualifying());
        let unknown = FraudIndicator::from_code("hologram_missing");
        assert_eq!(unknown, FraudIndicator::Other("hologram_missing".into()));
        assert!(!unknown.is_disqualifying());

        let json = serde_json::to_string(&FraudIndicator::Blur).unwrap();
        assert_eq!(json, "\"blur\"");
    }

    #[test]
    fn test_document_type_parsing() {
        assert_eq!(
            "drivers_license".parse::<DocumentType>().unwrap(),
            DocumentType::DriversLicense
        );
        assert!("".parse::<DocumentType>().is_err());
        assert!("library_card".parse::<DocumentType>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(AttemptStatus::Submitted.is_active());
        assert!(AttemptStatus::UnderReview.is_active());
        assert!(!AttemptStatus::Rejected.is_active());
        assert!(AttemptStatus::Expired.permits_resubmission());
        assert!(!AttemptStatus::Approved.permits_resubmission());
    }
}
