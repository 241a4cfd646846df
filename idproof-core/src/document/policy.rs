//! Routing thresholds and upload limits.

use super::model::{AnalysisResult, AttemptStatus, DocumentImage};
use crate::error::{Result, VerificationError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    /// At or above this confidence, with no fraud indicators, approve automatically.
    pub high_threshold: f64,
    /// At or below this confidence, reject automatically.
    pub low_threshold: f64,
    pub max_resubmissions: u32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            high_threshold: 0.85,
            low_threshold: 0.20,
            max_resubmissions: 3,
        }
    }
}

/// Where an analysis sends its attempt, with the reason for a rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub status: AttemptStatus,
    pub reason: Option<String>,
}

impl DecisionPolicy {
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_range(self.high_threshold) || !in_range(self.low_threshold) {
            return Err(VerificationError::validation("thresholds must lie in [0, 1]"));
        }
        if self.low_threshold >= self.high_threshold {
            return Err(VerificationError::validation(
                "low threshold must be below high threshold",
            ));
        }
        Ok(())
    }

    pub fn route(&self, analysis: &AnalysisResult) -> Routing {
        if let Some(indicator) = analysis
            .fraud_indicators
            .iter()
            .find(|i| i.is_disqualifying())
        {
            return Routing {
                status: AttemptStatus::AutoRejected,
                reason: Some(format!("fraud indicator: {}", indicator.code())),
            };
        }
        if analysis.confidence <= self.low_threshold {
            return Routing {
                status: AttemptStatus::AutoRejected,
                reason: Some("document could not be verified".to_string()),
            };
        }
        if analysis.confidence >= self.high_threshold && analysis.fraud_indicators.is_empty() {
            return Routing {
                status: AttemptStatus::AutoApproved,
                reason: None,
            };
        }
        Routing {
            status: AttemptStatus::UnderReview,
            reason: None,
        }
    }
}

pub const DEFAULT_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/heic"];

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_image_bytes: usize,
    pub max_images: usize,
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024,
            max_images: 4,
            allowed_content_types: DEFAULT_CONTENT_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl UploadLimits {
    pub fn check(&self, images: &[DocumentImage]) -> Result<()> {
        if images.is_empty() {
            return Err(VerificationError::validation("at least one image is required"));
        }
        if images.len() > self.max_images {
            return Err(VerificationError::validation(format!(
                "at most {} images may be submitted",
                self.max_images
            )));
        }
        for (index, image) in images.iter().enumerate() {
            if image.data.is_empty() {
                return Err(VerificationError::validation(format!("image {index} is empty")));
            }
            if image.data.len() > self.max_image_bytes {
                return Err(VerificationError::validation(format!(
                    "image {index} exceeds {} bytes",
                    self.max_image_bytes
                )));
            }
            let content_type = image.content_type.trim().to_ascii_lowercase();
            if !self.allowed_content_types.iter().any(|t| *t == content_type) {
                return Err(VerificationError::validation(format!(
                    "image {index} has unsupported content type {content_type}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::model::FraudIndicator;
    use std::collections::BTreeMap;

    fn analysis(confidence: f64, indicators: Vec<FraudIndicator>) -> AnalysisResult {
        AnalysisResult {
            confidence,
            authenticity_score: confidence,
            quality_score: 0.9,
            fraud_indicators: indicators,
            extracted_fields: BTreeMap::new(),
        }
    }

    fn image(len: usize, content_type: &str) -> DocumentImage {
        DocumentImage {
            content_type: content_type.to_string(),
            data: vec![0xFF; len],
        }
    }

    #[test]
    fn test_routing_bands() {
        let policy = DecisionPolicy::default();
        assert_eq!(policy.route(&analysis(0.91, vec![])).status, AttemptStatus::AutoApproved);
        assert_eq!(policy.route(&analysis(0.85, vec![])).status, AttemptStatus::AutoApproved);
        assert_eq!(policy.route(&analysis(0.42, vec![])).status, AttemptStatus::UnderReview);
        assert_eq!(policy.route(&analysis(0.20, vec![])).status, AttemptStatus::AutoRejected);
        assert_eq!(policy.route(&analysis(0.05, vec![])).status, AttemptStatus::AutoRejected);
    }

    #[test]
    fn test_indicators_override_confidence() {
        let policy = DecisionPolicy::default();
        let rejected = policy.route(&analysis(0.99, vec![FraudIndicator::Tampering]));
        assert_eq!(rejected.status, AttemptStatus::AutoRejected);
        assert_eq!(rejected.reason.as_deref(), Some("fraud indicator: tampering"));

        let soft = policy.route(&analysis(0.99, vec![FraudIndicator::Glare]));
        assert_eq!(soft.status, AttemptStatus::UnderReview);
    }

    #[test]
    fn test_policy_validation() {
        assert!(DecisionPolicy::default().validate().is_ok());
        let inverted = DecisionPolicy {
            high_threshold: 0.2,
            low_threshold: 0.8,
            max_resubmissions: 3,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_upload_limits() {
        let limits = UploadLimits {
            max_image_bytes: 16,
            max_images: 2,
            ..UploadLimits::default()
        };
        assert!(limits.check(&[image(16, "image/jpeg")]).is_ok());
        assert!(limits.check(&[image(16, "IMAGE/PNG")]).is_ok());
        assert!(limits.check(&[]).is_err());
        assert!(limits.check(&[image(17, "image/jpeg")]).is_err());
        assert!(limits.check(&[image(4, "application/pdf")]).is_err());
        assert!(limits.check(&[image(0, "image/jpeg")]).is_err());
        assert!(limits
            .check(&[image(1, "image/jpeg"), image(1, "image/jpeg"), image(1, "image/jpeg")])
            .is_err());
    }
}
