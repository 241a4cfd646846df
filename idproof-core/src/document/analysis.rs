//! Normalization of raw classifier output.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::model::{AnalysisResult, FraudIndicator};
use crate::error::{Result, VerificationError};

#[derive(Debug, Deserialize)]
struct WireReport {
    confidence: f64,
    #[serde(default, alias = "authenticityScore")]
    authenticity_score: Option<f64>,
    #[serde(default, alias = "qualityScore")]
    quality_score: Option<f64>,
    #[serde(default, alias = "fraudIndicators")]
    fraud_indicators: Vec<String>,
    #[serde(default, alias = "extractedFields")]
    extracted_fields: serde_json::Map<String, Value>,
}

fn score(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(VerificationError::provider(format!(
            "classifier returned {name} outside [0, 1]"
        )))
    }
}

/// Turn a classifier reply into an [`AnalysisResult`].
///
/// Missing sub-scores default to the overall confidence. Extracted fields must
/// be scalars; nulls are dropped.
pub fn normalize(raw: Value) -> Result<AnalysisResult> {
    let wire: WireReport = serde_json::from_value(raw)
        .map_err(|e| VerificationError::provider(format!("malformed classifier report: {e}")))?;

    let confidence = score("confidence", wire.confidence)?;
    let authenticity_score = score(
        "authenticity_score",
        wire.authenticity_score.unwrap_or(confidence),
    )?;
    let quality_score = score("quality_score", wire.quality_score.unwrap_or(confidence))?;

    let mut fraud_indicators: Vec<FraudIndicator> = Vec::new();
    for code in wire.fraud_indicators {
        if code.trim().is_empty() {
            return Err(VerificationError::provider("classifier returned an empty fraud indicator"));
        }
        let indicator = FraudIndicator::from_code(&code);
        if !fraud_indicators.contains(&indicator) {
            fraud_indicators.push(indicator);
        }
    }

    let mut extracted_fields = BTreeMap::new();
    for (key, value) in wire.extracted_fields {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(VerificationError::provider(format!(
                    "extracted field {key} is not a scalar"
                )))
            }
        };
        extracted_fields.insert(key, text);
    }

    Ok(AnalysisResult {
        confidence,
        authenticity_score,
        quality_score,
        fraud_indicators,
        extracted_fields,
    })
}
