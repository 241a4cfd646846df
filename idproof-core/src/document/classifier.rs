//! Document classifier boundary.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::model::{DocumentImage, DocumentType};
use crate::error::{Result, VerificationError};
use crate::http::{HttpClientConfig, JsonHttpClient};

/// Returns the classifier's raw report; normalization happens in the engine.
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(
        &self,
        attempt_id: Uuid,
        document_type: DocumentType,
        images: &[DocumentImage],
        metadata: &Value,
    ) -> Result<Value>;
}

#[derive(Serialize)]
struct WireImage<'a> {
    content_type: &'a str,
    data: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    attempt_id: Uuid,
    document_type: DocumentType,
    images: Vec<WireImage<'a>>,
    metadata: &'a Value,
}

/// Remote classifier reached over HTTPS.
pub struct HttpClassifier {
    http: JsonHttpClient,
    url: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, api_key: Option<String>, config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            http: JsonHttpClient::new(config)?,
            url: url.into(),
            api_key,
        })
    }
}

impl std::fmt::Debug for HttpClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClassifier")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl DocumentClassifier for HttpClassifier {
    async fn classify(
        &self,
        attempt_id: Uuid,
        document_type: DocumentType,
        images: &[DocumentImage],
        metadata: &Value,
    ) -> Result<Value> {
        let request = WireRequest {
            attempt_id,
            document_type,
            images: images
                .iter()
                .map(|image| WireImage {
                    content_type: &image.content_type,
                    data: STANDARD.encode(&image.data),
                })
                .collect(),
            metadata,
        };
        self.http
            .post_json(&self.url, self.api_key.as_deref(), &request, "classifier")
            .await
    }
}

/// Classifier used when none is configured. Every call is a provider failure,
/// so attempts stay `SUBMITTED`.
#[derive(Debug, Default)]
pub struct UnavailableClassifier;

#[async_trait]
impl DocumentClassifier for UnavailableClassifier {
    async fn classify(
        &self,
        _attempt_id: Uuid,
        _document_type: DocumentType,
        _images: &[DocumentImage],
        _metadata: &Value,
    ) -> Result<Value> {
        Err(VerificationError::provider("no document classifier configured"))
    }
}

/// Replays queued reports in order. Test double.
#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<Value>>>,
    calls: Mutex<u32>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_report(&self, report: Value) {
        self.lock_script().push_back(Ok(report));
    }

    /// Queue a clean report with the given confidence.
    pub fn push_confidence(&self, confidence: f64) {
        self.push_report(serde_json::json!({
            "confidence": confidence,
            "fraud_indicators": [],
        }));
    }

    pub fn push_failure(&self, message: &str) {
        self.lock_script()
            .push_back(Err(VerificationError::provider(message)));
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Value>>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl DocumentClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        _attempt_id: Uuid,
        _document_type: DocumentType,
        _images: &[DocumentImage],
        _metadata: &Value,
    ) -> Result<Value> {
        *self.calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        self.lock_script()
            .pop_front()
            .unwrap_or_else(|| Err(VerificationError::provider("no scripted classifier report")))
    }
}
