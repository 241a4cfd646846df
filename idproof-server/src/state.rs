//! Application state module
//!
//! Defines shared state accessible across all request handlers.

use std::sync::Arc;

use idproof_core::{
    EngineConfig, HttpClassifier, HttpClientConfig, StorageError, VerificationEngine,
    VerificationError, WebhookProvider,
};
use thiserror::Error;

use crate::config::Config;
use crate::storage::Storage;

/// Failures while assembling the server at startup
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Engine configuration: {0}")]
    Engine(#[from] VerificationError),
}

/// Application state containing shared resources.
#[derive(Clone)]
pub struct AppState {
    /// The verification engine every handler delegates to
    pub engine: Arc<VerificationEngine>,
    /// Storage backend, kept for readiness checks
    pub storage: Arc<Storage>,
    /// Expected bearer token for callers. `None` skips the check (dev mode).
    pub service_token: Option<Arc<str>>,
    /// Take the client address from `X-Forwarded-For` instead of the socket peer.
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(engine: Arc<VerificationEngine>, storage: Arc<Storage>, service_token: Option<&str>) -> Self {
        Self {
            engine,
            storage,
            service_token: service_token.map(Arc::from),
            trust_forwarded_for: false,
        }
    }

    /// Honor `X-Forwarded-For`. Only safe behind a proxy that overwrites it.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Connect storage and wire the engine's outbound collaborators from `config`.
    pub async fn from_config(config: &Config, engine_config: EngineConfig) -> Result<Self, StartupError> {
        let storage = Storage::from_config(config).await?;

        let mut builder = VerificationEngine::builder(engine_config)
            .repository(storage.repository.clone())
            .counter_store(storage.counters.clone());

        match config.classifier_url.as_deref() {
            Some(url) => {
                let classifier = HttpClassifier::new(
                    url,
                    config.classifier_api_key.clone(),
                    HttpClientConfig::default(),
                )?;
                tracing::info!(url = %url, "Document classifier configured");
                builder = builder.classifier(Arc::new(classifier));
            }
            None => {
                tracing::warn!("CLASSIFIER_URL not set, document submissions will fail with PROVIDER_UNAVAILABLE");
            }
        }

        match config.delivery_webhook_url.as_deref() {
            Some(url) => {
                let provider = WebhookProvider::new(
                    url,
                    config.delivery_webhook_token.clone(),
                    HttpClientConfig::default(),
                )?;
                tracing::info!(url = %url, "OTP delivery webhook configured");
                builder = builder.delivery(Arc::new(provider));
            }
            None => {
                tracing::warn!("DELIVERY_WEBHOOK_URL not set, OTP messages cannot be delivered");
            }
        }

        if config.service_token.is_none() {
            tracing::warn!("SERVICE_TOKEN not set, API accepts unauthenticated callers (dev mode)");
        }

        let engine = Arc::new(builder.build()?);
        if config.trust_forwarded_for {
            tracing::info!("Client addresses taken from X-Forwarded-For");
        }

        Ok(Self::new(engine, Arc::new(storage), config.service_token.as_deref())
            .trust_forwarded_for(config.trust_forwarded_for))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("storage", &self.storage)
            .field("service_token", &self.service_token.as_ref().map(|_| "[REDACTED]"))
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .finish_non_exhaustive()
    }
}
