//! Router configuration module
//!
//! Configures all routes, middleware layers, and creates the application router.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method, StatusCode},
    routing::{delete, get, post},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{REVIEWER_ID_HEADER, USER_ID_HEADER};
use crate::config::Config;
use crate::handlers::{
    confirm_authenticator, decide_review, disable_authenticator, finish_authentication,
    finish_registration, get_document, health, initiate_otp, latest_document, list_credentials,
    list_pending_reviews, ready, regenerate_backup_codes, resend_otp, review_history,
    revoke_credential, setup_authenticator, start_authentication, start_registration,
    submit_document, verification_state, verify_authenticator, verify_otp,
};
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Versioned API routes, without middleware
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/otp/initiate", post(initiate_otp))
        .route("/v1/otp/verify", post(verify_otp))
        .route("/v1/otp/resend", post(resend_otp))
        .route("/v1/authenticator", delete(disable_authenticator))
        .route("/v1/authenticator/setup", post(setup_authenticator))
        .route("/v1/authenticator/confirm", post(confirm_authenticator))
        .route("/v1/authenticator/verify", post(verify_authenticator))
        .route("/v1/authenticator/backup-codes", post(regenerate_backup_codes))
        .route("/v1/webauthn/register/start", post(start_registration))
        .route("/v1/webauthn/register/finish", post(finish_registration))
        .route("/v1/webauthn/authenticate/start", post(start_authentication))
        .route("/v1/webauthn/authenticate/finish", post(finish_authentication))
        .route("/v1/webauthn/credentials", get(list_credentials))
        .route("/v1/webauthn/credentials/{id}", delete(revoke_credential))
        .route("/v1/documents", post(submit_document))
        .route("/v1/documents/latest", get(latest_document))
        .route("/v1/documents/{id}", get(get_document))
        .route("/v1/reviews", get(list_pending_reviews))
        .route("/v1/reviews/{id}/decision", post(decide_review))
        .route("/v1/reviews/{id}/history", get(review_history))
        .route("/v1/verification-state", get(verification_state))
}

/// Create the application router with default config (for testing)
pub fn create_router(state: AppState) -> Router {
    create_router_with_config(state, &Config::default())
}

/// Create the application router with custom configuration
pub fn create_router_with_config(state: AppState, config: &Config) -> Router {
    // Configure CORS based on allowed_origins
    let cors = match &config.allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            tracing::info!("CORS: Restricting to {} origin(s)", origins.len());
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::AUTHORIZATION,
                    HeaderName::from_static(USER_ID_HEADER),
                    HeaderName::from_static(REVIEWER_ID_HEADER),
                ])
        }
        _ => {
            tracing::warn!("CORS: Allowing all origins (dev mode)");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    let body_limit_bytes = config.body_limit_mb * 1024 * 1024;
    let body_limit = RequestBodyLimitLayer::new(body_limit_bytes);

    let timeout = TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(config.timeout_secs),
    );

    let router = Router::new()
        .merge(api_routes())
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
        // Extractors like Multipart apply their own 2 MiB cap unless this is raised
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(body_limit)
        .layer(timeout);

    // Per-IP throttling (disabled in tests, enabled in production)
    let router = if config.rate_limit_enabled {
        let governor_conf = GovernorConfigBuilder::default()
            .per_second(config.rate_limit_per_sec)
            .burst_size(config.rate_limit_burst)
            .finish();

        match governor_conf {
            Some(conf) => {
                tracing::info!(
                    "Rate limiting: {} req/s (burst: {})",
                    config.rate_limit_per_sec,
                    config.rate_limit_burst
                );
                router.layer(GovernorLayer::new(Arc::new(conf)))
            }
            None => {
                tracing::error!(
                    per_sec = config.rate_limit_per_sec,
                    burst = config.rate_limit_burst,
                    "Invalid rate limit settings, throttling DISABLED"
                );
                router
            }
        }
    } else {
        tracing::warn!("Rate limiting: DISABLED");
        router
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
