//! WebAuthn (passkey / security key) handlers
//!
//! Start endpoints return `PublicKeyCredentialCreationOptions` or
//! `PublicKeyCredentialRequestOptions` JSON for `navigator.credentials`.
//! Finish endpoints take the browser's credential JSON as-is.

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    Json,
};
use idproof_core::{
    AuthenticationOutcome, CeremonyOptions, CredentialSummary, RegisteredCredential,
    UserVerificationState,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::Subject;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct StartRegistrationRequest {
    /// Label shown when listing the user's keys
    #[schema(example = "YubiKey 5C")]
    pub device_label: Option<String>,
    /// Account name shown by the authenticator (defaults to the user id)
    #[schema(example = "alice@example.com")]
    pub user_name: Option<String>,
}

/// Start registering a new credential
///
/// Credentials the user already holds are listed in `excludeCredentials`.
#[utoipa::path(
    post,
    path = "/v1/webauthn/register/start",
    tag = "WebAuthn",
    request_body = StartRegistrationRequest,
    responses((status = 200, description = "challenge_ref, expires_at and creation options")),
    security(("service_token" = []))
)]
pub async fn start_registration(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Option<Json<StartRegistrationRequest>>,
) -> Result<Json<CeremonyOptions>, ApiError> {
    let req = payload.map(|Json(r)| r).unwrap_or_default();
    let options = state
        .engine
        .webauthn
        .begin_registration(user_id, req.device_label, req.user_name.as_deref())
        .await?;
    Ok(Json(options))
}

/// Finish registration with the authenticator's attestation
#[utoipa::path(
    post,
    path = "/v1/webauthn/register/finish",
    tag = "WebAuthn",
    request_body(content = Object, description = "RegisterPublicKeyCredential JSON from the browser"),
    responses(
        (status = 200, description = "Credential stored; body holds it and the updated verification state"),
        (status = 400, description = "Credential already registered", body = crate::error::ErrorBody),
        (status = 410, description = "No live registration challenge", body = crate::error::ErrorBody),
        (status = 422, description = "Attestation rejected", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn finish_registration(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<RegisteredCredential>, ApiError> {
    let Json(response) = payload?;
    let registered = state
        .engine
        .webauthn
        .finish_registration(user_id, &response)
        .await?;
    Ok(Json(registered))
}

/// Start an assertion over the user's registered credentials
#[utoipa::path(
    post,
    path = "/v1/webauthn/authenticate/start",
    tag = "WebAuthn",
    responses(
        (status = 200, description = "challenge_ref, expires_at and request options"),
        (status = 404, description = "User has no registered credentials", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn start_authentication(
    State(state): State<AppState>,
    Subject(user_id): Subject,
) -> Result<Json<CeremonyOptions>, ApiError> {
    Ok(Json(state.engine.webauthn.begin_authentication(user_id).await?))
}

/// Finish an assertion
///
/// The stored signature counter must advance unless both sides report zero.
#[utoipa::path(
    post,
    path = "/v1/webauthn/authenticate/finish",
    tag = "WebAuthn",
    request_body(content = Object, description = "PublicKeyCredential JSON from the browser"),
    responses(
        (status = 200, description = "Assertion accepted"),
        (status = 410, description = "No live authentication challenge", body = crate::error::ErrorBody),
        (status = 422, description = "Signature or counter check failed", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn finish_authentication(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<AuthenticationOutcome>, ApiError> {
    let Json(response) = payload?;
    let outcome = state
        .engine
        .webauthn
        .finish_authentication(user_id, &response)
        .await?;
    Ok(Json(outcome))
}

/// List the user's credentials
#[utoipa::path(
    get,
    path = "/v1/webauthn/credentials",
    tag = "WebAuthn",
    responses((status = 200, description = "Credentials, oldest first")),
    security(("service_token" = []))
)]
pub async fn list_credentials(
    State(state): State<AppState>,
    Subject(user_id): Subject,
) -> Result<Json<Vec<CredentialSummary>>, ApiError> {
    Ok(Json(state.engine.webauthn.list_credentials(user_id).await?))
}

/// Revoke one credential
#[utoipa::path(
    delete,
    path = "/v1/webauthn/credentials/{id}",
    tag = "WebAuthn",
    params(("id" = String, Path, description = "Base64url credential id")),
    responses(
        (status = 200, description = "Credential removed; body holds the updated verification state"),
        (status = 404, description = "Credential not found for this user", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn revoke_credential(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<UserVerificationState>, ApiError> {
    let Path(credential_id) = path?;
    let updated = state
        .engine
        .webauthn
        .revoke_credential(user_id, &credential_id)
        .await?;
    Ok(Json(updated))
}
