//! Authenticator app (TOTP) handlers

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use idproof_core::{TotpConfirmation, TotpSetup, TotpVerification, UserVerificationState};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Subject;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SetupAuthenticatorRequest {
    /// Account name shown in the authenticator app (defaults to the user id)
    #[schema(example = "alice@example.com")]
    pub account_label: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthenticatorCodeRequest {
    /// Current TOTP code, or a backup code where accepted
    #[schema(example = "287082")]
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BackupCodesResponse {
    /// Shown once; only hashes are stored
    pub backup_codes: Vec<String>,
}

/// Start authenticator enrollment
///
/// Returns the otpauth URI, a QR code data URI and fresh backup codes. The
/// credential stays pending until confirmed with a valid code.
#[utoipa::path(
    post,
    path = "/v1/authenticator/setup",
    tag = "Authenticator",
    request_body = SetupAuthenticatorRequest,
    responses(
        (status = 200, description = "Provisioning payload and backup codes"),
        (status = 400, description = "An authenticator is already confirmed", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn setup_authenticator(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Option<Json<SetupAuthenticatorRequest>>,
) -> Result<Json<TotpSetup>, ApiError> {
    let req = payload.map(|Json(r)| r).unwrap_or_default();
    let setup = state
        .engine
        .totp
        .setup(user_id, req.account_label.as_deref())
        .await?;
    Ok(Json(setup))
}

/// Confirm enrollment with a first valid code
#[utoipa::path(
    post,
    path = "/v1/authenticator/confirm",
    tag = "Authenticator",
    request_body = AuthenticatorCodeRequest,
    responses(
        (status = 200, description = "Authenticator enabled; backup codes returned on first confirmation"),
        (status = 422, description = "Code mismatch", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn confirm_authenticator(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<AuthenticatorCodeRequest>, JsonRejection>,
) -> Result<Json<TotpConfirmation>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.engine.totp.confirm(user_id, &req.code).await?))
}

/// Check a TOTP or backup code
#[utoipa::path(
    post,
    path = "/v1/authenticator/verify",
    tag = "Authenticator",
    request_body = AuthenticatorCodeRequest,
    responses(
        (status = 200, description = "Code accepted; reports which method matched and backup codes left"),
        (status = 404, description = "No confirmed authenticator", body = crate::error::ErrorBody),
        (status = 422, description = "Code mismatch or replay", body = crate::error::ErrorBody),
        (status = 429, description = "Too many failures", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn verify_authenticator(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<AuthenticatorCodeRequest>, JsonRejection>,
) -> Result<Json<TotpVerification>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.engine.totp.verify(user_id, &req.code).await?))
}

/// Replace all backup codes
///
/// Requires a current TOTP code. Previous backup codes stop working.
#[utoipa::path(
    post,
    path = "/v1/authenticator/backup-codes",
    tag = "Authenticator",
    request_body = AuthenticatorCodeRequest,
    responses(
        (status = 200, description = "New backup codes", body = BackupCodesResponse),
        (status = 422, description = "Code mismatch", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<AuthenticatorCodeRequest>, JsonRejection>,
) -> Result<Json<BackupCodesResponse>, ApiError> {
    let Json(req) = payload?;
    let backup_codes = state
        .engine
        .totp
        .regenerate_backup_codes(user_id, &req.code)
        .await?;
    Ok(Json(BackupCodesResponse { backup_codes }))
}

/// Remove the authenticator
///
/// Callers should gate this behind a `DISABLE` one-time code.
#[utoipa::path(
    delete,
    path = "/v1/authenticator",
    tag = "Authenticator",
    responses(
        (status = 200, description = "Authenticator removed; body holds the updated verification state"),
        (status = 404, description = "No authenticator", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn disable_authenticator(
    State(state): State<AppState>,
    Subject(user_id): Subject,
) -> Result<Json<UserVerificationState>, ApiError> {
    Ok(Json(state.engine.totp.disable(user_id).await?))
}
