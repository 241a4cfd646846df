//! One-time code handlers
//!
//! Codes are sent to a phone number or email address and proven back within
//! their lifetime. Responses never include the code itself.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use idproof_core::{OtpInitiation, OtpVerification, Purpose};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::{ClientIp, Subject};
use crate::error::ApiError;
use crate::state::AppState;

/// Request a code for a destination
#[derive(Debug, Deserialize, ToSchema)]
pub struct InitiateOtpRequest {
    /// E.164 phone number or email address
    #[schema(example = "+15551234567")]
    pub destination: String,
    /// LOGIN, SETUP, DISABLE, SENSITIVE_ACTION or PASSWORD_RESET
    #[schema(value_type = String, example = "LOGIN")]
    pub purpose: Purpose,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyOtpRequest {
    #[schema(value_type = String, example = "LOGIN")]
    pub purpose: Purpose,
    #[schema(example = "482913")]
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResendOtpRequest {
    #[schema(value_type = String, example = "LOGIN")]
    pub purpose: Purpose,
}

/// Issue a one-time code
///
/// Replaces any pending code for the same purpose. The response reports
/// delivery separately: a failed send still leaves the challenge valid.
#[utoipa::path(
    post,
    path = "/v1/otp/initiate",
    tag = "OTP",
    request_body = InitiateOtpRequest,
    responses(
        (status = 200, description = "Challenge issued; body holds challenge_ref, expires_at and delivery status"),
        (status = 400, description = "Invalid destination or purpose", body = crate::error::ErrorBody),
        (status = 429, description = "Too many codes requested", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn initiate_otp(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    ClientIp(ip): ClientIp,
    payload: Result<Json<InitiateOtpRequest>, JsonRejection>,
) -> Result<Json<OtpInitiation>, ApiError> {
    let Json(req) = payload?;
    let issued = state
        .engine
        .otp
        .initiate(user_id, &req.destination, req.purpose, ip.as_deref())
        .await?;
    Ok(Json(issued))
}

/// Prove a one-time code
#[utoipa::path(
    post,
    path = "/v1/otp/verify",
    tag = "OTP",
    request_body = VerifyOtpRequest,
    responses(
        (status = 200, description = "Code accepted; body holds the updated verification state"),
        (status = 410, description = "No live challenge, request a new code", body = crate::error::ErrorBody),
        (status = 422, description = "Wrong code", body = crate::error::ErrorBody),
        (status = 429, description = "Too many failures", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn verify_otp(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<VerifyOtpRequest>, JsonRejection>,
) -> Result<Json<OtpVerification>, ApiError> {
    let Json(req) = payload?;
    let verified = state.engine.otp.verify(user_id, req.purpose, &req.code).await?;
    Ok(Json(verified))
}

/// Re-send the pending code unchanged
#[utoipa::path(
    post,
    path = "/v1/otp/resend",
    tag = "OTP",
    request_body = ResendOtpRequest,
    responses(
        (status = 200, description = "Delivery retried for the live challenge"),
        (status = 410, description = "No live challenge", body = crate::error::ErrorBody),
        (status = 429, description = "Too many codes requested", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn resend_otp(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    payload: Result<Json<ResendOtpRequest>, JsonRejection>,
) -> Result<Json<OtpInitiation>, ApiError> {
    let Json(req) = payload?;
    let resent = state.engine.otp.retry_dispatch(user_id, req.purpose).await?;
    Ok(Json(resent))
}
