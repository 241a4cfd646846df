//! Identity document handlers
//!
//! Handles POST /v1/documents submissions and attempt lookups.

use std::str::FromStr;

use axum::{
    extract::{rejection::PathRejection, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use idproof_core::{
    DocumentAnalysisResult, DocumentSubmission, DocumentType, IdentityVerificationAttempt,
    SubmissionOutcome,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::Subject;
use crate::error::ApiError;
use crate::multipart::MultipartFields;
use crate::state::AppState;

/// An attempt with its classifier analysis, if one was stored
#[derive(Debug, Serialize, ToSchema)]
pub struct AttemptResponse {
    #[schema(value_type = Object)]
    pub attempt: IdentityVerificationAttempt,
    #[schema(value_type = Option<Object>)]
    pub analysis: Option<DocumentAnalysisResult>,
}

/// Submit an identity document
///
/// Accepts multipart/form-data with:
/// - **document_type** (required): PASSPORT, DRIVERS_LICENSE, NATIONAL_ID or RESIDENCE_PERMIT
/// - **image** (required, repeatable): document images (JPEG, PNG, WebP or HEIC)
/// - **metadata** (optional): JSON object stored with the attempt
///
/// The attempt is routed on classifier confidence: at or above the high
/// threshold it is approved, below the low threshold rejected, anything
/// between goes to manual review.
#[utoipa::path(
    post,
    path = "/v1/documents",
    tag = "Documents",
    request_body(
        content_type = "multipart/form-data",
        description = "document_type, one or more image parts and optional metadata JSON"
    ),
    responses(
        (status = 201, description = "Attempt created and routed; body holds attempt, analysis and verification state"),
        (status = 400, description = "Missing or invalid field, image too large or unsupported", body = crate::error::ErrorBody),
        (status = 403, description = "Resubmission cap reached", body = crate::error::ErrorBody),
        (status = 429, description = "Too many submissions", body = crate::error::ErrorBody),
        (status = 503, description = "Classifier unavailable; the attempt stays SUBMITTED", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn submit_document(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmissionOutcome>), ApiError> {
    let documents = &state.engine.documents;
    let mut fields = MultipartFields::parse(&mut multipart, documents.limits()).await?;

    let document_type = DocumentType::from_str(fields.require_text("document_type")?)?;
    let metadata = match fields.get_json::<serde_json::Value>("metadata")? {
        None => serde_json::json!({}),
        Some(value) if value.is_object() => value,
        Some(_) => return Err(ApiError::bad_request("metadata must be a JSON object")),
    };
    let images = fields.take_images()?;

    tracing::debug!(
        user_id = %user_id,
        document_type = document_type.as_str(),
        images = images.len(),
        "Document submission received"
    );

    let outcome = documents
        .submit(
            user_id,
            DocumentSubmission {
                document_type,
                images,
                metadata,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// The user's most recent attempt
#[utoipa::path(
    get,
    path = "/v1/documents/latest",
    tag = "Documents",
    responses(
        (status = 200, description = "Latest attempt", body = AttemptResponse),
        (status = 404, description = "No attempts yet", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn latest_document(
    State(state): State<AppState>,
    Subject(user_id): Subject,
) -> Result<Json<AttemptResponse>, ApiError> {
    let attempt = state.engine.documents.latest_attempt(user_id).await?;
    let analysis = state.engine.documents.get_analysis(attempt.id).await?;
    Ok(Json(AttemptResponse { attempt, analysis }))
}

/// One attempt by id
///
/// Attempts belonging to other users are reported as not found.
#[utoipa::path(
    get,
    path = "/v1/documents/{id}",
    tag = "Documents",
    params(("id" = Uuid, Path, description = "Attempt id")),
    responses(
        (status = 200, description = "The attempt", body = AttemptResponse),
        (status = 404, description = "Attempt not found", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn get_document(
    State(state): State<AppState>,
    Subject(user_id): Subject,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<AttemptResponse>, ApiError> {
    let Path(attempt_id) = path?;
    let attempt = state.engine.documents.get_attempt(attempt_id).await?;
    if attempt.user_id != user_id {
        return Err(ApiError::not_found("attempt not found"));
    }
    let analysis = state.engine.documents.get_analysis(attempt.id).await?;
    Ok(Json(AttemptResponse { attempt, analysis }))
}
