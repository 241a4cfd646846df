//! Manual review queue handlers

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use idproof_core::{PendingReview, ReviewDecision, ReviewDecisionRecord, ReviewOutcome};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{Operator, Reviewer};
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PAGE: usize = 50;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PendingQuery {
    /// Maximum attempts to return (1-100, default 50)
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DecisionRequest {
    /// APPROVE or REJECT
    #[schema(value_type = String, example = "REJECT")]
    pub decision: ReviewDecision,
    /// Required justification, kept in the audit trail
    #[schema(example = "blurry photo")]
    pub notes: String,
}

/// Attempts awaiting a reviewer, oldest first
#[utoipa::path(
    get,
    path = "/v1/reviews",
    tag = "Review",
    params(PendingQuery),
    responses((status = 200, description = "Pending attempts, each with its analysis")),
    security(("service_token" = []))
)]
pub async fn list_pending_reviews(
    State(state): State<AppState>,
    _operator: Operator,
    query: Result<Query<PendingQuery>, QueryRejection>,
) -> Result<Json<Vec<PendingReview>>, ApiError> {
    let Query(query) = query?;
    let pending = state
        .engine
        .reviews
        .list_pending(query.limit.unwrap_or(DEFAULT_PAGE))
        .await?;
    Ok(Json(pending))
}

/// Decide an attempt
///
/// Only the first decision lands; later ones get 409.
#[utoipa::path(
    post,
    path = "/v1/reviews/{id}/decision",
    tag = "Review",
    params(
        ("id" = Uuid, Path, description = "Attempt id"),
        ("x-reviewer-id" = String, Header, description = "Operator making the decision")
    ),
    request_body = DecisionRequest,
    responses(
        (status = 200, description = "Decision recorded; body holds the attempt, audit record and verification state"),
        (status = 400, description = "Missing notes or reviewer", body = crate::error::ErrorBody),
        (status = 404, description = "Attempt not found", body = crate::error::ErrorBody),
        (status = 409, description = "Attempt already decided", body = crate::error::ErrorBody)
    ),
    security(("service_token" = []))
)]
pub async fn decide_review(
    State(state): State<AppState>,
    Reviewer(reviewer_id): Reviewer,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<DecisionRequest>, JsonRejection>,
) -> Result<Json<ReviewOutcome>, ApiError> {
    let Path(attempt_id) = path?;
    let Json(req) = payload?;
    let outcome = state
        .engine
        .reviews
        .override_decision(attempt_id, &reviewer_id, req.decision, &req.notes)
        .await?;
    Ok(Json(outcome))
}

/// Audit trail of decisions on an attempt
#[utoipa::path(
    get,
    path = "/v1/reviews/{id}/history",
    tag = "Review",
    params(("id" = Uuid, Path, description = "Attempt id")),
    responses((status = 200, description = "Decisions in the order they were made")),
    security(("service_token" = []))
)]
pub async fn review_history(
    State(state): State<AppState>,
    _operator: Operator,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Vec<ReviewDecisionRecord>>, ApiError> {
    let Path(attempt_id) = path?;
    Ok(Json(state.engine.reviews.history(attempt_id).await?))
}
