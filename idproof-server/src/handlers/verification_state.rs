use axum::{extract::State, Json};
use idproof_core::UserVerificationState;

use crate::auth::Subject;
use crate::error::ApiError;
use crate::state::AppState;

/// Current flags and trust level for the user
///
/// Users with no proofs get an all-false state at level NONE.
#[utoipa::path(
    get,
    path = "/v1/verification-state",
    tag = "Verification State",
    responses((status = 200, description = "phone/email/two-factor/identity flags and verification_level")),
    security(("service_token" = []))
)]
pub async fn verification_state(
    State(state): State<AppState>,
    Subject(user_id): Subject,
) -> Result<Json<UserVerificationState>, ApiError> {
    Ok(Json(state.engine.verification_state(user_id).await?))
}
