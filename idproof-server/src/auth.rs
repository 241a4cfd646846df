//! Caller authentication and subject extraction
//!
//! The API sits behind a host application. The host proves itself with a
//! shared bearer token and names the end user in `X-User-Id`; reviewer
//! endpoints name the operator in `X-Reviewer-Id`.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const REVIEWER_ID_HEADER: &str = "x-reviewer-id";

/// Extract the Bearer token from the Authorization header
fn extract_bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    let auth_header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| ApiError::auth_error("AUTH_MISSING_TOKEN", "Missing Authorization header"))?;

    let auth_value = auth_header.to_str().map_err(|_| {
        ApiError::auth_error("AUTH_INVALID_TOKEN", "Invalid Authorization header encoding")
    })?;

    auth_value.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::auth_error(
            "AUTH_INVALID_TOKEN",
            "Authorization header must use Bearer scheme",
        )
    })
}

/// Check the caller's token against the configured service token.
pub fn authorize_caller(parts: &Parts, state: &AppState) -> Result<(), ApiError> {
    let Some(expected) = state.service_token.as_deref() else {
        return Ok(());
    };

    let token = extract_bearer_token(parts)?;
    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::auth_error("AUTH_INVALID_TOKEN", "Invalid service token"))
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, ApiError> {
    let value = parts
        .headers
        .get(name)
        .ok_or_else(|| ApiError::bad_request(format!("Missing {name} header")))?
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("Invalid {name} header encoding")))?
        .trim();

    if value.is_empty() {
        return Err(ApiError::bad_request(format!("Empty {name} header")));
    }
    Ok(value)
}

/// The end user a request acts on. Requires an authorized caller.
#[derive(Debug, Clone, Copy)]
pub struct Subject(pub Uuid);

impl FromRequestParts<AppState> for Subject {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize_caller(parts, state)?;

        let raw = header_value(parts, USER_ID_HEADER)?;
        let user_id = Uuid::parse_str(raw)
            .map_err(|_| ApiError::bad_request(format!("{USER_ID_HEADER} must be a UUID")))?;
        Ok(Subject(user_id))
    }
}

/// An authorized caller acting on no particular user.
#[derive(Debug, Clone, Copy)]
pub struct Operator;

impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize_caller(parts, state)?;
        Ok(Operator)
    }
}

/// The operator deciding a review. Requires an authorized caller.
#[derive(Debug, Clone)]
pub struct Reviewer(pub String);

impl FromRequestParts<AppState> for Reviewer {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize_caller(parts, state)?;

        let reviewer = header_value(parts, REVIEWER_ID_HEADER)?;
        if reviewer.len() > 128 {
            return Err(ApiError::bad_request(format!(
                "{REVIEWER_ID_HEADER} must be at most 128 characters"
            )));
        }
        Ok(Reviewer(reviewer.to_string()))
    }
}

/// Best-effort client address, used as an extra rate-limit dimension.
///
/// The socket peer, or the first `X-Forwarded-For` hop when the deployment
/// trusts its proxy to set that header.
#[derive(Debug, Clone, Default)]
pub struct ClientIp(pub Option<String>);

fn forwarded_for(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let forwarded = state
            .trust_forwarded_for
            .then(|| forwarded_for(parts))
            .flatten();

        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });

        Ok(ClientIp(ip))
    }
}
