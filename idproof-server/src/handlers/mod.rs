//! HTTP request handlers
//!
//! This module contains all the request handlers for the API endpoints.

pub mod authenticator;
pub mod documents;
pub mod health;
pub mod otp;
pub mod reviews;
pub mod verification_state;
pub mod webauthn;

pub use crate::state::AppState;
pub use authenticator::{
    confirm_authenticator, disable_authenticator, regenerate_backup_codes, setup_authenticator,
    verify_authenticator, AuthenticatorCodeRequest, BackupCodesResponse, SetupAuthenticatorRequest,
};
pub use documents::{get_document, latest_document, submit_document, AttemptResponse};
pub use health::{health, ready, HealthResponse, ReadyResponse};
pub use otp::{
    initiate_otp, resend_otp, verify_otp, InitiateOtpRequest, ResendOtpRequest, VerifyOtpRequest,
};
pub use reviews::{decide_review, list_pending_reviews, review_history, DecisionRequest};
pub use verification_state::verification_state;
pub use webauthn::{
    finish_authentication, finish_registration, list_credentials, revoke_credential,
    start_authentication, start_registration, StartRegistrationRequest,
};
