//! OpenAPI documentation configuration
//!
//! Generates the OpenAPI 3 document served at `/api-docs/openapi.json`.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::error::ErrorBody;
use crate::handlers::{
    AttemptResponse, AuthenticatorCodeRequest, BackupCodesResponse, DecisionRequest,
    HealthResponse, InitiateOtpRequest, ReadyResponse, ResendOtpRequest,
    SetupAuthenticatorRequest, StartRegistrationRequest, VerifyOtpRequest,
};

/// Registers the bearer scheme the host presents on every `/v1` call.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "service_token",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// idproof API - OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "idproof - Identity Verification API",
        version = "0.1.0",
        description = r#"
## Identity and multi-factor verification

Proves facts about a user and folds them into one trust level:

- **One-time codes** to a phone number or email address
- **Authenticator apps** (TOTP) with single-use backup codes
- **Security keys and passkeys** (WebAuthn)
- **Identity documents**, routed on classifier confidence with manual review in between

### Calling the API

The host application authenticates with `Authorization: Bearer <service token>`
and names the end user in `X-User-Id`. Review endpoints name the operator in
`X-Reviewer-Id`.

### Levels

`NONE` < `EMAIL` < `PHONE` < `IDENTITY` (approved document) < `IDENTITY_2FA`
(approved document plus a second factor).
"#,
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    tags(
        (name = "OTP", description = "One-time codes sent to a phone or email"),
        (name = "Authenticator", description = "TOTP enrollment, verification and backup codes"),
        (name = "WebAuthn", description = "Security key and passkey ceremonies"),
        (name = "Documents", description = "Identity document submission and routing"),
        (name = "Review", description = "Manual review queue for borderline documents"),
        (name = "Verification State", description = "Aggregated verification flags and level"),
        (name = "Health", description = "Service health and readiness endpoints")
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::health::ready,
        crate::handlers::otp::initiate_otp,
        crate::handlers::otp::verify_otp,
        crate::handlers::otp::resend_otp,
        crate::handlers::authenticator::setup_authenticator,
        crate::handlers::authenticator::confirm_authenticator,
        crate::handlers::authenticator::verify_authenticator,
        crate::handlers::authenticator::regenerate_backup_codes,
        crate::handlers::authenticator::disable_authenticator,
        crate::handlers::webauthn::start_registration,
        crate::handlers::webauthn::finish_registration,
        crate::handlers::webauthn::start_authentication,
        crate::handlers::webauthn::finish_authentication,
        crate::handlers::webauthn::list_credentials,
        crate::handlers::webauthn::revoke_credential,
        crate::handlers::documents::submit_document,
        crate::handlers::documents::latest_document,
        crate::handlers::documents::get_document,
        crate::handlers::reviews::list_pending_reviews,
        crate::handlers::reviews::decide_review,
        crate::handlers::reviews::review_history,
        crate::handlers::verification_state::verification_state,
    ),
    components(
        schemas(
            ErrorBody,
            HealthResponse,
            ReadyResponse,
            InitiateOtpRequest,
            VerifyOtpRequest,
            ResendOtpRequest,
            SetupAuthenticatorRequest,
            AuthenticatorCodeRequest,
            BackupCodesResponse,
            StartRegistrationRequest,
            AttemptResponse,
            DecisionRequest,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/v1/otp/initiate",
            "/v1/authenticator/backup-codes",
            "/v1/webauthn/credentials/{id}",
            "/v1/documents/{id}",
            "/v1/reviews/{id}/decision",
            "/v1/verification-state",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn test_openapi_declares_bearer_scheme() {
        let doc = ApiDoc::openapi();
        let components = doc.components.expect("components");
        assert!(components.security_schemes.contains_key("service_token"));
    }
}
