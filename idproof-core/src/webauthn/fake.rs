//! Deterministic stand-in for an authenticator.
//!
//! WARNING: performs no cryptography. A response is accepted when it echoes
//! the issued challenge and carries `"signature": "valid"`. Tests only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{json, Value};

use super::{
    AuthenticationChallenge, CeremonyVerifier, RegistrationChallenge, VerifiedAssertion,
    VerifiedRegistration,
};
use crate::error::{Result, VerificationError};
use crate::random;
use crate::repository::WebAuthnCredential;
use crate::types::UserId;

#[derive(Debug, Default)]
pub struct FakeCeremonyVerifier;

impl FakeCeremonyVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn registration_response(credential_id: &str, challenge: &str, sign_count: u32) -> Value {
        json!({
            "id": credential_id,
            "challenge": challenge,
            "signCount": sign_count,
            "signature": "valid",
        })
    }

    pub fn assertion_response(credential_id: &str, challenge: &str, sign_count: u32) -> Value {
        json!({
            "id": credential_id,
            "challenge": challenge,
            "signCount": sign_count,
            "signature": "valid",
        })
    }

    fn fresh_challenge() -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(random::bytes(16)?.as_slice()))
    }

    fn check(response: &Value, expected_challenge: &str) -> Result<(String, u32)> {
        let id = response["id"]
            .as_str()
            .ok_or_else(|| VerificationError::validation("malformed authenticator response"))?;
        if response["challenge"].as_str() != Some(expected_challenge) {
            return Err(VerificationError::invalid_proof("challenge mismatch"));
        }
        if response["signature"].as_str() != Some("valid") {
            return Err(VerificationError::invalid_proof("bad signature"));
        }
        let sign_count = response["signCount"]
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(0);
        Ok((id.to_string(), sign_count))
    }
}

impl CeremonyVerifier for FakeCeremonyVerifier {
    fn start_registration(
        &self,
        user_id: UserId,
        user_name: &str,
        exclude: &[String],
    ) -> Result<RegistrationChallenge> {
        let challenge = Self::fresh_challenge()?;
        Ok(RegistrationChallenge {
            options: json!({
                "challenge": challenge,
                "user": {"id": user_id, "name": user_name},
                "excludeCredentials": exclude,
            }),
            state: challenge,
        })
    }

    fn finish_registration(&self, response: &Value, state: &str) -> Result<VerifiedRegistration> {
        let (credential_id, sign_count) = Self::check(response, state)?;
        Ok(VerifiedRegistration {
            public_key: json!({"fake_key_for": credential_id}),
            credential_id,
            sign_count,
        })
    }

    fn start_authentication(
        &self,
        credentials: &[WebAuthnCredential],
    ) -> Result<AuthenticationChallenge> {
        let challenge = Self::fresh_challenge()?;
        let allowed: Vec<&str> = credentials.iter().map(|c| c.id.as_str()).collect();
        Ok(AuthenticationChallenge {
            options: json!({"challenge": challenge, "allowCredentials": allowed}),
            state: challenge,
        })
    }

    fn finish_authentication(
        &self,
        response: &Value,
        state: &str,
        credential: &WebAuthnCredential,
    ) -> Result<VerifiedAssertion> {
        let (credential_id, sign_count) = Self::check(response, state)?;
        Ok(VerifiedAssertion {
            credential_id,
            sign_count,
            public_key: credential.public_key.clone(),
        })
    }
}
