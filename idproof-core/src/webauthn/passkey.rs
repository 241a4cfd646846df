//! Production ceremony verifier backed by `webauthn-rs`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;
use webauthn_rs::prelude::*;

use super::{
    AuthenticationChallenge, CeremonyVerifier, RegistrationChallenge, VerifiedAssertion,
    VerifiedRegistration,
};
use crate::error::{Result, StorageError, VerificationError};
use crate::repository::WebAuthnCredential;
use crate::types::UserId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid origin URL: {0}")]
    InvalidOrigin(String),
    #[error("WebAuthn error: {0:?}")]
    Webauthn(WebauthnError),
}

/// Relying party wrapper. Origin, challenge and signature checks all happen
/// inside `webauthn-rs`.
pub struct PasskeyVerifier {
    webauthn: Webauthn,
}

impl PasskeyVerifier {
    pub fn new(rp_id: &str, rp_origin: &Url, rp_name: &str) -> std::result::Result<Self, WebauthnError> {
        let builder = WebauthnBuilder::new(rp_id, rp_origin)?
            .rp_name(rp_name)
            .allow_subdomains(false);

        Ok(Self {
            webauthn: builder.build()?,
        })
    }

    /// Environment variables:
    /// - `WEBAUTHN_RP_ID` (default: "localhost")
    /// - `WEBAUTHN_RP_ORIGIN` (default: "http://localhost:3000")
    /// - `WEBAUTHN_RP_NAME` (default: "idproof")
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let rp_id = std::env::var("WEBAUTHN_RP_ID").unwrap_or_else(|_| "localhost".to_string());
        let rp_origin = std::env::var("WEBAUTHN_RP_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());
        let rp_name = std::env::var("WEBAUTHN_RP_NAME").unwrap_or_else(|_| "idproof".to_string());

        let origin = Url::parse(&rp_origin).map_err(|e| ConfigError::InvalidOrigin(e.to_string()))?;

        Self::new(&rp_id, &origin, &rp_name).map_err(ConfigError::Webauthn)
    }

    pub fn webauthn(&self) -> &Webauthn {
        &self.webauthn
    }
}

impl std::fmt::Debug for PasskeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasskeyVerifier")
            .field("webauthn", &"<Webauthn instance>")
            .finish()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| StorageError::Serialization(e.to_string()).into())
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

fn encode_state<T: Serialize>(state: &T) -> Result<String> {
    serde_json::to_string(state).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

fn decode_state<T: DeserializeOwned>(state: &str) -> Result<T> {
    serde_json::from_str(state).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

fn parse_response<T: DeserializeOwned>(response: &serde_json::Value) -> Result<T> {
    serde_json::from_value(response.clone())
        .map_err(|e| VerificationError::validation(format!("malformed authenticator response: {e}")))
}

fn encode_credential_id(id: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(id)
}

/// Signature counter recorded inside a serialized passkey.
fn stored_counter(passkey: &serde_json::Value) -> u32 {
    passkey
        .pointer("/cred/counter")
        .and_then(serde_json::Value::as_u64)
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(0)
}

impl CeremonyVerifier for PasskeyVerifier {
    fn start_registration(
        &self,
        user_id: UserId,
        user_name: &str,
        exclude: &[String],
    ) -> Result<RegistrationChallenge> {
        let exclude: Vec<CredentialID> = exclude
            .iter()
            .filter_map(|id| URL_SAFE_NO_PAD.decode(id).ok())
            .map(CredentialID::from)
            .collect();
        let exclude = (!exclude.is_empty()).then_some(exclude);

        let (ccr, reg_state) = self
            .webauthn
            .start_passkey_registration(user_id, user_name, user_name, exclude)
            .map_err(|e| VerificationError::provider(format!("failed to start registration: {e:?}")))?;

        Ok(RegistrationChallenge {
            options: to_json(&ccr)?,
            state: encode_state(&reg_state)?,
        })
    }

    fn finish_registration(
        &self,
        response: &serde_json::Value,
        state: &str,
    ) -> Result<VerifiedRegistration> {
        let credential: RegisterPublicKeyCredential = parse_response(response)?;
        let reg_state: PasskeyRegistration = decode_state(state)?;

        let passkey = self
            .webauthn
            .finish_passkey_registration(&credential, &reg_state)
            .map_err(|e| VerificationError::invalid_proof(format!("registration failed: {e:?}")))?;

        let public_key = to_json(&passkey)?;
        Ok(VerifiedRegistration {
            credential_id: encode_credential_id(passkey.cred_id()),
            sign_count: stored_counter(&public_key),
            public_key,
        })
    }

    fn start_authentication(
        &self,
        credentials: &[WebAuthnCredential],
    ) -> Result<AuthenticationChallenge> {
        let passkeys = credentials
            .iter()
            .map(|c| from_json::<Passkey>(c.public_key.clone()))
            .collect::<Result<Vec<_>>>()?;

        let (rcr, auth_state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| {
                VerificationError::provider(format!("failed to start authentication: {e:?}"))
            })?;

        Ok(AuthenticationChallenge {
            options: to_json(&rcr)?,
            state: encode_state(&auth_state)?,
        })
    }

    fn finish_authentication(
        &self,
        response: &serde_json::Value,
        state: &str,
        credential: &WebAuthnCredential,
    ) -> Result<VerifiedAssertion> {
        let assertion: PublicKeyCredential = parse_response(response)?;
        let auth_state: PasskeyAuthentication = decode_state(state)?;

        let result = self
            .webauthn
            .finish_passkey_authentication(&assertion, &auth_state)
            .map_err(|e| VerificationError::invalid_proof(format!("authentication failed: {e:?}")))?;

        let mut passkey: Passkey = from_json(credential.public_key.clone())?;
        passkey.update_credential(&result);

        Ok(VerifiedAssertion {
            credential_id: encode_credential_id(result.cred_id()),
            sign_count: result.counter(),
            public_key: to_json(&passkey)?,
        })
    }
}
