//! Shared identifiers and closed enums used across the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VerificationError;

pub type UserId = Uuid;
pub type ChallengeId = Uuid;

/// Why an OTP was requested. Each purpose carries its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Purpose {
    Login,
    Setup,
    Disable,
    SensitiveAction,
    PasswordReset,
}

/// Per-purpose knobs for OTP challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurposePolicy {
    /// Upper bound on attempts regardless of the configured default.
    pub max_attempts_cap: Option<u32>,
    /// Upper bound on challenge lifetime regardless of the configured default.
    pub ttl_cap_secs: Option<u64>,
    /// Whether a successful verification records the contact point as verified.
    pub marks_contact_verified: bool,
    /// Message body; `{code}` and `{minutes}` are substituted at send time.
    pub template: &'static str,
}

impl Purpose {
    pub fn policy(self) -> PurposePolicy {
        match self {
            Purpose::Login => PurposePolicy {
                max_attempts_cap: None,
                ttl_cap_secs: None,
                marks_contact_verified: true,
                template: "Your sign-in code is {code}. It expires in {minutes} minutes.",
            },
            Purpose::Setup => PurposePolicy {
                max_attempts_cap: None,
                ttl_cap_secs: None,
                marks_contact_verified: true,
                template: "Your verification code is {code}. It expires in {minutes} minutes.",
            },
            Purpose::Disable => PurposePolicy {
                max_attempts_cap: Some(3),
                ttl_cap_secs: Some(180),
                marks_contact_verified: false,
                template: "Use {code} to confirm turning off a security setting. Expires in {minutes} minutes.",
            },
            Purpose::SensitiveAction => PurposePolicy {
                max_attempts_cap: Some(3),
                ttl_cap_secs: Some(180),
                marks_contact_verified: false,
                template: "Use {code} to approve this action. Expires in {minutes} minutes.",
            },
            Purpose::PasswordReset => PurposePolicy {
                max_attempts_cap: Some(3),
                ttl_cap_secs: Some(180),
                marks_contact_verified: true,
                template: "Your password reset code is {code}. It expires in {minutes} minutes.",
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Login => "LOGIN",
            Purpose::Setup => "SETUP",
            Purpose::Disable => "DISABLE",
            Purpose::SensitiveAction => "SENSITIVE_ACTION",
            Purpose::PasswordReset => "PASSWORD_RESET",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOGIN" => Ok(Purpose::Login),
            "SETUP" => Ok(Purpose::Setup),
            "DISABLE" => Ok(Purpose::Disable),
            "SENSITIVE_ACTION" => Ok(Purpose::SensitiveAction),
            "PASSWORD_RESET" => Ok(Purpose::PasswordReset),
            other => Err(VerificationError::validation(format!(
                "unknown purpose: {other}"
            ))),
        }
    }
}

/// Delivery channel of an OTP, inferred from the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Phone,
    Email,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Phone => "PHONE",
            Channel::Email => "EMAIL",
        }
    }
}

impl FromStr for Channel {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PHONE" => Ok(Channel::Phone),
            "EMAIL" => Ok(Channel::Email),
            other => Err(VerificationError::validation(format!(
                "unknown channel: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeKind {
    Otp,
    WebAuthn,
}

/// What a challenge is for, within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengePurpose {
    Otp(Purpose),
    Registration,
    Authentication,
}

impl fmt::Display for ChallengePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengePurpose::Otp(p) => write!(f, "{p}"),
            ChallengePurpose::Registration => f.write_str("REGISTRATION"),
            ChallengePurpose::Authentication => f.write_str("AUTHENTICATION"),
        }
    }
}

/// Identifies the single live challenge slot `(subject, purpose, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChallengeKey {
    pub subject: UserId,
    pub purpose: ChallengePurpose,
    pub kind: ChallengeKind,
}

impl ChallengeKey {
    pub fn otp(subject: UserId, purpose: Purpose) -> Self {
        Self {
            subject,
            purpose: ChallengePurpose::Otp(purpose),
            kind: ChallengeKind::Otp,
        }
    }

    pub fn registration(subject: UserId) -> Self {
        Self {
            subject,
            purpose: ChallengePurpose::Registration,
            kind: ChallengeKind::WebAuthn,
        }
    }

    pub fn authentication(subject: UserId) -> Self {
        Self {
            subject,
            purpose: ChallengePurpose::Authentication,
            kind: ChallengeKind::WebAuthn,
        }
    }
}
