use thiserror::Error;
use uuid::Uuid;

/// Failures raised by record storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum VerificationError {
    /// Malformed input. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Too many attempts, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The challenge is absent, expired, exhausted or already used; the caller must re-initiate.
    #[error("Challenge expired or already used")]
    ExpiredOrConsumedChallenge,

    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("Resubmission not allowed: {0}")]
    ResubmissionNotAllowed(String),

    #[error("Attempt {0} has already been decided")]
    ConflictingDecision(Uuid),

    #[error("Provider failure: {0}")]
    ProviderFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl VerificationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_proof(message: impl Into<String>) -> Self {
        Self::InvalidProof(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderFailure(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

pub type Result<T> = std::result::Result<T, VerificationError>;
