//! Fixed-window rate limiting per `(scope, operation)`.
//!
//! Counters live behind [`CounterStore`] so a multi-instance deployment can
//! share them through the database while tests and single nodes stay in memory.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::error::{Result, StorageError, VerificationError};

/// Count within the current window and when that window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u32,
    pub resets_at: DateTime<Utc>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to `key`, opening a fresh window if the previous one closed.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<WindowCount, StorageError>;

    /// Current count without changing it. `None` if no open window exists.
    async fn peek(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<WindowCount>, StorageError>;

    async fn reset(&self, key: &str) -> std::result::Result<(), StorageError>;

    /// Drop closed windows. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> std::result::Result<usize, StorageError>;
}

#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowCount>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<WindowCount, StorageError> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(WindowCount {
                count: 0,
                resets_at: now + window,
            });
        if entry.resets_at <= now {
            *entry = WindowCount {
                count: 0,
                resets_at: now + window,
            };
        }
        entry.count = entry.count.saturating_add(1);
        Ok(*entry)
    }

    async fn peek(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<WindowCount>, StorageError> {
        Ok(self
            .counters
            .get(key)
            .map(|entry| *entry.value())
            .filter(|window| window.resets_at > now))
    }

    async fn reset(&self, key: &str) -> std::result::Result<(), StorageError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> std::result::Result<usize, StorageError> {
        let before = self.counters.len();
        self.counters.retain(|_, window| window.resets_at > now);
        Ok(before.saturating_sub(self.counters.len()))
    }
}

/// Operations subject to limiting. The name becomes part of the counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    InitiateOtp,
    VerifyOtp,
    VerifyAuthenticator,
    ConfirmAuthenticator,
    FinishWebAuthnAuthentication,
    SubmitDocument,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::InitiateOtp => "initiate_otp",
            Operation::VerifyOtp => "verify_otp",
            Operation::VerifyAuthenticator => "verify_authenticator",
            Operation::ConfirmAuthenticator => "confirm_authenticator",
            Operation::FinishWebAuthnAuthentication => "finish_webauthn_authentication",
            Operation::SubmitDocument => "submit_identity_document",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window: Duration,
    /// Cap on calls that open new work (initiations, submissions).
    pub max_initiations: u32,
    /// Cap on failed proofs before the scope is locked out for the window.
    pub max_failures: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::seconds(900),
            max_initiations: 5,
            max_failures: 10,
        }
    }
}

pub struct RateLimiter {
    store: std::sync::Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: std::sync::Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn key(op: Operation, scope: &str) -> String {
        format!("{}:{}", op.as_str(), scope)
    }

    fn retry_after(window: &WindowCount, now: DateTime<Utc>) -> u64 {
        (window.resets_at - now).num_seconds().max(1) as u64
    }

    /// Count one call to `op` for `scope`, refusing once the window is full.
    pub async fn check_and_count(
        &self,
        op: Operation,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let window = self
            .store
            .increment(&Self::key(op, scope), self.policy.window, now)
            .await?;
        if window.count > self.policy.max_initiations {
            tracing::warn!(operation = op.as_str(), "Rate limit reached");
            return Err(VerificationError::RateLimited {
                retry_after_secs: Self::retry_after(&window, now),
            });
        }
        Ok(())
    }

    /// Count one call against every scope, but only once none of them is full.
    ///
    /// A call refused on one scope leaves the counters of the others untouched.
    pub async fn check_and_count_all(
        &self,
        op: Operation,
        scopes: &[&str],
        now: DateTime<Utc>,
    ) -> Result<()> {
        for scope in scopes {
            if let Some(window) = self.store.peek(&Self::key(op, scope), now).await? {
                if window.count >= self.policy.max_initiations {
                    tracing::warn!(operation = op.as_str(), "Rate limit reached");
                    return Err(VerificationError::RateLimited {
                        retry_after_secs: Self::retry_after(&window, now),
                    });
                }
            }
        }
        for scope in scopes {
            self.check_and_count(op, scope, now).await?;
        }
        Ok(())
    }

    /// Refuse if `scope` has already used up its failures for `op`.
    pub async fn ensure_allowed(
        &self,
        op: Operation,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = format!("{}:failures", Self::key(op, scope));
        if let Some(window) = self.store.peek(&key, now).await? {
            if window.count >= self.policy.max_failures {
                tracing::warn!(operation = op.as_str(), "Failure limit reached");
                return Err(VerificationError::RateLimited {
                    retry_after_secs: Self::retry_after(&window, now),
                });
            }
        }
        Ok(())
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.purge_expired(now).await?)
    }

    /// Record one failed proof against `scope`.
    pub async fn record_failure(
        &self,
        op: Operation,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = format!("{}:failures", Self::key(op, scope));
        self.store.increment(&key, self.policy.window, now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn limiter(max_initiations: u32, max_failures: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            RateLimitPolicy {
                window: Duration::seconds(60),
                max_initiations,
                max_failures,
            },
        )
    }

    #[tokio::test]
    async fn test_initiations_capped_within_window() {
        let limiter = limiter(2, 10);
        limiter.check_and_count(Operation::InitiateOtp, "u1", t0()).await.unwrap();
        limiter.check_and_count(Operation::InitiateOtp, "u1", t0()).await.unwrap();
        let err = limiter
            .check_and_count(Operation::InitiateOtp, "u1", t0() + Duration::seconds(10))
            .await
            .unwrap_err();
        match err {
            VerificationError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 50),
            other => panic!("unexpected {other:?}"),
        }
        // Different scope is independent.
        limiter.check_and_count(Operation::InitiateOtp, "u2", t0()).await.unwrap();
    }

    #[tokio::test]
    async fn test_refusal_on_one_scope_spares_the_other() {
        let limiter = limiter(2, 10);
        limiter.check_and_count(Operation::InitiateOtp, "ip:10.0.0.1", t0()).await.unwrap();
        limiter.check_and_count(Operation::InitiateOtp, "ip:10.0.0.1", t0()).await.unwrap();

        for _ in 0..3 {
            assert!(matches!(
                limiter
                    .check_and_count_all(Operation::InitiateOtp, &["u1", "ip:10.0.0.1"], t0())
                    .await,
                Err(VerificationError::RateLimited { .. })
            ));
        }

        let store = &limiter.store;
        assert!(store.peek("initiate_otp:u1", t0()).await.unwrap().is_none());
        limiter
            .check_and_count_all(Operation::InitiateOtp, &["u1", "ip:10.0.0.2"], t0())
            .await
            .unwrap();
        assert_eq!(
            store.peek("initiate_otp:u1", t0()).await.unwrap().unwrap().count,
            1
        );
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = limiter(1, 10);
        limiter.check_and_count(Operation::SubmitDocument, "u1", t0()).await.unwrap();
        assert!(limiter
            .check_and_count(Operation::SubmitDocument, "u1", t0())
            .await
            .is_err());
        limiter
            .check_and_count(Operation::SubmitDocument, "u1", t0() + Duration::seconds(61))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failures_lock_out_scope() {
        let limiter = limiter(5, 2);
        limiter.ensure_allowed(Operation::VerifyOtp, "u1", t0()).await.unwrap();
        limiter.record_failure(Operation::VerifyOtp, "u1", t0()).await.unwrap();
        limiter.ensure_allowed(Operation::VerifyOtp, "u1", t0()).await.unwrap();
        limiter.record_failure(Operation::VerifyOtp, "u1", t0()).await.unwrap();
        assert!(matches!(
            limiter.ensure_allowed(Operation::VerifyOtp, "u1", t0()).await,
            Err(VerificationError::RateLimited { .. })
        ));
        // Other operations unaffected.
        limiter
            .ensure_allowed(Operation::VerifyAuthenticator, "u1", t0())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_cleanup() {
        let store = MemoryCounterStore::new();
        store.increment("k", Duration::seconds(5), t0()).await.unwrap();
        store.increment("other", Duration::seconds(60), t0()).await.unwrap();
        let removed = store.purge_expired(t0() + Duration::seconds(6)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.peek("k", t0()).await.unwrap().is_none());
        assert!(store.peek("other", t0()).await.unwrap().is_some());
    }
}
