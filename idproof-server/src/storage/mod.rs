//! Storage backends for the engine
//!
//! - **PostgreSQL** when `DATABASE_URL` is set: proof records and rate-limit
//!   counters are shared by every instance and survive restarts.
//! - **In-memory** otherwise, for development and tests. Everything is lost on restart.
//!
//! Challenges always stay in process memory.

mod postgres;

pub use postgres::{PostgresCounterStore, PostgresRepository};

use std::sync::Arc;

use idproof_core::{CounterStore, MemoryCounterStore, MemoryRepository, Repository, StorageError};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

pub struct Storage {
    pub repository: Arc<dyn Repository>,
    pub counters: Arc<dyn CounterStore>,
    pool: Option<PgPool>,
}

impl Storage {
    /// Connect, run migrations and share one pool between records and counters.
    pub async fn with_postgres(database_url: &str, config: &Config) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        tracing::info!(
            max_connections = config.database_max_connections,
            "Connected to PostgreSQL and applied migrations"
        );

        Ok(Self {
            repository: Arc::new(PostgresRepository::new(pool.clone())),
            counters: Arc::new(PostgresCounterStore::new(pool.clone())),
            pool: Some(pool),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            repository: Arc::new(MemoryRepository::new()),
            counters: Arc::new(MemoryCounterStore::new()),
            pool: None,
        }
    }

    /// PostgreSQL if `database_url` is configured, otherwise in-memory.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        match config.database_url.as_deref() {
            Some(url) => Self::with_postgres(url, config).await,
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory storage - records will be lost on restart!");
                Ok(Self::in_memory())
            }
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.pool.is_some()
    }

    /// Check database health (always Ok for memory backend)
    pub async fn check_health(&self) -> Result<(), StorageError> {
        if let Some(pool) = &self.pool {
            sqlx::query("SELECT 1")
                .execute(pool)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("persistent", &self.is_persistent())
            .finish()
    }
}
