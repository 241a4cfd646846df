//! idproof Server Library - REST API components for identity verification
//!
//! This library exposes the server components for use in integration tests.
//! The main binary uses these same components.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod multipart;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod storage;
pub mod validation;

pub use auth::{ClientIp, Operator, Reviewer, Subject};
pub use config::Config;
pub use error::{ApiError, ErrorBody};
pub use openapi::ApiDoc;
pub use routes::{create_router, create_router_with_config};
pub use state::{AppState, StartupError};
pub use storage::{PostgresCounterStore, PostgresRepository, Storage};
