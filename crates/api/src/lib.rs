//! Folio API Library
//!
//! HTTP surface for the Folio billing core and paid features.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod illustrations;
pub mod routes;
pub mod security;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
