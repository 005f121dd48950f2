#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Folio Shared Types and Utilities
//!
//! This crate contains types, errors, and database helpers shared across the
//! Folio backend (API server, billing core and background worker).

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
