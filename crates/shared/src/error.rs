//! Error types for Folio

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FolioError {
    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
