//! Error Handling Module
//!
//! This module defines the error taxonomy of the ingestion pipeline using the
//! `thiserror` crate. Every failure is returned to the immediate caller; nothing
//! here is retried internally.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DmarcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Size limit exceeded: {0}")]
    SizeExceeded(String),

    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Malformed field `{field}`: {detail}")]
    MalformedField { field: String, detail: String },

    #[error("Validation error: missing {0}")]
    Validation(String),

    #[error("Report not found: {0}")]
    NotFound(i64),
}

impl DmarcError {
    pub(crate) fn malformed(field: impl Into<String>, detail: impl ToString) -> Self {
        DmarcError::MalformedField {
            field: field.into(),
            detail: detail.to_string(),
        }
    }

    /// True for failures that concern a single attachment and should not stop a batch.
    pub fn is_item_failure(&self) -> bool {
        !matches!(self, DmarcError::Io(_) | DmarcError::Database(_))
    }
}

impl From<quick_xml::Error> for DmarcError {
    fn from(e: quick_xml::Error) -> Self {
        DmarcError::malformed("document", e)
    }
}

impl From<quick_xml::escape::EscapeError> for DmarcError {
    fn from(e: quick_xml::escape::EscapeError) -> Self {
        DmarcError::malformed("document", e)
    }
}

pub type Result<T> = std::result::Result<T, DmarcError>;
