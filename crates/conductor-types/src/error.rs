use thiserror::Error;

/// Errors produced while reading or writing a workflow document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("unsupported document format: '{0}' (expected .yaml, .yml or .json)")]
    UnsupportedFormat(String),

    #[error("invalid workflow: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from workflow store operations (used by the store trait in conductor-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("workflow not found")]
    NotFound,
}

impl From<DocumentError> for StoreError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::Io(e) => StoreError::Io(e.to_string()),
            other => StoreError::Document(other.to_string()),
        }
    }
}
