use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unreachable: {0}")]
    Connection(String),
}

impl CatalogError {
    /// Connectivity-class failures abort the remaining run; everything else
    /// is recovered per record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CatalogError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
