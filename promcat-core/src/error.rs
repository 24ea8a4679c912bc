use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("Refusing to update, duplicate value found at hostname `{hostname}`")]
    DuplicateConflict { hostname: String },

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        CatalogError::Validation {
            field,
            message: message.into(),
        }
    }

    /// True when the caller sent something the catalog refuses to store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CatalogError::Validation { .. }
                | CatalogError::DuplicateConflict { .. }
                | CatalogError::InvalidBody(_)
        )
    }

    /// True when the durable backing could not be read or written.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            CatalogError::Io(_) | CatalogError::Database(_) | CatalogError::Serialization(_)
        )
    }
}

impl From<tokio::task::JoinError> for CatalogError {
    fn from(err: tokio::task::JoinError) -> Self {
        CatalogError::Internal(err.to_string())
    }
}
