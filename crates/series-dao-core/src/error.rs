use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum QueryError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("spatial transform failed: {0}")]
    SpatialTransform(String),
    #[error("series not found: {0}")]
    SeriesNotFound(String),
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),
    #[error("store execution failed: {0}")]
    StoreExecution(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Internal,
    Database,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
            Self::Database => "database",
        }
    }
}

impl QueryError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidParameter(_) | Self::SpatialTransform(_) => ErrorCategory::Validation,
            Self::SeriesNotFound(_) => ErrorCategory::NotFound,
            Self::DataIntegrity(_) | Self::InvalidPath(_) => ErrorCategory::Internal,
            Self::StoreExecution(_) => ErrorCategory::Database,
        }
    }

    /// Whether the caller supplied the offending input (a 4xx-equivalent).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Validation | ErrorCategory::NotFound)
    }
}
