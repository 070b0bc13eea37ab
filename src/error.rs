use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("detector '{algorithm}' failed: {message}")]
    Detector { algorithm: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("shared state lock poisoned")]
    StatePoisoned,
}

impl AnalysisError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Configuration errors are reported to the caller before anything is queued.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AnalysisError::UnknownAlgorithm(_) | AnalysisError::InvalidValue { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for AnalysisError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        AnalysisError::StatePoisoned
    }
}
