use thiserror::Error;

/// Sabha engine errors.
#[derive(Debug, Error)]
pub enum SabhaError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid state transition: expected '{expected}', got '{actual}'")]
    InvalidState { expected: String, actual: String },

    #[error("Capacity exceeded for {scope}: {current} of {limit} slots used")]
    CapacityExceeded {
        scope: String,
        current: i64,
        limit: i64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not permitted: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SabhaError {
    pub fn invalid_state(expected: &str, actual: &str) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
