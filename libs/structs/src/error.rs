use thiserror::Error;

/// Errors raised while validating or decoding data-model values.
#[derive(Debug, Error)]
pub enum StructsError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("invalid allocation name: {0}")]
    InvalidAllocName(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StructsError>;
