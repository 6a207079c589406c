use convoy_id::AllocId;
use convoy_structs::StructsError;
use thiserror::Error;

use crate::broker::BrokerError;

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by the scheduler drivers, the store and the workers.
///
/// Placement failures are not errors: they are recorded as metrics on the
/// evaluation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Plans kept getting rejected; the evaluation is failed.
    #[error("maximum attempts reached ({0})")]
    MaxAttempts(u32),

    #[error("allocation {0} not found")]
    AllocNotFound(AllocId),

    #[error("job {namespace}/{job_id} not found")]
    JobNotFound { namespace: String, job_id: String },

    #[error("invalid evaluation: {0}")]
    InvalidEval(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Structs(#[from] StructsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
