use unveil_messaging::{AccessDenied, ResolutionError};
use unveil_types::ScheduleStatus;
use uuid::Uuid;

/// Everything an engine operation can fail with. The HTTP layer maps each
/// variant to one status code.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("cannot move scheduled message from {from} to {to}")]
    InvalidTransition { from: ScheduleStatus, to: ScheduleStatus },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    TrackingGap(#[from] TrackingGap),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }
}

/// Run synchronous storage work on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("blocking task failed: {}", e)))?
}

/// Delivery rows for a message that already exists could not be written.
/// The message stands; its recipients are untracked until repaired.
#[derive(Debug, thiserror::Error)]
#[error("delivery rows for message {message_id} were not written: {source:#}")]
pub struct TrackingGap {
    pub message_id: Uuid,
    #[source]
    pub source: anyhow::Error,
}
