use thiserror::Error;

/// Errors the core distinguishes, per the error-kinds catalogued for the
/// matching loop, the controllers, and the committer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store operation failed: {0}")]
    Store(#[from] sqlx::Error),

    #[error("order {0} not found")]
    OrderNotFound(u64),

    #[error("user {0} not found")]
    UserNotFound(uuid::Uuid),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
