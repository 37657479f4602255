use thiserror::Error;

/// Errors surfaced by the state store (spec §4.2, §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on state document: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to acquire state document lock: {0}")]
    Lock(String),

    #[error("failed to serialize state document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no state document found for feature {0:?}")]
    NotFound(String),

    #[error("task {0:?} not found in state document")]
    TaskNotFound(String),

    #[error("worker {0} not found in state document")]
    WorkerNotFound(u32),
}

pub type Result<T> = std::result::Result<T, StoreError>;
