//! Error types for bucket management

use kvnode_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("Bucket already exists: {0}")]
    AlreadyExists(String),

    #[error("Bucket not found: {0}")]
    NotFound(String),

    #[error("Invalid bucket name: {0}")]
    InvalidName(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Run blocking filesystem work on the blocking pool
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub type Result<T> = std::result::Result<T, BucketError>;
