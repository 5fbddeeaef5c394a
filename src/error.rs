use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvsError {
    #[error("key not found")]
    NotFound,

    #[error("key hash matches an existing entry with different key text")]
    AlreadyExists,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data loss: {0}")]
    DataLoss(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation not allowed in current state: {0}")]
    FailedPrecondition(&'static str),

    #[error("block device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, KvsError>;
