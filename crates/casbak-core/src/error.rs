use thiserror::Error;

pub type Result<T> = std::result::Result<T, CasbakError>;

#[derive(Debug, Error)]
pub enum CasbakError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance is already running (lock: {0})")]
    Locked(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("manifest error: {0}")]
    Manifest(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
