use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid media descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Sender not connected")]
    NotConnected,

    #[error("Receiver not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;
