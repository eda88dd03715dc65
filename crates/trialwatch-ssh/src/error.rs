use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Jump host unreachable: {0}")]
    Unreachable(String),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("No local port available: {0}")]
    NoLocalPort(String),
    #[error("Invalid tunnel: {0}")]
    InvalidSpec(String),
    #[error("Tunnel probe failed: {0}")]
    ProbeFailed(String),
    #[error("Key error: {0}")]
    Key(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SshError>;
