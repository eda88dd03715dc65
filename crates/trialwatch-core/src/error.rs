use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
    #[error("Keychain error: {0}")]
    Keychain(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Whether this error belongs to the pre-flight configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnsupportedBackend(_)
                | Self::CertificateNotFound(_)
                | Self::InvalidRule(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
