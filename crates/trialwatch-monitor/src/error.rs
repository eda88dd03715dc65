use thiserror::Error;
use trialwatch_core::TrialId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Unreachable(String),
    #[error("Version conflict on trial {trial}: expected version {expected}")]
    VersionConflict { trial: TrialId, expected: u64 },
    #[error("Malformed state '{state}' on trial {trial}")]
    MalformedState { trial: TrialId, state: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl StoreError {
    /// Errors that abandon the current poll cycle rather than a single trial.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::UnexpectedResponse(e.to_string())
        } else {
            Self::Unreachable(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
