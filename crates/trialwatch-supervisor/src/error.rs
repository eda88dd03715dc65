use std::time::Duration;
use thiserror::Error;
use trialwatch_core::models::ServiceKind;
use trialwatch_core::CoreError;
use trialwatch_ssh::SshError;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Port {0} is already in use")]
    PortInUse(u16),
    #[error("Failed to start {service}: {source}")]
    Spawn {
        service: ServiceKind,
        #[source]
        source: std::io::Error,
    },
    #[error("{service} not ready after {timeout:?}")]
    ReadinessTimeout {
        service: ServiceKind,
        timeout: Duration,
    },
    #[error("Tunnel failed: {0}")]
    Tunnel(#[from] SshError),
    #[error("{service} exited during startup with status {code}")]
    ServiceCrash { service: ServiceKind, code: i32 },
    /// Shutdown was requested before startup finished; everything already
    /// started has been stopped with `status`.
    #[error("Startup interrupted")]
    Interrupted { status: i32 },
}

impl SupervisorError {
    /// Errors caught before any service was started.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Process exit status for a failed launch.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ServiceCrash { code, .. } if *code != 0 => *code,
            Self::Interrupted { status } => *status,
            _ => 1,
        }
    }
}

impl From<CoreError> for SupervisorError {
    fn from(e: CoreError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
