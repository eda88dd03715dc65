use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Dashboard,
    Tunnel,
    Monitor,
    Browser,
}

impl ServiceKind {
    /// Required services bring the whole supervisor down when they exit.
    pub fn is_required(self) -> bool {
        !matches!(self, Self::Browser)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dashboard => "dashboard",
            Self::Tunnel => "tunnel",
            Self::Monitor => "monitor",
            Self::Browser => "browser",
        };
        f.write_str(name)
    }
}

/// How a service is identified at the OS or runtime level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceIdentity {
    /// A child process.
    Process { pid: u32 },
    /// An in-process task (tunnel forwarder, monitor loop).
    Task { id: Uuid },
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { pid } => write!(f, "pid {}", pid),
            Self::Task { id } => write!(f, "task {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub kind: ServiceKind,
    pub identity: ServiceIdentity,
    pub started_at: DateTime<Utc>,
}

impl ServiceHandle {
    pub fn process(kind: ServiceKind, pid: u32) -> Self {
        Self {
            kind,
            identity: ServiceIdentity::Process { pid },
            started_at: Utc::now(),
        }
    }

    pub fn task(kind: ServiceKind) -> Self {
        Self {
            kind,
            identity: ServiceIdentity::Task { id: Uuid::new_v4() },
            started_at: Utc::now(),
        }
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.identity)
    }
}
