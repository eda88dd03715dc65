use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// How the jump host's server key is verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Check ~/.ssh/known_hosts, recording unknown hosts on first use.
    #[default]
    AcceptNew,
    /// Accept any server key.
    Insecure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelAuth {
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
}

/// A local forward from `127.0.0.1:<local port>` to `remote_host:remote_port`
/// through a jump host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub jump_host: String,
    pub jump_port: u16,
    pub user: String,
    pub auth: TunnelAuth,
    pub remote_host: String,
    pub remote_port: u16,
    /// Candidate local ports. `None` lets the OS pick an ephemeral port.
    pub local_ports: Option<RangeInclusive<u16>>,
    pub host_key_policy: HostKeyPolicy,
}

impl TunnelSpec {
    pub fn new(jump_host: &str, user: &str, remote_host: &str, remote_port: u16) -> Self {
        Self {
            jump_host: jump_host.to_string(),
            jump_port: 22,
            user: user.to_string(),
            auth: TunnelAuth::default(),
            remote_host: remote_host.to_string(),
            remote_port,
            local_ports: None,
            host_key_policy: HostKeyPolicy::AcceptNew,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.jump_host.trim().is_empty() || self.user.trim().is_empty() {
            return Err(CoreError::Config(
                "both tunnel host and tunnel user must be specified".into(),
            ));
        }
        let remote = self.remote_host.trim();
        if remote.is_empty() || remote.eq_ignore_ascii_case("localhost") {
            return Err(CoreError::Config(
                "a tunnel needs the actual database host, not localhost".into(),
            ));
        }
        if let Some(range) = &self.local_ports {
            if range.is_empty() {
                return Err(CoreError::Config("local port range is empty".into()));
            }
        }
        Ok(())
    }

    pub fn description(&self) -> String {
        format!(
            "L 127.0.0.1 -> {}:{} via {}@{}:{}",
            self.remote_host, self.remote_port, self.user, self.jump_host, self.jump_port
        )
    }
}
