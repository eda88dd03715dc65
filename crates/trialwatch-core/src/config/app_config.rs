use crate::config::connection::{Backend, CertPolicy, ConnectionParams};
use crate::error::{CoreError, Result};
use crate::models::{
    HostKeyPolicy, MonitorConfig, RuleSet, StudySelector, TrialScope, TunnelAuth, TunnelSpec,
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub monitor: MonitorSection,
    pub dashboard: DashboardConfig,
    pub browser: BrowserConfig,
    pub supervisor: SupervisorConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMode {
    #[default]
    Auto,
    Use,
    Disable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub backend: Backend,
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
    pub user: String,
    pub password: String,
    pub cert_path: Option<PathBuf>,
    pub cert_mode: CertMode,
    pub require_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_secs: u64,
    pub prune_pattern: String,
    pub fail_pattern: String,
    pub studies: Vec<String>,
    pub dry_run: bool,
    pub all_trials: bool,
    pub mark_handled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub command: String,
    pub host: String,
    pub port: u16,
    pub readiness_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Open the dashboard in an app-mode window of `app_command`.
    pub app_mode: bool,
    pub app_command: String,
    /// Open the dashboard with this browser executable.
    pub path: Option<PathBuf>,
    /// Extra wait after the dashboard answers, before the browser starts.
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
    pub local_port_min: Option<u16>,
    pub local_port_max: Option<u16>,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let params = ConnectionParams::default();
        Self {
            url: None,
            backend: params.backend,
            host: params.host,
            port: None,
            name: params.name,
            user: params.user,
            password: "password".to_string(),
            cert_path: None,
            cert_mode: CertMode::Auto,
            require_tls: false,
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            prune_pattern: "PRUNE".to_string(),
            fail_pattern: "FAIL".to_string(),
            studies: Vec::new(),
            dry_run: false,
            all_trials: false,
            mark_handled: false,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            command: "optuna-dashboard".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            readiness_timeout_secs: 30,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            app_mode: false,
            app_command: "chromium".to_string(),
            path: None,
            settle_secs: 2,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: 22,
            key_path: None,
            password: None,
            local_port_min: None,
            local_port_max: None,
            host_key_policy: HostKeyPolicy::AcceptNew,
        }
    }
}

impl DatabaseConfig {
    pub fn connection_params(&self) -> ConnectionParams {
        let cert = match self.cert_mode {
            CertMode::Auto => CertPolicy::Auto,
            CertMode::Use => CertPolicy::Use(self.cert_path.clone()),
            CertMode::Disable => CertPolicy::Disable,
        };
        ConnectionParams {
            url: self.url.clone(),
            backend: self.backend,
            host: self.host.clone(),
            port: self.port,
            name: self.name.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            cert,
            require_tls: self.require_tls,
        }
    }
}

impl MonitorSection {
    pub fn to_monitor_config(&self) -> Result<MonitorConfig> {
        if self.interval_secs == 0 {
            return Err(CoreError::Config("poll interval must be at least 1 second".into()));
        }
        Ok(MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            rules: RuleSet::prune_then_fail(&self.prune_pattern, &self.fail_pattern)?,
            scope: if self.all_trials {
                TrialScope::AllTrials
            } else {
                TrialScope::ActiveOnly
            },
            studies: StudySelector::from_names(&self.studies),
            dry_run: self.dry_run,
            mark_handled: self.mark_handled,
        })
    }
}

impl TunnelConfig {
    pub fn is_configured(&self) -> bool {
        self.host.is_some() || self.user.is_some()
    }

    /// Build the tunnel spec towards `remote_host:remote_port`, or `None`
    /// when no tunnel is configured.
    pub fn to_spec(&self, remote_host: &str, remote_port: u16) -> Result<Option<TunnelSpec>> {
        if !self.is_configured() {
            return Ok(None);
        }
        let (Some(host), Some(user)) = (self.host.as_deref(), self.user.as_deref()) else {
            return Err(CoreError::Config(
                "both tunnel host and tunnel user must be specified".into(),
            ));
        };

        if self.key_path.is_some() && self.password.is_some() {
            tracing::warn!("Both SSH key and password specified, the key will be tried first");
        } else if self.key_path.is_none() && self.password.is_none() {
            tracing::warn!(
                "No SSH authentication method specified, default keys and the OS keychain will be used"
            );
        }

        let local_ports = match (self.local_port_min, self.local_port_max) {
            (Some(min), Some(max)) => Some(min..=max),
            (Some(min), None) => Some(min..=u16::MAX),
            (None, Some(max)) => Some(1024..=max),
            (None, None) => None,
        };

        let spec = TunnelSpec {
            jump_host: host.to_string(),
            jump_port: self.port,
            user: user.to_string(),
            auth: TunnelAuth {
                key_path: self.key_path.clone(),
                password: self.password.clone(),
            },
            remote_host: remote_host.to_string(),
            remote_port,
            local_ports,
            host_key_policy: self.host_key_policy,
        };
        spec.validate()?;
        Ok(Some(spec))
    }
}

impl AppConfig {
    /// Get the project directories for TrialWatch.
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("org", "trialwatch", "TrialWatch").ok_or_else(|| {
            CoreError::Config("Could not determine config directory".to_string())
        })
    }

    /// Get the config directory path.
    pub fn config_dir() -> PathBuf {
        match Self::project_dirs() {
            Ok(dirs) => dirs.config_dir().to_path_buf(),
            Err(_) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config").join("trialwatch")
            }
        }
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Certificate probed by the auto-detect policy.
    pub fn default_cert_path() -> PathBuf {
        Self::config_dir().join("cert").join("ca.pem")
    }

    /// Load config from disk, or create and save defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Load config from an explicit file. The file must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            CoreError::Config(format!("Failed to parse config at {}: {}", path.display(), e))
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            CoreError::Serialization(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        info!("Saved config to {}", path.display());

        Ok(())
    }

    pub fn dashboard_url(&self) -> String {
        format!("http://{}:{}", self.dashboard.host, self.dashboard.port)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.supervisor.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.monitor.studies = vec!["study-a".into()];
        config.dashboard.port = 9090;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.monitor.studies, vec!["study-a".to_string()]);
        assert_eq!(loaded.dashboard.port, 9090);
        assert_eq!(loaded.monitor.interval_secs, 10);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[monitor]\ninterval_secs = 3\n\n[database]\nbackend = \"mysql\"\ncert_mode = \"disable\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.monitor.interval_secs, 3);
        assert_eq!(config.monitor.prune_pattern, "PRUNE");
        assert_eq!(config.database.backend, Backend::Mysql);
        assert_eq!(config.database.connection_params().cert, CertPolicy::Disable);
        assert_eq!(config.dashboard.command, "optuna-dashboard");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor\n").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_monitor_section_builds_rules_in_order() {
        let section = MonitorSection {
            all_trials: true,
            studies: vec!["all".into()],
            ..Default::default()
        };
        let config = section.to_monitor_config().unwrap();
        assert_eq!(config.scope, TrialScope::AllTrials);
        assert_eq!(config.studies, StudySelector::All);
        assert_eq!(config.rules.rules().len(), 2);
        assert_eq!(config.rules.rules()[0].pattern, "PRUNE");

        let zero = MonitorSection {
            interval_secs: 0,
            ..Default::default()
        };
        assert!(zero.to_monitor_config().is_err());
    }

    #[test]
    fn test_tunnel_section_requires_both_host_and_user() {
        let tunnel = TunnelConfig {
            host: Some("jump.example.com".into()),
            ..Default::default()
        };
        assert!(tunnel.to_spec("db.internal", 5432).is_err());

        let tunnel = TunnelConfig {
            host: Some("jump.example.com".into()),
            user: Some("deploy".into()),
            local_port_min: Some(41000),
            local_port_max: Some(41010),
            ..Default::default()
        };
        let spec = tunnel.to_spec("db.internal", 5432).unwrap().unwrap();
        assert_eq!(spec.local_ports, Some(41000..=41010));
        assert_eq!(spec.jump_port, 22);

        assert!(TunnelConfig::default()
            .to_spec("db.internal", 5432)
            .unwrap()
            .is_none());
    }
}
