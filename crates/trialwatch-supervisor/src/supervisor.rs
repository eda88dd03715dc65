use crate::error::{Result, SupervisorError};
use crate::process;
use crate::service::{wait_exit, ServiceSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use trialwatch_core::config::{resolve, AppConfig, ConnectionDescriptor, ConnectionParams};
use trialwatch_core::models::{MonitorConfig, ServiceHandle, ServiceKind, TrialScope, TunnelSpec};
use trialwatch_monitor::{HttpStore, Monitor};
use trialwatch_ssh::{SshClient, TunnelManager};

#[derive(Debug, Clone)]
pub struct DashboardSpec {
    pub command: String,
    pub host: String,
    pub port: u16,
    pub readiness_timeout: Duration,
}

impl DashboardSpec {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct BrowserSpec {
    pub app_mode: bool,
    pub app_command: String,
    pub path: Option<PathBuf>,
    /// Wait after the dashboard answers, before the browser starts.
    pub settle: Duration,
}

impl BrowserSpec {
    pub fn validate(&self) -> Result<()> {
        if self.app_mode && self.path.is_some() {
            return Err(SupervisorError::Config(
                "app-mode and an explicit browser path cannot be used together".into(),
            ));
        }
        Ok(())
    }

    /// Program and arguments that open `url`, if a browser is wanted.
    pub fn command(&self, url: &str) -> Result<Option<(String, Vec<String>)>> {
        self.validate()?;
        if self.app_mode {
            Ok(Some((self.app_command.clone(), vec![format!("--app={}", url)])))
        } else if let Some(path) = &self.path {
            Ok(Some((path.display().to_string(), vec![url.to_string()])))
        } else {
            Ok(None)
        }
    }
}

/// Everything the supervisor needs to bring the system up.
#[derive(Clone)]
pub struct LaunchSpec {
    pub connection: ConnectionParams,
    pub default_cert: PathBuf,
    pub tunnel: Option<TunnelSpec>,
    pub dashboard: DashboardSpec,
    pub monitor: MonitorConfig,
    pub browser: BrowserSpec,
    pub grace_period: Duration,
}

impl LaunchSpec {
    /// Build a launch spec from merged configuration, checking the browser
    /// flags, the rules and the tunnel parameters in that order.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let browser = BrowserSpec {
            app_mode: config.browser.app_mode,
            app_command: config.browser.app_command.clone(),
            path: config.browser.path.clone(),
            settle: Duration::from_secs(config.browser.settle_secs),
        };
        browser.validate()?;

        let monitor = config.monitor.to_monitor_config()?;

        let connection = config.database.connection_params();
        let tunnel = if config.tunnel.is_configured() {
            if connection.url.is_some() {
                return Err(SupervisorError::Config(
                    "a database URL override cannot be combined with a tunnel".into(),
                ));
            }
            let remote_port = connection.effective_port()?;
            config.tunnel.to_spec(&connection.host, remote_port)?
        } else {
            None
        };

        Ok(Self {
            connection,
            default_cert: AppConfig::default_cert_path(),
            tunnel,
            dashboard: DashboardSpec {
                command: config.dashboard.command.clone(),
                host: config.dashboard.host.clone(),
                port: config.dashboard.port,
                readiness_timeout: Duration::from_secs(config.dashboard.readiness_timeout_secs),
            },
            monitor,
            browser,
            grace_period: config.grace_period(),
        })
    }

    /// Checks that must pass before anything is started. Returns the
    /// descriptor resolved against the remote store.
    fn preflight(&self) -> Result<ConnectionDescriptor> {
        self.browser.validate()?;
        if self.monitor.rules.is_empty() && !self.monitor.studies.is_empty() {
            return Err(SupervisorError::Config("no signal rules configured".into()));
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.validate()?;
        }
        Ok(resolve(&self.connection, &self.default_cert)?)
    }
}

pub struct Supervisor;

impl Supervisor {
    /// Start tunnel, dashboard, monitor and browser in dependency order.
    ///
    /// Configuration problems are reported before any service starts. If a
    /// later step fails, or `shutdown` resolves before startup is done,
    /// everything already started is stopped again.
    pub async fn launch<F>(spec: LaunchSpec, shutdown: F) -> Result<SupervisorHandle>
    where
        F: Future<Output = ()>,
    {
        let remote = spec.preflight()?;
        info!("Database: {}", remote.redacted());
        process::ensure_port_free(&spec.dashboard.host, spec.dashboard.port)?;

        let mut services = ServiceSet::new(spec.grace_period);
        let started = tokio::select! {
            result = Self::start_services(&spec, remote, &mut services) => Some(result),
            _ = shutdown => None,
        };

        match started {
            None => {
                info!("Shutdown requested during startup");
                let status = services.shutdown(0).await;
                Err(SupervisorError::Interrupted { status })
            }
            Some(Ok((descriptor, local_port))) => {
                let handle = SupervisorHandle {
                    services,
                    dashboard_url: spec.dashboard.url(),
                    descriptor,
                    local_port,
                };
                handle.log_banner(&spec);
                Ok(handle)
            }
            Some(Err(e)) => {
                warn!("Startup failed: {}", e);
                services.shutdown(0).await;
                Err(e)
            }
        }
    }

    async fn start_services(
        spec: &LaunchSpec,
        remote: ConnectionDescriptor,
        services: &mut ServiceSet,
    ) -> Result<(ConnectionDescriptor, Option<u16>)> {
        let (descriptor, local_port) = match &spec.tunnel {
            Some(tunnel_spec) => {
                let manager = TunnelManager::new(SshClient::new());
                let tunnel = manager.open(tunnel_spec).await?;
                let local_port = tunnel.local_port;
                services.add_tunnel(tunnel);
                let local = resolve(&spec.connection.via_local_port(local_port), &spec.default_cert)?;
                (local, Some(local_port))
            }
            None => (remote, None),
        };

        let dashboard = &spec.dashboard;
        let args = vec![
            descriptor.url.clone(),
            "--host".to_string(),
            dashboard.host.clone(),
            "--port".to_string(),
            dashboard.port.to_string(),
        ];
        services.spawn_process(ServiceKind::Dashboard, &dashboard.command, &args)?;
        Self::wait_until_ready(dashboard, services).await?;

        let store = HttpStore::new(&dashboard.url())
            .map_err(|e| SupervisorError::Config(e.to_string()))?;
        services.spawn_monitor(Monitor::new(Arc::new(store), spec.monitor.clone()));

        if let Some((program, args)) = spec.browser.command(&dashboard.url())? {
            tokio::time::sleep(spec.browser.settle).await;
            if let Err(e) = services.spawn_process(ServiceKind::Browser, &program, &args) {
                warn!("Browser not started: {}", e);
            }
        }

        Ok((descriptor, local_port))
    }

    /// Wait for the dashboard port to accept connections, bounded by the
    /// readiness timeout. A dashboard that exits meanwhile is a crash.
    async fn wait_until_ready(dashboard: &DashboardSpec, services: &ServiceSet) -> Result<()> {
        let Some(mut exit) = services.exit_watch(ServiceKind::Dashboard) else {
            return Ok(());
        };

        tokio::select! {
            ready = process::wait_for_port(&dashboard.host, dashboard.port, dashboard.readiness_timeout) => {
                if ready {
                    info!("Dashboard is listening on {}", dashboard.url());
                    Ok(())
                } else {
                    Err(SupervisorError::ReadinessTimeout {
                        service: ServiceKind::Dashboard,
                        timeout: dashboard.readiness_timeout,
                    })
                }
            }
            code = wait_exit(&mut exit) => Err(SupervisorError::ServiceCrash {
                service: ServiceKind::Dashboard,
                code: code.unwrap_or(1),
            }),
        }
    }
}

/// A running system. Dropping it without calling [`SupervisorHandle::wait`]
/// leaves child processes to `kill_on_drop`.
pub struct SupervisorHandle {
    services: ServiceSet,
    dashboard_url: String,
    descriptor: ConnectionDescriptor,
    local_port: Option<u16>,
}

impl SupervisorHandle {
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.services.handles()
    }

    pub fn dashboard_url(&self) -> &str {
        &self.dashboard_url
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn tunnel_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Run until `shutdown` resolves or a required service exits; returns
    /// the process exit status.
    pub async fn wait<F>(self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        self.services.run_until_exit(shutdown).await
    }

    fn log_banner(&self, spec: &LaunchSpec) {
        let monitor = &spec.monitor;
        info!("TrialWatch is running");
        info!("  Dashboard: {}", self.dashboard_url);
        info!("  Database:  {}", self.descriptor.redacted());
        if let (Some(port), Some(tunnel)) = (self.local_port, &spec.tunnel) {
            info!("  Tunnel:    127.0.0.1:{} ({})", port, tunnel.description());
        }
        info!("  Rules:     {}", monitor.rules.describe());
        info!("  Interval:  {:?}", monitor.interval);
        info!(
            "  Scope:     {}",
            match monitor.scope {
                TrialScope::ActiveOnly => "running and waiting trials",
                TrialScope::AllTrials => "all trials",
            }
        );
        if monitor.dry_run {
            info!("  DRY RUN: no changes will be written");
        }
        for handle in self.services.handles() {
            info!("  Service:   {}", handle);
        }
    }
}
