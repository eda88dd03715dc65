use clap::Parser;
use std::path::PathBuf;
use trialwatch_core::config::app_config::CertMode;
use trialwatch_core::config::{AppConfig, Backend};
use trialwatch_core::models::HostKeyPolicy;

/// Launch the optimization dashboard and turn PRUNE/FAIL notes on trials into
/// state changes.
#[derive(Parser, Debug, Default)]
#[command(name = "trialwatch", version, about)]
pub struct Cli {
    /// Read configuration from this file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    // Database connection
    /// Full database URL; bypasses the other database options
    #[arg(long, help_heading = "Database connection")]
    pub db_url: Option<String>,
    #[arg(long, help_heading = "Database connection")]
    pub db_host: Option<String>,
    /// Database port (default: 5432 for postgresql, 3306 for mysql)
    #[arg(long, help_heading = "Database connection")]
    pub db_port: Option<u16>,
    #[arg(long, help_heading = "Database connection")]
    pub db_name: Option<String>,
    #[arg(long, help_heading = "Database connection")]
    pub db_user: Option<String>,
    #[arg(long, help_heading = "Database connection")]
    pub db_password: Option<String>,
    /// postgresql, mysql or sqlite
    #[arg(long, help_heading = "Database connection")]
    pub db_type: Option<Backend>,
    /// Path to a CA certificate file
    #[arg(long, help_heading = "Database connection")]
    pub cert_path: Option<PathBuf>,
    /// Use the certificate given by --cert-path
    #[arg(long, help_heading = "Database connection")]
    pub use_cert: bool,
    /// Disable certificates, including default detection
    #[arg(long, help_heading = "Database connection")]
    pub no_cert: bool,

    // SSH tunnel
    /// Jump host to tunnel the database connection through
    #[arg(long, help_heading = "SSH tunnel")]
    pub ssh_host: Option<String>,
    #[arg(long, help_heading = "SSH tunnel")]
    pub ssh_user: Option<String>,
    #[arg(long, help_heading = "SSH tunnel")]
    pub ssh_port: Option<u16>,
    /// Private key for the jump host
    #[arg(long, help_heading = "SSH tunnel")]
    pub ssh_key: Option<PathBuf>,
    /// Password for the jump host (prefer keys)
    #[arg(long, help_heading = "SSH tunnel")]
    pub ssh_password: Option<String>,
    /// Accept any jump host key without checking known_hosts
    #[arg(long, help_heading = "SSH tunnel")]
    pub ssh_insecure: bool,

    // Monitor
    /// Dashboard port
    #[arg(long, help_heading = "Monitor")]
    pub port: Option<u16>,
    /// Study names to monitor, or `all`
    #[arg(long, num_args = 0.., help_heading = "Monitor")]
    pub study: Option<Vec<String>>,
    /// Poll interval in seconds
    #[arg(long, help_heading = "Monitor")]
    pub interval: Option<u64>,
    /// Regex that prunes a trial
    #[arg(long, help_heading = "Monitor")]
    pub prune_pattern: Option<String>,
    /// Regex that fails a trial
    #[arg(long, help_heading = "Monitor")]
    pub fail_pattern: Option<String>,
    /// Log intended changes without applying them
    #[arg(long, help_heading = "Monitor")]
    pub dry_run: bool,
    /// Also act on trials that already finished
    #[arg(long, help_heading = "Monitor")]
    pub all_trials: bool,
    /// Append a marker to the note of every trial acted upon
    #[arg(long, help_heading = "Monitor")]
    pub mark_handled: bool,
    /// Debug logging
    #[arg(long, short, help_heading = "Monitor")]
    pub verbose: bool,

    // Browser
    /// Open the dashboard in an app-mode browser window
    #[arg(long, help_heading = "Browser")]
    pub app_mode: bool,
    /// Open the dashboard with this browser executable
    #[arg(long, help_heading = "Browser")]
    pub browser_path: Option<PathBuf>,
}

impl Cli {
    /// Overlay command-line values on top of the file configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        let db = &mut config.database;
        if let Some(url) = &self.db_url {
            db.url = Some(url.clone());
        }
        if let Some(host) = &self.db_host {
            db.host = host.clone();
        }
        if self.db_port.is_some() {
            db.port = self.db_port;
        }
        if let Some(name) = &self.db_name {
            db.name = name.clone();
        }
        if let Some(user) = &self.db_user {
            db.user = user.clone();
        }
        if let Some(password) = &self.db_password {
            db.password = password.clone();
        }
        if let Some(backend) = self.db_type {
            db.backend = backend;
        }
        if let Some(path) = &self.cert_path {
            db.cert_path = Some(path.clone());
        }
        if self.no_cert {
            db.cert_mode = CertMode::Disable;
        } else if self.use_cert {
            db.cert_mode = CertMode::Use;
        }

        let tunnel = &mut config.tunnel;
        if let Some(host) = &self.ssh_host {
            tunnel.host = Some(host.clone());
        }
        if let Some(user) = &self.ssh_user {
            tunnel.user = Some(user.clone());
        }
        if let Some(port) = self.ssh_port {
            tunnel.port = port;
        }
        if let Some(key) = &self.ssh_key {
            tunnel.key_path = Some(key.clone());
        }
        if let Some(password) = &self.ssh_password {
            tunnel.password = Some(password.clone());
        }
        if self.ssh_insecure {
            tunnel.host_key_policy = HostKeyPolicy::Insecure;
        }

        if let Some(port) = self.port {
            config.dashboard.port = port;
        }

        let monitor = &mut config.monitor;
        if let Some(studies) = &self.study {
            monitor.studies = studies.clone();
        }
        if let Some(interval) = self.interval {
            monitor.interval_secs = interval;
        }
        if let Some(pattern) = &self.prune_pattern {
            monitor.prune_pattern = pattern.clone();
        }
        if let Some(pattern) = &self.fail_pattern {
            monitor.fail_pattern = pattern.clone();
        }
        monitor.dry_run |= self.dry_run;
        monitor.all_trials |= self.all_trials;
        monitor.mark_handled |= self.mark_handled;

        config.browser.app_mode |= self.app_mode;
        if let Some(path) = &self.browser_path {
            config.browser.path = Some(path.clone());
        }
    }
}
