use crate::error::{Result, SupervisorError};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use trialwatch_core::models::ServiceKind;

/// Exit status recorded for a service that had to be force-killed.
pub const FORCE_KILLED: i32 = 137;

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

/// Spawn `program` in its own process group so a stop signal reaches
/// everything it forks.
pub fn spawn_command(kind: ServiceKind, program: &str, args: &[String]) -> Result<(Child, u32)> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            service: kind,
            source,
        })?;
    let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
        service: kind,
        source: std::io::Error::other("process exited before it could be tracked"),
    })?;
    Ok((child, pid))
}

/// Numeric status of an exited process; death by signal maps to 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Send `signal` to the process group led by `pgid`.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: StopSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), sig) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Failed to send {:?} to process group {}: {}", sig, pgid, e);
            false
        }
    }
}

#[cfg(not(unix))]
pub fn signal_group(pgid: u32, signal: StopSignal) -> bool {
    tracing::warn!("Cannot send {:?} to process group {} on this platform", signal, pgid);
    false
}

/// Fail fast when a fixed port is already bound by someone else.
pub fn ensure_port_free(host: &str, port: u16) -> Result<()> {
    match std::net::TcpListener::bind((host, port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(SupervisorError::PortInUse(port)),
        Err(e) => Err(SupervisorError::Config(format!(
            "cannot bind {}:{}: {}",
            host, port, e
        ))),
    }
}

/// Poll until something accepts TCP connections on `host:port`.
/// Returns false when `timeout` elapses first.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bound_port_is_reported_in_use() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(matches!(
            ensure_port_free("127.0.0.1", port),
            Err(SupervisorError::PortInUse(p)) if p == port
        ));
        drop(listener);
        assert!(ensure_port_free("127.0.0.1", port).is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_port("127.0.0.1", port, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!wait_for_port("127.0.0.1", port, Duration::from_millis(300)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_codes() {
        let (mut child, _) =
            spawn_command(ServiceKind::Dashboard, "sh", &["-c".into(), "exit 3".into()]).unwrap();
        assert_eq!(exit_code(child.wait().await.unwrap()), 3);

        let (mut child, pid) =
            spawn_command(ServiceKind::Dashboard, "sleep", &["30".into()]).unwrap();
        assert!(signal_group(pid, StopSignal::Kill));
        assert_eq!(exit_code(child.wait().await.unwrap()), FORCE_KILLED);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = spawn_command(ServiceKind::Browser, "/nonexistent/trialwatch-browser", &[]);
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }
}
