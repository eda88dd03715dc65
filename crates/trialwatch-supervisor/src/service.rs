use crate::error::Result;
use crate::process::{self, StopSignal, FORCE_KILLED};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use trialwatch_core::models::{ServiceHandle, ServiceKind};
use trialwatch_monitor::Monitor;
use trialwatch_ssh::{TunnelHandle, TunnelStatus};

const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceExit {
    pub kind: ServiceKind,
    pub code: i32,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited(i32),
    Stopped(i32),
    Killed,
}

enum Control {
    Process { pgid: u32 },
    Tunnel(Option<TunnelHandle>),
    Task {
        shutdown: watch::Sender<bool>,
        abort: AbortHandle,
    },
}

struct ServiceEntry {
    handle: ServiceHandle,
    control: Control,
    exit: watch::Receiver<Option<i32>>,
}

impl ServiceEntry {
    /// Stop the service: polite request first, forced after `grace`.
    async fn terminate(&mut self, grace: Duration) -> Termination {
        if let Some(code) = *self.exit.borrow() {
            return Termination::AlreadyExited(code);
        }

        match &mut self.control {
            Control::Process { pgid } => {
                process::signal_group(*pgid, StopSignal::Terminate);
                if let Some(code) = wait_exit_timeout(&mut self.exit, grace).await {
                    return Termination::Stopped(code);
                }
                warn!("{} did not stop within {:?}, killing it", self.handle, grace);
                process::signal_group(*pgid, StopSignal::Kill);
                let _ = wait_exit_timeout(&mut self.exit, KILL_WAIT).await;
                Termination::Killed
            }
            Control::Tunnel(tunnel) => match tunnel.take() {
                Some(tunnel) => {
                    if tokio::time::timeout(grace, tunnel.close()).await.is_ok() {
                        Termination::Stopped(0)
                    } else {
                        warn!("{} did not close within {:?}", self.handle, grace);
                        Termination::Killed
                    }
                }
                None => Termination::AlreadyExited(0),
            },
            Control::Task { shutdown, abort } => {
                let _ = shutdown.send(true);
                if let Some(code) = wait_exit_timeout(&mut self.exit, grace).await {
                    return Termination::Stopped(code);
                }
                warn!("{} did not stop within {:?}, aborting it", self.handle, grace);
                abort.abort();
                Termination::Killed
            }
        }
    }
}

/// Registry of running services, in start order.
pub struct ServiceSet {
    entries: Vec<ServiceEntry>,
    exit_tx: mpsc::UnboundedSender<ServiceExit>,
    exit_rx: mpsc::UnboundedReceiver<ServiceExit>,
    grace: Duration,
}

impl ServiceSet {
    pub fn new(grace: Duration) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            entries: Vec::new(),
            exit_tx,
            exit_rx,
            grace,
        }
    }

    pub fn handles(&self) -> Vec<ServiceHandle> {
        self.entries.iter().map(|e| e.handle.clone()).collect()
    }

    /// Exit watch of the most recently started service of `kind`.
    pub fn exit_watch(&self, kind: ServiceKind) -> Option<watch::Receiver<Option<i32>>> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.handle.kind == kind)
            .map(|e| e.exit.clone())
    }

    fn register(&mut self, handle: ServiceHandle, control: Control) -> watch::Sender<Option<i32>> {
        let (exit_tx, exit_rx) = watch::channel(None);
        info!("Started {}", handle);
        self.entries.push(ServiceEntry {
            handle,
            control,
            exit: exit_rx,
        });
        exit_tx
    }

    fn notifier(&self, kind: ServiceKind) -> impl Fn(i32) + Send + 'static {
        let tx = self.exit_tx.clone();
        move |code| {
            let _ = tx.send(ServiceExit { kind, code });
        }
    }

    pub fn spawn_process(
        &mut self,
        kind: ServiceKind,
        program: &str,
        args: &[String],
    ) -> Result<ServiceHandle> {
        let (mut child, pid) = process::spawn_command(kind, program, args)?;
        let handle = ServiceHandle::process(kind, pid);
        let exit_tx = self.register(handle.clone(), Control::Process { pgid: pid });
        let notify = self.notifier(kind);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => process::exit_code(status),
                Err(e) => {
                    error!("Failed to wait for {}: {}", kind, e);
                    1
                }
            };
            let _ = exit_tx.send(Some(code));
            notify(code);
        });

        Ok(handle)
    }

    pub fn add_tunnel(&mut self, tunnel: TunnelHandle) -> ServiceHandle {
        let handle = ServiceHandle::task(ServiceKind::Tunnel);
        let mut health = tunnel.health();
        let exit_tx = self.register(handle.clone(), Control::Tunnel(Some(tunnel)));
        let notify = self.notifier(ServiceKind::Tunnel);

        tokio::spawn(async move {
            let code = match health.wait_until_down().await {
                TunnelStatus::Stopped => 0,
                _ => 1,
            };
            let _ = exit_tx.send(Some(code));
            notify(code);
        });

        handle
    }

    pub fn spawn_monitor(&mut self, monitor: Monitor) -> ServiceHandle {
        let handle = ServiceHandle::task(ServiceKind::Monitor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(shutdown_rx));
        let abort = task.abort_handle();
        let exit_tx = self.register(
            handle.clone(),
            Control::Task {
                shutdown: shutdown_tx,
                abort,
            },
        );
        let notify = self.notifier(ServiceKind::Monitor);

        tokio::spawn(async move {
            let code = match task.await {
                Ok(()) => 0,
                Err(e) => {
                    error!("Monitor task failed: {}", e);
                    1
                }
            };
            let _ = exit_tx.send(Some(code));
            notify(code);
        });

        handle
    }

    /// Wait until `shutdown` resolves or a required service exits, then stop
    /// everything. Returns the first non-zero status observed among all
    /// services, the browser included. A browser exit alone does not stop
    /// the others.
    pub async fn run_until_exit<F>(mut self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut status = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                exit = self.exit_rx.recv() => match exit {
                    Some(exit) if exit.kind.is_required() => {
                        if exit.code == 0 {
                            warn!("{} exited, shutting down", exit.kind);
                        } else {
                            error!("{} exited with status {}, shutting down", exit.kind, exit.code);
                        }
                        if status == 0 {
                            status = exit.code;
                        }
                        break;
                    }
                    Some(exit) => {
                        info!("{} exited with status {}", exit.kind, exit.code);
                        if status == 0 {
                            status = exit.code;
                        }
                    }
                    None => break,
                },
            }
        }

        self.shutdown(status).await
    }

    /// Stop all services in reverse start order.
    pub async fn shutdown(&mut self, first_status: i32) -> i32 {
        let mut status = first_status;
        let grace = self.grace;

        for entry in self.entries.iter_mut().rev() {
            info!("Stopping {}", entry.handle);
            let outcome = entry.terminate(grace).await;
            let code = match outcome {
                Termination::AlreadyExited(code) => code,
                Termination::Stopped(_) => 0,
                Termination::Killed => FORCE_KILLED,
            };
            if status == 0 && code != 0 {
                status = code;
            }
        }

        info!("All services stopped");
        status
    }
}

pub async fn wait_exit(rx: &mut watch::Receiver<Option<i32>>) -> Option<i32> {
    loop {
        if let Some(code) = *rx.borrow_and_update() {
            return Some(code);
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

async fn wait_exit_timeout(rx: &mut watch::Receiver<Option<i32>>, timeout: Duration) -> Option<i32> {
    tokio::time::timeout(timeout, wait_exit(rx))
        .await
        .ok()
        .flatten()
}
