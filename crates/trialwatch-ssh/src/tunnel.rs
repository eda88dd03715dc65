use crate::client::{JumpSession, SharedHandle, SshClient};
use crate::handler::SshEvent;
use crate::SshError;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use trialwatch_core::models::TunnelSpec;
use uuid::Uuid;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Active,
    Error,
    Stopped,
}

/// Cloneable view of a running tunnel's health.
#[derive(Clone)]
pub struct TunnelHealth {
    status: watch::Receiver<TunnelStatus>,
    pub bytes_sent: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
}

impl TunnelHealth {
    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.status() == TunnelStatus::Active
    }

    pub fn total_bytes(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }

    /// Resolves once the tunnel is no longer active and returns the final status.
    pub async fn wait_until_down(&mut self) -> TunnelStatus {
        loop {
            let current = *self.status.borrow_and_update();
            if current != TunnelStatus::Active {
                return current;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

pub struct TunnelHandle {
    pub id: Uuid,
    pub local_port: u16,
    health: TunnelHealth,
    session: SharedHandle,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    pub fn health(&self) -> TunnelHealth {
        self.health.clone()
    }

    pub fn is_active(&self) -> bool {
        self.health.is_active()
    }

    /// Stop accepting connections and disconnect from the jump host.
    pub async fn close(self) {
        let _ = self.shutdown_tx.try_send(());
        let mut task = self.task;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("Local forward on port {} did not stop in time", self.local_port);
            task.abort();
        }

        let h = self.session.lock().await;
        if let Err(e) = h
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect from jump host failed: {}", e);
        }
        tracing::info!("Tunnel on local port {} closed", self.local_port);
    }
}

pub struct TunnelManager {
    client: SshClient,
    retry_backoff: Duration,
}

impl TunnelManager {
    pub fn new(client: SshClient) -> Self {
        Self {
            client,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Bind the local end of the forward: the first free port of `range`,
    /// or an OS-assigned ephemeral port when no range is given. The returned
    /// listener keeps the port reserved.
    pub async fn allocate_local_port(range: Option<&RangeInclusive<u16>>) -> crate::Result<TcpListener> {
        match range {
            Some(range) => {
                for port in range.clone() {
                    if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                        return Ok(listener);
                    }
                }
                Err(SshError::NoLocalPort(format!(
                    "every port in {}-{} is in use",
                    range.start(),
                    range.end()
                )))
            }
            None => TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|e| SshError::NoLocalPort(e.to_string())),
        }
    }

    /// Open a local forward to `spec.remote_host:spec.remote_port` through the
    /// jump host. The local port is reserved before any network traffic, and
    /// connecting plus probing is retried once after a short backoff.
    pub async fn open(&self, spec: &TunnelSpec) -> crate::Result<TunnelHandle> {
        spec.validate()
            .map_err(|e| SshError::InvalidSpec(e.to_string()))?;

        let listener = Self::allocate_local_port(spec.local_ports.as_ref()).await?;
        let local_port = listener.local_addr()?.port();
        tracing::info!("Reserved local port {} for {}", local_port, spec.description());

        let session = match self.establish(spec).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    "Tunnel attempt failed: {}. Retrying in {:?}",
                    e,
                    self.retry_backoff
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.establish(spec).await?
            }
        };

        Ok(start_local_forward(
            listener,
            local_port,
            session,
            spec.remote_host.clone(),
            spec.remote_port,
        ))
    }

    async fn establish(&self, spec: &TunnelSpec) -> crate::Result<JumpSession> {
        let session = self.client.connect(spec).await?;
        if let Err(e) = probe(&session.handle, &spec.remote_host, spec.remote_port).await {
            let h = session.handle.lock().await;
            let _ = h
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(e);
        }
        Ok(session)
    }
}

/// Open and drop one channel to the remote endpoint to confirm the jump host
/// can reach it.
async fn probe(handle: &SharedHandle, remote_host: &str, remote_port: u16) -> crate::Result<()> {
    let h = handle.lock().await;
    let channel = h
        .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await
        .map_err(|e| {
            SshError::ProbeFailed(format!("{}:{}: {}", remote_host, remote_port, e))
        })?;
    let _ = channel.close().await;
    tracing::debug!("Probe to {}:{} succeeded", remote_host, remote_port);
    Ok(())
}

fn start_local_forward(
    listener: TcpListener,
    local_port: u16,
    session: JumpSession,
    remote_host: String,
    remote_port: u16,
) -> TunnelHandle {
    let (status_tx, status_rx) = watch::channel(TunnelStatus::Active);
    let bytes_sent = Arc::new(AtomicU64::new(0));
    let bytes_received = Arc::new(AtomicU64::new(0));
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    let JumpSession { handle, mut events } = session;
    let forward_handle = handle.clone();
    let bytes_sent_clone = bytes_sent.clone();
    let bytes_received_clone = bytes_received.clone();

    tracing::info!(
        "Local forward: 127.0.0.1:{} -> {}:{}",
        local_port,
        remote_host,
        remote_port
    );

    let task = tokio::spawn(async move {
        let final_status = loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => {
                            tracing::debug!("Accepted tunnel connection from {}", addr);
                            let handle = forward_handle.clone();
                            let rhost = remote_host.clone();
                            let bs = bytes_sent_clone.clone();
                            let br = bytes_received_clone.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_local_forward_connection(
                                    handle, stream, &rhost, remote_port, bs, br,
                                )
                                .await
                                {
                                    tracing::error!("Forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(SshEvent::Banner(_)) => {}
                        Some(SshEvent::Disconnected(msg)) => {
                            tracing::error!("Tunnel on port {} lost its session: {}", local_port, msg);
                            break TunnelStatus::Error;
                        }
                        None => {
                            tracing::error!("Tunnel on port {} lost its session", local_port);
                            break TunnelStatus::Error;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Stopping local forward on port {}", local_port);
                    break TunnelStatus::Stopped;
                }
            }
        };

        let _ = status_tx.send(final_status);
    });

    TunnelHandle {
        id: Uuid::new_v4(),
        local_port,
        health: TunnelHealth {
            status: status_rx,
            bytes_sent,
            bytes_received,
        },
        session: handle,
        shutdown_tx,
        task,
    }
}

/// Pipe one accepted local connection through a direct-tcpip channel.
async fn handle_local_forward_connection(
    handle: SharedHandle,
    tcp_stream: tokio::net::TcpStream,
    remote_host: &str,
    remote_port: u16,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    let channel = {
        let h = handle.lock().await;
        h.channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
            .await?
    };

    let ssh_stream = channel.into_stream();
    let (mut ssh_read, mut ssh_write) = tokio::io::split(ssh_stream);
    let (mut tcp_read, mut tcp_write) = tokio::io::split(tcp_stream);

    let tcp_to_ssh = tokio::spawn(async move {
        let mut buf = vec![0u8; 32768];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if ssh_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let ssh_to_tcp = tokio::spawn(async move {
        let mut buf = vec![0u8; 32768];
        loop {
            match ssh_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    if tcp_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let _ = tokio::join!(tcp_to_ssh, ssh_to_tcp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn manager() -> TunnelManager {
        let dir = std::env::temp_dir().join(format!("trialwatch-kh-{}", Uuid::new_v4()));
        TunnelManager::new(SshClient::new().with_known_hosts(dir.join("known_hosts")))
            .with_retry_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_allocate_ephemeral_port() {
        let listener = TunnelManager::allocate_local_port(None).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_allocate_from_range_skips_busy_port() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let range = RangeInclusive::new(busy_port, busy_port);
        let result = TunnelManager::allocate_local_port(Some(&range)).await;
        assert!(matches!(result, Err(SshError::NoLocalPort(_))));
    }

    #[tokio::test]
    async fn test_allocate_from_range_returns_free_port() {
        let port = free_port();
        let range = RangeInclusive::new(port, port);
        let listener = TunnelManager::allocate_local_port(Some(&range)).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_open_fails_on_port_exhaustion_before_connecting() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        // The jump host would never resolve; exhaustion must be reported first.
        let mut spec = TunnelSpec::new("jump.invalid", "deploy", "db.internal", 5432);
        spec.local_ports = Some(RangeInclusive::new(busy_port, busy_port));

        let result = manager().open(&spec).await;
        assert!(matches!(result, Err(SshError::NoLocalPort(_))));
    }

    #[tokio::test]
    async fn test_open_reports_unreachable_jump_host_after_retry() {
        let mut spec = TunnelSpec::new("127.0.0.1", "deploy", "db.internal", 5432);
        spec.jump_port = free_port();

        let result = manager().open(&spec).await;
        assert!(matches!(result, Err(SshError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_spec() {
        let spec = TunnelSpec::new("jump.example.com", "deploy", "localhost", 5432);
        let result = manager().open(&spec).await;
        assert!(matches!(result, Err(SshError::InvalidSpec(_))));
    }
}
