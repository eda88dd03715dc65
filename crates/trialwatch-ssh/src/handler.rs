use async_trait::async_trait;
use russh::client::{self, DisconnectReason, Session};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::path::PathBuf;
use tokio::sync::mpsc;
use trialwatch_core::models::HostKeyPolicy;

use crate::known_hosts::{self, KnownHostResult};

#[derive(Debug, Clone)]
pub enum SshEvent {
    Banner(String),
    Disconnected(String),
}

pub struct ClientHandler {
    event_tx: mpsc::UnboundedSender<SshEvent>,
    hostname: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: PathBuf,
}

impl ClientHandler {
    pub fn new(
        event_tx: mpsc::UnboundedSender<SshEvent>,
        hostname: String,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: PathBuf,
    ) -> Self {
        Self {
            event_tx,
            hostname,
            port,
            policy,
            known_hosts,
        }
    }

    fn send_event(&self, event: SshEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::Insecure {
            tracing::warn!(
                "Accepting server key for {} without verification",
                self.hostname
            );
            return Ok(true);
        }

        let key_type = server_public_key.name();
        let key_base64 = server_public_key.public_key_base64();

        match known_hosts::check_known_host(
            &self.known_hosts,
            &self.hostname,
            self.port,
            key_type,
            &key_base64,
        ) {
            KnownHostResult::Match => {
                tracing::debug!("Server key verified for {}", self.hostname);
                Ok(true)
            }
            KnownHostResult::Mismatch => {
                tracing::error!(
                    "HOST KEY MISMATCH for {}! The server key has changed. Connection rejected.",
                    self.hostname
                );
                Ok(false)
            }
            KnownHostResult::NotFound => {
                tracing::info!(
                    "New host {}, adding {} key to known_hosts",
                    self.hostname,
                    key_type
                );
                known_hosts::add_known_host(
                    &self.known_hosts,
                    &self.hostname,
                    self.port,
                    key_type,
                    &key_base64,
                );
                Ok(true)
            }
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::info!("SSH banner: {}", banner);
        self.send_event(SshEvent::Banner(banner.to_string()));
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        let msg = match reason {
            DisconnectReason::ReceivedDisconnect(info) => {
                format!("Server disconnected: {:?}", info)
            }
            DisconnectReason::Error(e) => {
                format!("Connection error: {}", e)
            }
        };
        tracing::info!("{}", msg);
        self.send_event(SshEvent::Disconnected(msg));
        Ok(())
    }
}
