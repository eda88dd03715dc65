use crate::handler::{ClientHandler, SshEvent};
use crate::known_hosts;
use crate::SshError;
use russh::client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use trialwatch_core::config::keychain;
use trialwatch_core::models::TunnelSpec;

pub type SharedHandle = Arc<tokio::sync::Mutex<client::Handle<ClientHandler>>>;

/// An authenticated session to the jump host plus its event stream.
pub struct JumpSession {
    pub handle: SharedHandle,
    pub events: mpsc::UnboundedReceiver<SshEvent>,
}

pub struct SshClient {
    config: Arc<client::Config>,
    known_hosts: PathBuf,
}

impl SshClient {
    pub fn new() -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            known_hosts: known_hosts::known_hosts_path(),
        }
    }

    pub fn with_known_hosts(mut self, path: PathBuf) -> Self {
        self.known_hosts = path;
        self
    }

    /// Connect to the jump host and authenticate.
    ///
    /// A failed TCP connect or handshake is `Unreachable`; a completed
    /// handshake that no credential gets through is `AuthFailed`.
    pub async fn connect(&self, spec: &TunnelSpec) -> crate::Result<JumpSession> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler::new(
            event_tx,
            spec.jump_host.clone(),
            spec.jump_port,
            spec.host_key_policy,
            self.known_hosts.clone(),
        );

        let addr = format!("{}:{}", spec.jump_host, spec.jump_port);
        tracing::info!("Connecting to jump host {}@{}", spec.user, addr);

        let mut handle = client::connect(self.config.clone(), &*addr, handler)
            .await
            .map_err(|e| SshError::Unreachable(format!("{}: {}", addr, e)))?;

        if let Err(e) = self.authenticate(&mut handle, spec).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(e);
        }

        Ok(JumpSession {
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
            events: event_rx,
        })
    }

    /// Try credentials in order: explicit key, explicit password, default
    /// keys, keychain password.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        spec: &TunnelSpec,
    ) -> crate::Result<()> {
        if let Some(ref key_path) = spec.auth.key_path {
            match self.auth_with_key(handle, &spec.user, key_path).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Key auth with {} failed: {}", key_path.display(), e);
                }
            }
        }

        if let Some(ref password) = spec.auth.password {
            match self.auth_with_password(handle, &spec.user, password).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!("Password auth failed: {}", e),
            }
        }

        if spec.auth.key_path.is_none() {
            for key_path in default_key_paths() {
                if key_path.exists() {
                    match self.auth_with_key(handle, &spec.user, &key_path).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            tracing::debug!("Key auth with {} failed: {}", key_path.display(), e)
                        }
                    }
                }
            }
        }

        if spec.auth.password.is_none() {
            match keychain::get_password(&spec.jump_host, &spec.user) {
                Ok(Some(password)) => {
                    match self.auth_with_password(handle, &spec.user, &password).await {
                        Ok(()) => return Ok(()),
                        Err(e) => tracing::debug!("Keychain password auth failed: {}", e),
                    }
                }
                Ok(None) => {
                    tracing::debug!(
                        "No password stored in keychain for {}@{}",
                        spec.user,
                        spec.jump_host
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        "Failed to access keychain for {}@{}: {}",
                        spec.user,
                        spec.jump_host,
                        e
                    );
                }
            }
        }

        Err(SshError::AuthFailed(format!(
            "no credential accepted for {}@{}",
            spec.user, spec.jump_host
        )))
    }

    async fn auth_with_key(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
    ) -> crate::Result<()> {
        let key_pair = match russh_keys::load_secret_key(key_path, None) {
            Ok(kp) => kp,
            Err(unencrypted_err) => {
                let path_str = key_path.to_string_lossy();
                tracing::debug!(
                    "Failed to load key {} without passphrase ({}), trying keychain",
                    path_str,
                    unencrypted_err
                );

                match keychain::get_key_passphrase(&path_str) {
                    Ok(Some(passphrase)) => russh_keys::load_secret_key(key_path, Some(&passphrase))
                        .map_err(|e| {
                            SshError::Key(format!(
                                "Failed to load key {} (tried passphrase from keychain): {}",
                                path_str, e
                            ))
                        })?,
                    _ => {
                        return Err(SshError::Key(format!(
                            "Failed to load key {}: {}",
                            path_str, unencrypted_err
                        )));
                    }
                }
            }
        };

        let accepted = handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| SshError::AuthFailed(e.to_string()))?;

        if !accepted {
            return Err(SshError::AuthFailed("Public key rejected".into()));
        }

        tracing::info!("Authenticated with key {}", key_path.display());
        Ok(())
    }

    async fn auth_with_password(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        user: &str,
        password: &str,
    ) -> crate::Result<()> {
        let accepted = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| SshError::AuthFailed(e.to_string()))?;

        if !accepted {
            return Err(SshError::AuthFailed("Password rejected by server".into()));
        }

        tracing::info!("Authenticated with password for {}", user);
        Ok(())
    }
}

impl Default for SshClient {
    fn default() -> Self {
        Self::new()
    }
}

fn default_key_paths() -> Vec<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_default();
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| PathBuf::from(&home).join(".ssh").join(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_order() {
        let names: Vec<String> = default_key_paths()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["id_ed25519", "id_rsa", "id_ecdsa"]);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut spec = TunnelSpec::new("127.0.0.1", "deploy", "db.internal", 5432);
        spec.jump_port = port;

        let dir = tempfile::tempdir().unwrap();
        let client = SshClient::new().with_known_hosts(dir.path().join("known_hosts"));
        let result = client.connect(&spec).await;
        assert!(matches!(result, Err(SshError::Unreachable(_))));
    }
}
