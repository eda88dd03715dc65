use crate::error::{CoreError, Result};
use tracing::debug;

const SERVICE_NAME: &str = "trialwatch-ssh";

/// Build a keyring entry key from host and user.
fn entry_key(host: &str, user: &str) -> String {
    format!("{}@{}", user, host)
}

/// Retrieve a jump-host password from the OS keychain. Returns None if not found.
pub fn get_password(host: &str, user: &str) -> Result<Option<String>> {
    let key = entry_key(host, user);
    let entry = keyring::Entry::new(SERVICE_NAME, &key)
        .map_err(|e| CoreError::Keychain(format!("Failed to create keyring entry: {}", e)))?;
    match entry.get_password() {
        Ok(password) => {
            debug!("Retrieved password for {}", key);
            Ok(Some(password))
        }
        Err(keyring::Error::NoEntry) => {
            debug!("No password stored for {}", key);
            Ok(None)
        }
        Err(e) => Err(CoreError::Keychain(format!(
            "Failed to retrieve password: {}",
            e
        ))),
    }
}

/// Retrieve a private key passphrase from the OS keychain, keyed by the key file path.
pub fn get_key_passphrase(key_path: &str) -> Result<Option<String>> {
    let key = format!("passphrase:{}", key_path);
    let entry = keyring::Entry::new(SERVICE_NAME, &key)
        .map_err(|e| CoreError::Keychain(format!("Failed to create keyring entry: {}", e)))?;
    match entry.get_password() {
        Ok(passphrase) => Ok(Some(passphrase)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(CoreError::Keychain(format!(
            "Failed to retrieve passphrase: {}",
            e
        ))),
    }
}
