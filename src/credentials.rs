//! Durable storage for the access/refresh token pair.
//!
//! # Storage
//!
//! Production: single OS keyring entry `opsdeck/session` containing JSON.
//! Test environments: file at `{config_dir}/credentials.json` (mode 0600).
//!
//! Keyring reads are retried once because macOS keychain access can fail
//! transiently right after a new build is installed.

use anyhow::Result;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::auth::TokenPair;

/// Keyring service name.
const KEYRING_SERVICE: &str = "opsdeck";
/// Keyring entry holding the serialized [`Credentials`].
const KEYRING_ENTRY: &str = "session";

/// Number of attempts for keyring reads.
const KEYRING_RETRY_ATTEMPTS: u32 = 2;
/// Delay between keyring read attempts.
const KEYRING_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Categorized keyring access errors.
#[derive(Debug)]
pub enum KeyringAccessError {
    /// Entry does not exist (first run, or after logout).
    NotFound,
    /// Keyring is locked or access was denied.
    Unavailable(String),
    /// Data exists but is not valid credentials JSON.
    Corrupted(String),
}

impl std::fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "Keyring entry not found"),
            Self::Unavailable(msg) => write!(f, "Keyring unavailable: {msg}"),
            Self::Corrupted(msg) => write!(f, "Keyring data corrupted: {msg}"),
        }
    }
}

impl std::error::Error for KeyringAccessError {}

fn categorize_keyring_error(err: &keyring::Error) -> KeyringAccessError {
    match err {
        keyring::Error::NoEntry => KeyringAccessError::NotFound,
        other => KeyringAccessError::Unavailable(format!("{other:?}")),
    }
}

fn credentials_file_path() -> Result<PathBuf> {
    crate::config::Config::config_dir().map(|d| d.join("credentials.json"))
}

fn use_file_storage() -> bool {
    cfg!(test) || crate::env::uses_file_credentials()
}

/// Persisted session credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Short-lived access token attached to every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Long-lived token exchanged for a fresh pair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Schema version for future migrations.
    #[serde(default = "default_version")]
    pub version: u8,
}

fn default_version() -> u8 {
    1
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            version: default_version(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("version", &self.version)
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a token pair.
    pub fn from_pair(pair: &TokenPair) -> Self {
        Self {
            access_token: Some(pair.access_token.clone()),
            refresh_token: Some(pair.refresh_token.clone()),
            version: default_version(),
        }
    }

    /// The stored pair, if both halves are present.
    pub fn token_pair(&self) -> Option<TokenPair> {
        match (&self.access_token, &self.refresh_token) {
            (Some(access), Some(refresh)) => Some(TokenPair::new(access.clone(), refresh.clone())),
            _ => None,
        }
    }

    /// Load credentials from keyring (or file in test environments).
    ///
    /// Keyring failures degrade to empty credentials so the user can log in
    /// again instead of being stuck.
    pub fn load() -> Result<Self> {
        if use_file_storage() {
            return Self::load_from_file();
        }

        let mut last_error = None;
        for attempt in 0..KEYRING_RETRY_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(KEYRING_RETRY_DELAY);
            }
            match Self::try_load_from_keyring() {
                Ok(creds) => return Ok(creds),
                Err(KeyringAccessError::NotFound) => return Ok(Self::default()),
                Err(KeyringAccessError::Corrupted(msg)) => {
                    log::warn!("Stored credentials corrupted, ignoring: {msg}");
                    return Ok(Self::default());
                }
                Err(err) => {
                    log::debug!("Keyring read attempt {} failed: {}", attempt + 1, err);
                    last_error = Some(err);
                }
            }
        }

        if let Some(err) = last_error {
            log::warn!("Keyring access failed, continuing without credentials: {err}");
        }
        Ok(Self::default())
    }

    fn try_load_from_keyring() -> std::result::Result<Self, KeyringAccessError> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
            .map_err(|e| KeyringAccessError::Unavailable(format!("{e:?}")))?;
        let json = entry.get_password().map_err(|e| categorize_keyring_error(&e))?;
        serde_json::from_str(&json).map_err(|e| KeyringAccessError::Corrupted(e.to_string()))
    }

    fn load_from_file() -> Result<Self> {
        let path = credentials_file_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save credentials to keyring (or file in test environments).
    pub fn save(&self) -> Result<()> {
        if use_file_storage() {
            let path = credentials_file_path()?;
            fs::write(&path, serde_json::to_string_pretty(self)?)?;
            #[cfg(unix)]
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
            return Ok(());
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
            .map_err(|e| anyhow::anyhow!("Failed to open keyring entry: {e:?}"))?;
        entry
            .set_password(&serde_json::to_string(self)?)
            .map_err(|e| anyhow::anyhow!("Failed to store credentials in keyring: {e:?}"))?;
        log::debug!("Saved session credentials to OS keyring");
        Ok(())
    }

    /// Remove stored credentials.
    pub fn delete() -> Result<()> {
        if use_file_storage() {
            let path = credentials_file_path()?;
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
            .map_err(|e| anyhow::anyhow!("Failed to open keyring entry: {e:?}"))?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete keyring entry: {e:?}")),
        }
    }
}
