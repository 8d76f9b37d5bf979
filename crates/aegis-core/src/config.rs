//! Configuration management for aegis.
//!
//! Loads configuration from ${AEGIS_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::callback::{CALLBACK_POLL_ATTEMPTS, IDLE_POLL_ATTEMPTS, POLL_INTERVAL, PollPolicy};
use crate::hosted::HostedProvider;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hosted provider base URL, e.g. `https://auth.example.com`.
    pub domain: String,

    /// Public app client id (not a secret).
    pub client_id: String,

    /// Redirect target registered with the provider.
    pub redirect_uri: String,

    /// Space-separated OAuth scopes.
    pub scope: String,

    /// Prefix for the provider-namespaced storage keys.
    pub key_prefix: String,

    /// Interval between poll attempts in milliseconds.
    pub poll_interval_ms: u64,

    /// Poll bound when the URL carries no OAuth artifacts.
    pub idle_poll_attempts: u32,

    /// Poll bound after a detected callback.
    pub callback_poll_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            client_id: String::new(),
            redirect_uri: "http://localhost:3000/".to_string(),
            scope: "openid email profile".to_string(),
            key_prefix: "IdentityServiceProvider".to_string(),
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            idle_poll_attempts: IDLE_POLL_ATTEMPTS,
            callback_poll_attempts: CALLBACK_POLL_ATTEMPTS,
        }
    }
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// The hosted provider this configuration points at.
    pub fn provider(&self) -> HostedProvider {
        HostedProvider {
            domain: self.domain.clone(),
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scope: self.scope.clone(),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Polling schedule for the no-artifacts path.
    pub fn idle_poll(&self) -> PollPolicy {
        PollPolicy::new(self.idle_poll_attempts, self.interval())
    }

    /// Polling schedule after a detected callback.
    pub fn callback_poll(&self) -> PollPolicy {
        PollPolicy::new(self.callback_poll_attempts, self.interval())
    }
}

pub mod paths {
    //! Path resolution for aegis configuration and data.
    //!
    //! AEGIS_HOME resolution order:
    //! 1. AEGIS_HOME environment variable (if set)
    //! 2. ~/.config/aegis (default)

    use std::path::PathBuf;

    /// Returns the aegis home directory.
    ///
    /// Checks AEGIS_HOME env var first, falls back to ~/.config/aegis
    pub fn aegis_home() -> PathBuf {
        if let Ok(home) = std::env::var("AEGIS_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config").join("aegis"))
            .expect("Could not determine home directory")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        aegis_home().join("config.toml")
    }

    /// Returns the path to the persisted token store.
    pub fn tokens_path() -> PathBuf {
        aegis_home().join("tokens.json")
    }
}
