// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables and the host registry.
//!
//! The registry used to be ambient process-wide state keyed by hostname;
//! here it is an explicit object resolved once at startup and passed into
//! every task and backend at construction.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// cax agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection path/URL for the run-document store.
    pub database_url: String,
    /// Identity of this agent in the host registry.
    pub host: String,
    /// Path to the JSON host registry file.
    pub hosts_file: String,
    /// Poll interval between scheduler cycles.
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CAX_DATABASE_URL`: store database path
    /// - `CAX_HOST`: this agent's host identifier
    /// - `CAX_HOSTS_FILE`: path to the JSON host registry
    ///
    /// Optional (with defaults):
    /// - `CAX_POLL_INTERVAL_SECS`: seconds between poll cycles (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CAX_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CAX_DATABASE_URL"))?;

        let host = std::env::var("CAX_HOST").map_err(|_| ConfigError::Missing("CAX_HOST"))?;

        let hosts_file = std::env::var("CAX_HOSTS_FILE")
            .map_err(|_| ConfigError::Missing("CAX_HOSTS_FILE"))?;

        let poll_secs: u64 = std::env::var("CAX_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CAX_POLL_INTERVAL_SECS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            host,
            hosts_file,
            poll_interval: Duration::from_secs(poll_secs),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// The host registry file could not be read.
    #[error("failed to read host registry {0}: {1}")]
    RegistryRead(String, String),

    /// The host registry file could not be parsed.
    #[error("failed to parse host registry {0}: {1}")]
    RegistryParse(String, String),
}

/// One storage site in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Network hostname for SSH-style addressing; symbolic sites have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Account/credential reference used when connecting to this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Transfer method for copies to/from this host
    /// (`scp`, `gfal-copy`, `rucio`, `tape`).
    pub method: String,
    /// Base directory (or grid URL prefix) where run data lives.
    pub directory: String,
    /// Hosts this site may push data to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_to: Vec<String>,
    /// Hosts this site may pull data from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_from: Vec<String>,
}

/// Static per-host registry: host identifier → site record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostRegistry {
    hosts: BTreeMap<String, HostEntry>,
}

impl HostRegistry {
    /// Build a registry from explicit entries (mainly for tests).
    pub fn from_entries(entries: Vec<(String, HostEntry)>) -> Self {
        Self {
            hosts: entries.into_iter().collect(),
        }
    }

    /// Load the registry from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::RegistryRead(path.display().to_string(), e.to_string())
        })?;
        serde_json::from_str(&text)
            .map_err(|e| ConfigError::RegistryParse(path.display().to_string(), e.to_string()))
    }

    /// Look up one host.
    pub fn get(&self, host: &str) -> Option<&HostEntry> {
        self.hosts.get(host)
    }

    /// Allowed push destinations for a host.
    pub fn upload_options(&self, host: &str) -> &[String] {
        self.get(host).map(|e| e.upload_to.as_slice()).unwrap_or(&[])
    }

    /// Allowed pull sources for a host.
    pub fn download_options(&self, host: &str) -> &[String] {
        self.get(host)
            .map(|e| e.download_from.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CAX_DATABASE_URL", ".data/cax.db");
        guard.set("CAX_HOST", "siteA");
        guard.set("CAX_HOSTS_FILE", "/etc/cax/hosts.json");
        guard.remove("CAX_POLL_INTERVAL_SECS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, ".data/cax.db");
        assert_eq!(config.host, "siteA");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CAX_DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Missing("CAX_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_invalid_poll_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CAX_DATABASE_URL", ".data/cax.db");
        guard.set("CAX_HOST", "siteA");
        guard.set("CAX_HOSTS_FILE", "/etc/cax/hosts.json");
        guard.set("CAX_POLL_INTERVAL_SECS", "soon");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("CAX_POLL_INTERVAL_SECS", _)
        ));
    }

    #[test]
    fn test_registry_parse_and_lookup() {
        let json = r#"
        {
            "siteA": {
                "hostname": "dataman.example.org",
                "account": "cax",
                "method": "scp",
                "directory": "/data/raw",
                "upload_to": ["siteB"]
            },
            "rucio-catalogue": {
                "method": "rucio",
                "directory": "x1t_SR000",
                "download_from": ["siteA"]
            }
        }
        "#;
        let registry: HostRegistry = serde_json::from_str(json).unwrap();

        let a = registry.get("siteA").unwrap();
        assert_eq!(a.method, "scp");
        assert_eq!(a.hostname.as_deref(), Some("dataman.example.org"));
        assert_eq!(registry.upload_options("siteA"), ["siteB"]);
        assert_eq!(registry.download_options("rucio-catalogue"), ["siteA"]);
        assert!(registry.get("nowhere").is_none());
        assert!(registry.upload_options("nowhere").is_empty());
    }

    #[test]
    fn test_registry_from_file_missing() {
        let err = HostRegistry::from_file("/no/such/registry.json").unwrap_err();
        assert!(matches!(err, ConfigError::RegistryRead(_, _)));
    }
}
