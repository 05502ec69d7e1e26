use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Path of the JSON snapshot the config source reads (subnets,
    /// listen endpoints, replayed leases).
    pub config_path: PathBuf,
    /// Path of the append-only journal receiving committed leases.
    pub lease_journal_path: PathBuf,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/var/lib/netlease/config.json"),
            lease_journal_path: PathBuf::from("/var/lib/netlease/leases.jsonl"),
        }
    }
}

impl EnvConfig {
    /// Load the configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("NETLEASE_CONFIG_PATH") {
            config.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NETLEASE_LEASE_JOURNAL") {
            config.lease_journal_path = PathBuf::from(v);
        }

        config
    }

    /// Load the .env file (if any) and then the environment variables.
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [
                PathBuf::from("/opt/netlease/.env"),
                PathBuf::from(".env"),
            ];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }
}

/// Load a basic .env file (KEY=VALUE per line).
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}
