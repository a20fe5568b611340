use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::bus::DEFAULT_CHANNEL_CAPACITY;
use crate::session::SessionConfig;
use crate::session::attachment::MAX_CLIENT_FILE_BYTES;
use crate::storage::{StoreLimits, ensure_parent_dir};

pub const DEFAULT_CONFIG_PATH: &str = "config/pairchat.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    /// Root directory for the local blob store.
    pub blob_dir: String,
    pub public_base_url: String,
    /// When set, attachments go to this object storage endpoint instead of `blob_dir`.
    pub blob_endpoint: Option<String>,
    pub blob_bucket: String,
    pub blob_token: Option<String>,
    pub typing_idle_timeout_ms: u64,
    pub max_attachment_bytes: usize,
    pub store_max_attachment_bytes: usize,
    pub max_message_chars: usize,
    pub channel_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "data/pairchat.db".into(),
            blob_dir: "data/blobs".into(),
            public_base_url: "http://localhost:8080/chat-attachments".into(),
            blob_endpoint: None,
            blob_bucket: "chat-attachments".into(),
            blob_token: None,
            typing_idle_timeout_ms: 2000,
            max_attachment_bytes: MAX_CLIENT_FILE_BYTES,
            store_max_attachment_bytes: 10 * 1024 * 1024,
            max_message_chars: StoreLimits::default().max_message_chars,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            typing_idle_timeout: Duration::from_millis(self.typing_idle_timeout_ms),
            max_upload_bytes: self.max_attachment_bytes,
            ..SessionConfig::default()
        }
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_message_chars: self.max_message_chars,
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &str, config: &AppConfig) -> std::io::Result<()> {
    ensure_parent_dir(path)?;
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert_eq!(load_config(path.to_str().unwrap()), AppConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairchat.json");
        fs::write(&path, r#"{ "typing_idle_timeout_ms": 500, "blob_token": "secret" }"#).unwrap();

        let config = load_config(path.to_str().unwrap());
        assert_eq!(config.typing_idle_timeout_ms, 500);
        assert_eq!(config.blob_token.as_deref(), Some("secret"));
        assert_eq!(config.max_message_chars, 4000);
        assert_eq!(
            config.session_config().typing_idle_timeout,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn malformed_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(path.to_str().unwrap()), AppConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/pairchat.json");
        let path = path.to_str().unwrap();

        let config = AppConfig {
            blob_endpoint: Some("https://storage.example.com".into()),
            max_message_chars: 280,
            ..AppConfig::default()
        };
        save_config(path, &config).unwrap();

        let loaded = load_config(path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.store_limits().max_message_chars, 280);
    }
}
