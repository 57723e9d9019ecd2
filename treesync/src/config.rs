use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use treesync_core::ConnectionParams;

use crate::session_log::LogParams;
use crate::sync::pool::PoolConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteParams {
    pub connection: ConnectionParams,
    pub num_workers: usize,
    /// Scheduler attempts per command (transport failures only).
    pub request_retry_limit: u32,
    /// Full attempts per action (command plus verification).
    pub action_retry_limit: u32,
    pub request_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
}

impl Default for RemoteParams {
    fn default() -> Self {
        Self {
            connection: ConnectionParams::default(),
            num_workers: 5,
            request_retry_limit: 3,
            action_retry_limit: 3,
            request_timeout_ms: 2000,
            transfer_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub local_root: PathBuf,
    pub remote_root: String,
    /// Persisted remote snapshot and local hash cache.
    pub keep_content_file: PathBuf,
    /// Ask before applying a non-empty plan.
    pub confirm_actions: bool,
    /// Glob patterns matched against root-relative paths.
    pub exclude: Vec<String>,
    pub remote: RemoteParams,
    pub log: LogParams,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("."),
            remote_root: "/".to_string(),
            keep_content_file: PathBuf::from("keep-content.json"),
            confirm_actions: true,
            exclude: Vec::new(),
            remote: RemoteParams::default(),
            log: LogParams::default(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: SyncConfig = serde_json::from_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides win over the file, so credentials can stay out
    /// of it.
    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("TREESYNC_ENDPOINT") {
            self.remote.connection.endpoint = value;
        }
        if let Ok(value) = std::env::var("TREESYNC_USERNAME") {
            self.remote.connection.username = value;
        }
        if let Ok(value) = std::env::var("TREESYNC_PASSWORD") {
            self.remote.connection.password = value;
        }
        read_u64_env("TREESYNC_NUM_WORKERS", |v| {
            self.remote.num_workers = v as usize
        });
        read_u64_env("TREESYNC_REQUEST_RETRY_LIMIT", |v| {
            self.remote.request_retry_limit = v as u32
        });
        read_u64_env("TREESYNC_ACTION_RETRY_LIMIT", |v| {
            self.remote.action_retry_limit = v as u32
        });
        read_u64_env("TREESYNC_REQUEST_TIMEOUT_MS", |v| {
            self.remote.request_timeout_ms = v
        });
        read_u64_env("TREESYNC_TRANSFER_TIMEOUT_MS", |v| {
            self.remote.transfer_timeout_ms = v
        });
        read_bool_env("TREESYNC_CONFIRM_ACTIONS", |v| self.confirm_actions = v);
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connection: self.remote.connection.clone(),
            num_workers: self.remote.num_workers.max(1),
            retry_limit: self.remote.request_retry_limit,
            request_timeout: Duration::from_millis(self.remote.request_timeout_ms),
            transfer_timeout: Duration::from_millis(self.remote.transfer_timeout_ms),
        }
    }
}

fn read_u64_env(name: &str, mut apply: impl FnMut(u64)) {
    if let Ok(value) = std::env::var(name) {
        match value.parse() {
            Ok(parsed) => apply(parsed),
            Err(_) => eprintln!("[treesync] ignoring non-numeric {name}={value}"),
        }
    }
}

fn read_bool_env(name: &str, mut apply: impl FnMut(bool)) {
    if let Ok(value) = std::env::var(name) {
        match value.as_str() {
            "1" | "true" | "yes" => apply(true),
            "0" | "false" | "no" => apply(false),
            other => eprintln!("[treesync] ignoring non-boolean {name}={other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-config.json");
        std::fs::write(
            &path,
            r#"{
                "local_root": "/srv/site",
                "remote_root": "/www",
                "remote": { "connection": { "endpoint": "http://files.local" } }
            }"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.local_root, PathBuf::from("/srv/site"));
        assert_eq!(config.remote_root, "/www");
        assert_eq!(config.remote.connection.endpoint, "http://files.local");
        assert_eq!(config.remote.num_workers, 5);
        assert_eq!(config.remote.request_timeout_ms, 2000);
        assert!(config.confirm_actions);
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(SyncConfig::load(&path).is_err());
    }

    #[test]
    fn pool_config_converts_timeouts() {
        let config = SyncConfig::default();
        let pool = config.pool_config();
        assert_eq!(pool.request_timeout, Duration::from_millis(2000));
        assert_eq!(pool.transfer_timeout, Duration::from_millis(5000));
        assert_eq!(pool.num_workers, 5);
    }
}
