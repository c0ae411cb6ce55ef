//! TOML configuration with serde defaults for every field.
//!
//! A missing config file is not an error: `Config::load(None)` yields the
//! defaults, writing nothing to disk. Paths that are left unset resolve
//! under the platform data directory (`~/.local/share/inkpress` on Linux).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub uploads: UploadsConfig,
    pub client: ClientConfig,
}

/// `[server]` — gateway bind address and CORS origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed to make credentialed cross-site requests (the SPA).
    pub cors_allowed_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            cors_allowed_origin: "http://localhost:5173".into(),
        }
    }
}

/// `[database]` — SQLite file location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit path to the SQLite database. Unset → `<data dir>/inkpress.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| data_dir().join("inkpress.db"))
    }
}

/// `[auth]` — session and anti-forgery token lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Session token lifetime in seconds. 0 = tokens never expire.
    pub session_ttl_secs: u64,
    /// Anti-forgery token lifetime in seconds.
    pub csrf_ttl_secs: u64,
    /// Whether POST /api/register is open.
    pub allow_registration: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 30 * 24 * 3600,
            csrf_ttl_secs: 2 * 3600,
            allow_registration: true,
        }
    }
}

/// `[uploads]` — avatar image storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    /// Directory for stored profile images. Unset → `<data dir>/profiles`.
    pub dir: Option<PathBuf>,
    /// Maximum accepted avatar size in bytes.
    pub max_avatar_bytes: usize,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_avatar_bytes: 2 * 1024 * 1024,
        }
    }
}

impl UploadsConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| data_dir().join("profiles"))
    }
}

/// `[client]` — session-bootstrap HTTP client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Extra attempts for idempotent requests after a transport failure.
    pub retry_attempts: u32,
    /// Linear backoff step between retries, in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            timeout_secs: 30,
            retry_attempts: 2,
            retry_backoff_ms: 1000,
        }
    }
}

impl Config {
    /// Load from an explicit path, or fall back to defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                let config: Config = toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Platform data directory for databases and uploads.
fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "inkpress", "inkpress")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".inkpress"))
}
