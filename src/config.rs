//! Configuration: one JSON file selecting a profile.
//!
//! Three profiles exist: `standalone` runs the engine only, `server` adds
//! the HTTP API, and `client` points a CLI at a remote server. Engine
//! options default to the documented values when omitted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{
    DEFAULT_BLOCK_STEP_TIME, DEFAULT_CONCURRENT_STEPS, DEFAULT_MAX_BLOCKING_TIME,
    DEFAULT_MAX_SUCCESSIVE_ATTEMPTS, EngineConfig,
};
use crate::executor::DEFAULT_HOST_TIMEOUT;

// ============================================================================
// Exit codes
// ============================================================================

/// Clean exit.
pub const EXIT_OK: i32 = 0;
/// Bad command-line arguments.
pub const EXIT_BAD_ARGS: i32 = 2;
/// Unrecoverable startup failure (store unreachable, bad TLS material).
pub const EXIT_STARTUP: i32 = 3;
/// Running but terminated by a signal.
pub const EXIT_SIGNAL: i32 = 4;

// ============================================================================
// Shapes
// ============================================================================

fn default_host_timeout() -> f64 {
    DEFAULT_HOST_TIMEOUT.as_secs_f64()
}

fn default_max_successive_attempts() -> u32 {
    DEFAULT_MAX_SUCCESSIVE_ATTEMPTS
}

fn default_concurrent_steps() -> usize {
    DEFAULT_CONCURRENT_STEPS
}

fn default_max_blocking_time() -> f64 {
    DEFAULT_MAX_BLOCKING_TIME.as_secs_f64()
}

fn default_block_step_time() -> f64 {
    DEFAULT_BLOCK_STEP_TIME.as_secs_f64()
}

/// Engine options shared by the standalone and server profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    pub database_uri: String,
    #[serde(default = "default_host_timeout")]
    pub host_timeout_upper_bound: f64,
    #[serde(default = "default_max_successive_attempts")]
    pub max_successive_attempts: u32,
    #[serde(default = "default_concurrent_steps")]
    pub concurrent_steps: usize,
    #[serde(default = "default_max_blocking_time")]
    pub max_blocking_time: f64,
    #[serde(default = "default_block_step_time")]
    pub block_step_time: f64,
    #[serde(default)]
    pub read_only_mode: bool,
}

impl EngineOptions {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            concurrent_steps: self.concurrent_steps,
            max_successive_attempts: self.max_successive_attempts,
            block_step_time: Duration::from_secs_f64(self.block_step_time),
            max_blocking_time: Duration::from_secs_f64(self.max_blocking_time),
            read_only: self.read_only_mode,
        }
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.host_timeout_upper_bound)
    }
}

/// TLS material. Accepted in the config shape so a deployment can front
/// the listener; the binary itself serves plain TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    #[serde(flatten)]
    pub engine: EngineOptions,
    pub listen: ListenConfig,
    pub auth_token_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandaloneProfile {
    #[serde(flatten)]
    pub engine: EngineOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub url: String,
    pub token: String,
}

/// The whole config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum Config {
    Standalone(StandaloneProfile),
    Server(ServerProfile),
    Client(ClientProfile),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {cause}")]
    Unreadable { path: String, cause: String },
    #[error("cannot parse config {path}: {cause}")]
    Invalid { path: String, cause: String },
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Unreadable {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Invalid {
            path: path.display().to_string(),
            cause: e.to_string(),
        })
    }

    pub fn profile_name(&self) -> &'static str {
        match self {
            Config::Standalone(_) => "standalone",
            Config::Server(_) => "server",
            Config::Client(_) => "client",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
