//! Configuration types.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,
}

impl Config {
    /// Load a single configuration file with no tier merging.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            bail!("auth.jwt_secret is not set (use TASK_RELAY_JWT_SECRET or a config file)");
        }
        if !(4..=31).contains(&self.auth.bcrypt_cost) {
            bail!("auth.bcrypt_cost must be between 4 and 31");
        }
        if self.scheduler.queue.max_attempts == 0 {
            bail!("scheduler.queue.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// HTTP listener and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("task-relay/tasks.db")
}

/// Token issuance and password hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret. Must be set.
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default = "default_access_minutes")]
    pub access_token_expire_minutes: i64,

    #[serde(default = "default_refresh_days")]
    pub refresh_token_expire_days: i64,

    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_expire_minutes: default_access_minutes(),
            refresh_token_expire_days: default_refresh_days(),
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

fn default_access_minutes() -> i64 {
    10
}

fn default_refresh_days() -> i64 {
    7
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

/// Which completion scheduler the server uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStrategy {
    /// Sleep in a spawned task of the web process.
    #[default]
    BoundDelay,
    /// Publish to the durable queue and let workers complete it.
    DurableQueue,
}

impl CompletionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStrategy::BoundDelay => "bound_delay",
            CompletionStrategy::DurableQueue => "durable_queue",
        }
    }
}

impl std::str::FromStr for CompletionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bound_delay" => Ok(CompletionStrategy::BoundDelay),
            "durable_queue" => Ok(CompletionStrategy::DurableQueue),
            other => bail!("unknown completion strategy '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: CompletionStrategy,

    /// Delay between task creation and automatic completion.
    #[serde(default = "default_completion_delay")]
    pub completion_delay_secs: u64,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: CompletionStrategy::default(),
            completion_delay_secs: default_completion_delay(),
            queue: QueueConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn completion_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.completion_delay_secs)
    }
}

fn default_completion_delay() -> u64 {
    10
}

/// Durable queue consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Workers started inside `serve` when the durable strategy is active.
    #[serde(default = "default_embedded_workers")]
    pub embedded_workers: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease length; an unacked message is redelivered after this.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long finished (`done` or `dead`) messages are kept before the
    /// sweep deletes them. 0 deletes them on the next sweep.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            embedded_workers: default_embedded_workers(),
            poll_interval_ms: default_poll_interval(),
            visibility_timeout_secs: default_visibility_timeout(),
            retry_after_secs: default_retry_after(),
            max_attempts: default_max_attempts(),
            retention_secs: default_retention(),
        }
    }
}

fn default_retention() -> u64 {
    24 * 60 * 60
}

fn default_queue_name() -> String {
    "default_queue".to_string()
}

fn default_embedded_workers() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    500
}

fn default_visibility_timeout() -> u64 {
    60
}

fn default_retry_after() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Require `?token=<access token>` matching the path user id.
    #[serde(default)]
    pub require_token: bool,
}
