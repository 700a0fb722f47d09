//! Configuration loader with tier-based merging.
//!
//! Tiers, lowest to highest: built-in defaults, the project
//! `./task-relay/config.yaml`, the user `~/.task-relay/config.yaml`, then
//! environment variables. An explicit file (`--config` or
//! `TASK_RELAY_CONFIG_PATH`) replaces the file tiers; environment variables
//! still apply on top.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File tier a config file was read from (lowest to highest priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Project = 1,
    User = 2,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var("TASK_RELAY_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".task-relay")));

        let project_dir = std::env::var("TASK_RELAY_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("task-relay")));

        Self {
            project_dir,
            user_dir,
        }
    }

    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }
}

/// Loads and merges configuration.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Files that contributed, in merge order.
    sources: Vec<(ConfigTier, PathBuf)>,
    /// Environment variables that overrode a value.
    env_overrides: Vec<&'static str>,
}

impl ConfigLoader {
    /// Load from discovered tiers, honouring `TASK_RELAY_CONFIG_PATH`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("TASK_RELAY_CONFIG_PATH").ok().map(PathBuf::from));
        Self::load_with(ConfigPaths::discover(), explicit.as_deref(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Load with explicit paths and an environment lookup.
    pub fn load_with(
        paths: ConfigPaths,
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut configs: Vec<Value> = Vec::new();
        let mut sources = Vec::new();

        configs.push(serde_json::to_value(Config::default())?);

        if let Some(path) = explicit {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let value: Value = serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?;
            configs.push(value);
            sources.push((ConfigTier::User, path.to_path_buf()));
        } else {
            let tiers = [
                (ConfigTier::Project, paths.project_dir.as_deref()),
                (ConfigTier::User, paths.user_dir.as_deref()),
            ];
            for (tier, dir) in tiers {
                let Some(dir) = dir else { continue };
                let file = dir.join("config.yaml");
                if let Some(value) = read_yaml(&file) {
                    configs.push(value);
                    sources.push((tier, file));
                }
            }
        }

        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged).context("Invalid configuration")?;

        let env_overrides = Self::apply_env_overrides(&mut config, env);

        for (tier, path) in &sources {
            debug!(tier = %tier, path = %path.display(), "Loaded config file");
        }

        Ok(Self {
            paths,
            config,
            sources,
            env_overrides,
        })
    }

    /// Apply `TASK_RELAY_*` overrides and return the names that took effect.
    /// Unparseable values are ignored with a warning.
    fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(db_path) = env("TASK_RELAY_DB_PATH") {
            config.server.db_path = PathBuf::from(db_path);
            applied.push("TASK_RELAY_DB_PATH");
        }

        if let Some(bind) = env("TASK_RELAY_BIND") {
            config.server.bind = bind;
            applied.push("TASK_RELAY_BIND");
        }

        if let Some(port) = env("TASK_RELAY_PORT") {
            match port.parse() {
                Ok(port) => {
                    config.server.port = port;
                    applied.push("TASK_RELAY_PORT");
                }
                Err(_) => warn!(value = %port, "Ignoring invalid TASK_RELAY_PORT"),
            }
        }

        if let Some(secret) = env("TASK_RELAY_JWT_SECRET") {
            config.auth.jwt_secret = secret;
            applied.push("TASK_RELAY_JWT_SECRET");
        }

        if let Some(strategy) = env("TASK_RELAY_STRATEGY") {
            match strategy.parse() {
                Ok(strategy) => {
                    config.scheduler.strategy = strategy;
                    applied.push("TASK_RELAY_STRATEGY");
                }
                Err(_) => warn!(value = %strategy, "Ignoring invalid TASK_RELAY_STRATEGY"),
            }
        }

        if let Some(delay) = env("TASK_RELAY_COMPLETION_DELAY_SECS") {
            match delay.parse() {
                Ok(delay) => {
                    config.scheduler.completion_delay_secs = delay;
                    applied.push("TASK_RELAY_COMPLETION_DELAY_SECS");
                }
                Err(_) => warn!(value = %delay, "Ignoring invalid TASK_RELAY_COMPLETION_DELAY_SECS"),
            }
        }

        applied
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn sources(&self) -> &[(ConfigTier, PathBuf)] {
        &self.sources
    }

    pub fn env_overrides(&self) -> &[&'static str] {
        &self.env_overrides
    }
}

/// Read a YAML file as JSON, skipping missing or malformed files.
fn read_yaml(path: &Path) -> Option<Value> {
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable config file skipped");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed config file skipped");
            None
        }
    }
}
