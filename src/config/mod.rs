//! Layered configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. Project file `./task-relay/config.yaml`
//! 3. User file `~/.task-relay/config.yaml`
//! 4. Environment variables
//! 5. Command-line flags (applied by the binary)
//!
//! ## Environment Variables
//! - `TASK_RELAY_CONFIG_PATH` - Explicit config file (replaces tiers 2 and 3)
//! - `TASK_RELAY_PROJECT_DIR` / `TASK_RELAY_USER_DIR` - Tier directories
//! - `TASK_RELAY_DB_PATH`, `TASK_RELAY_BIND`, `TASK_RELAY_PORT`
//! - `TASK_RELAY_JWT_SECRET`
//! - `TASK_RELAY_STRATEGY` - `bound_delay` or `durable_queue`
//! - `TASK_RELAY_COMPLETION_DELAY_SECS`

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::deep_merge;
pub use types::*;
