//! Configuration system for agentloop.
//!
//! One YAML document carries the static agent roster, the keyword routing
//! table, grading and rerun thresholds, and storage settings. It is loaded
//! once at startup and shared read-only afterwards.

use eyre::Result;
use std::path::PathBuf;

pub use self::agents::{AgentRegistry, AgentSpec, RouteConfig};
pub use self::global::{Config, GraderConfig, RerunConfig, StorageConfig, StoreBackend};

mod agents;
mod global;

/// Load configuration from the standard search paths.
///
/// Search order:
/// 1. Explicit path if provided
/// 2. .agentloop.yml in current directory (project config)
/// 3. ~/.config/agentloop/agentloop.yml (user config)
/// 4. Default values
pub fn load_config(explicit_path: Option<&PathBuf>) -> Result<Config> {
    Config::load(explicit_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_default() {
        let config = load_config(None).unwrap();
        assert!(config.default_timeout_seconds > 0);
    }
}
