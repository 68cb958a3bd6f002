//! Global configuration.
//!
//! Loaded from an explicit path, ./.agentloop.yml or ~/.config/agentloop/agentloop.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::agents::{AgentRegistry, AgentSpec, RouteConfig};

/// Global configuration for agentloop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Agent roster keyed by id.
    pub agents: BTreeMap<String, AgentSpec>,

    /// Ordered keyword routing table.
    pub routes: Vec<RouteConfig>,

    /// Coordinating agent selected when nothing else matches.
    pub default_agent: Option<String>,

    /// Timeout for agents without their own.
    pub default_timeout_seconds: u64,

    /// Reflection grading thresholds.
    pub grader: GraderConfig,

    /// Rerun gating.
    pub rerun: RerunConfig,

    /// Storage settings.
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut agents = BTreeMap::new();
        agents.insert(
            "coordinator".to_string(),
            AgentSpec::new("coordinator", 120).unlocks(&["nova"]),
        );
        agents.insert(
            "nova".to_string(),
            AgentSpec::new("builder", 600)
                .produces(&["source"])
                .unlocks(&["iris", "scribe", "critic"]),
        );
        agents.insert(
            "iris".to_string(),
            AgentSpec::new("ui", 300).depends_on(&["nova"]).produces(&["ui"]),
        );
        agents.insert(
            "scribe".to_string(),
            AgentSpec::new("documentation", 300)
                .depends_on(&["nova"])
                .produces(&["docs"]),
        );
        agents.insert(
            "critic".to_string(),
            AgentSpec::new("review", 300)
                .depends_on(&["nova"])
                .produces(&["review"])
                .unlocks(&["atlas"]),
        );
        agents.insert(
            "atlas".to_string(),
            AgentSpec::new("deployment", 900)
                .depends_on(&["nova", "critic"])
                .produces(&["release"]),
        );

        Self {
            agents,
            routes: vec![
                RouteConfig::new(&["ui", "interface", "frontend"], "iris"),
                RouteConfig::new(&["document", "docs", "readme"], "scribe"),
                RouteConfig::new(&["review", "feedback"], "critic"),
                RouteConfig::new(&["deploy", "release", "ship"], "atlas"),
                RouteConfig::new(&["build", "implement", "code"], "nova"),
            ],
            default_agent: Some("coordinator".to_string()),
            default_timeout_seconds: 300,
            grader: GraderConfig::default(),
            rerun: RerunConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .agentloop.yml in current directory
    /// 3. ~/.config/agentloop/agentloop.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(".agentloop.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from .agentloop.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load .agentloop.yml: {}", e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentloop").join("agentloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-references and thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_seconds == 0 {
            eyre::bail!("default-timeout-seconds must be > 0");
        }
        if let Some(default) = &self.default_agent
            && !self.agents.contains_key(default)
        {
            eyre::bail!("default-agent '{}' is not a configured agent", default);
        }
        for (id, spec) in &self.agents {
            for dep in &spec.dependencies {
                if !self.agents.contains_key(dep) {
                    eyre::bail!("agent '{}' depends on unknown agent '{}'", id, dep);
                }
                if dep == id {
                    eyre::bail!("agent '{}' depends on itself", id);
                }
            }
            for unlocked in &spec.unlocks {
                if !self.agents.contains_key(unlocked) {
                    eyre::bail!("agent '{}' unlocks unknown agent '{}'", id, unlocked);
                }
            }
        }
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !self.agents.contains_key(&route.agent) {
                eyre::bail!("route targets unknown agent '{}'", route.agent);
            }
            if route.keywords.iter().all(|k| k.trim().is_empty()) {
                eyre::bail!("route to '{}' has no keywords", route.agent);
            }
            for keyword in &route.keywords {
                if !seen.insert(keyword.to_lowercase()) {
                    log::warn!("keyword '{}' appears in more than one route; first wins", keyword);
                }
            }
        }
        if !(0.0..=1.0).contains(&self.grader.weak_threshold) {
            eyre::bail!("grader.weak-threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.rerun.score_threshold) {
            eyre::bail!("rerun.score-threshold must be within [0, 1]");
        }
        Ok(())
    }

    /// Build the immutable agent lookup.
    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::new(self.agents.clone(), self.default_timeout_seconds)
    }
}

/// Reflection grading thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct GraderConfig {
    /// Scores below this are weak.
    pub weak_threshold: f64,

    /// Confidence below this is deducted.
    pub min_confidence: f64,

    /// Minimum fraction of goal keywords that must appear in the summary.
    pub overlap_threshold: f64,

    pub min_summary_len: usize,
    pub max_summary_len: usize,

    /// Tag that marks a reflection as referencing the loop.
    pub loop_tag: String,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            weak_threshold: 0.6,
            min_confidence: 0.6,
            overlap_threshold: 0.25,
            min_summary_len: 50,
            max_summary_len: 1000,
            loop_tag: "loop".to_string(),
        }
    }
}

/// Rerun gating.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RerunConfig {
    /// Reruns allowed per (agent, iteration chain) before forcing proceed.
    pub max_reruns: u32,

    /// Scores below this request a rerun.
    pub score_threshold: f64,

    /// Fatigue at or above this level is recorded as a warning.
    pub fatigue_warn_level: f64,
}

impl Default for RerunConfig {
    fn default() -> Self {
        Self {
            max_reruns: 2,
            score_threshold: 0.6,
            fatigue_warn_level: 0.8,
        }
    }
}

/// Which store backend to open.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Taskstore,
}

/// Storage settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    pub backend: StoreBackend,

    /// Explicit store directory; defaults to a per-workspace data dir.
    pub dir: Option<PathBuf>,
}
