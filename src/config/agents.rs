//! Static per-agent metadata.
//!
//! Loaded once per process and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata for one worker.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentSpec {
    /// Free-form role name (builder, reviewer, ...)
    pub role: String,

    /// Agents that must have completed a step before this one may run
    pub dependencies: Vec<String>,

    /// Artifacts this agent is expected to produce
    pub produces: Vec<String>,

    /// Agents this one makes available once it completes
    pub unlocks: Vec<String>,

    /// Seconds a run may stay `running` before it is reported frozen
    pub timeout_seconds: u64,
}

impl AgentSpec {
    pub fn new(role: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            role: role.into(),
            timeout_seconds,
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, agents: &[&str]) -> Self {
        self.dependencies = agents.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn produces(mut self, artifacts: &[&str]) -> Self {
        self.produces = artifacts.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn unlocks(mut self, agents: &[&str]) -> Self {
        self.unlocks = agents.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// One routing table entry as written in config.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Any of these keywords selects `agent`
    pub keywords: Vec<String>,
    pub agent: String,
}

impl RouteConfig {
    pub fn new(keywords: &[&str], agent: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            agent: agent.to_string(),
        }
    }
}

/// Immutable lookup over the configured agents.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentSpec>,
    default_timeout_seconds: u64,
}

impl AgentRegistry {
    pub fn new(agents: BTreeMap<String, AgentSpec>, default_timeout_seconds: u64) -> Self {
        Self {
            agents,
            default_timeout_seconds,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Agent ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Timeout for an agent, falling back to the default for unknown ids.
    pub fn timeout_for(&self, agent_id: &str) -> u64 {
        self.agents
            .get(agent_id)
            .map(|a| a.timeout_seconds)
            .filter(|t| *t > 0)
            .unwrap_or(self.default_timeout_seconds)
    }

    /// Agents listing `agent_id` in their `unlocks`.
    pub fn unlocked_by(&self, agent_id: &str) -> Vec<&str> {
        self.agents
            .get(agent_id)
            .map(|a| a.unlocks.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}
