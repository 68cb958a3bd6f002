//! Step selection.
//!
//! Decides which agent runs next from the project's recommendation text:
//! - An explicit mention of a known agent id wins outright
//! - Otherwise the routing table is consulted in order
//! - Otherwise the default coordinating agent is used
//!
//! The chosen agent's dependencies must already be in `agents_involved`;
//! if not, selection reports Blocked instead of choosing someone else.

use crate::config::{AgentRegistry, Config};
use crate::selector::routing::{RoutingTable, tokenize};
use crate::store::ProjectState;

/// Why an agent was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReason {
    /// The recommendation named the agent
    ExplicitMention,
    /// A routing rule matched
    Route(String),
    /// Fell back to the coordinating agent
    Default,
}

/// Outcome of step selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Run this agent next.
    Agent { agent_id: String, reason: SelectionReason },

    /// The chosen agent is waiting on a dependency.
    Blocked { agent_id: String, missing: String },

    /// Nothing left to run.
    Terminal,
}

impl Selection {
    /// Agent id for a runnable selection.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Selection::Agent { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    /// Human-readable reason for a Blocked result.
    pub fn blocked_reason(&self) -> Option<String> {
        match self {
            Selection::Blocked { agent_id, missing } => {
                Some(format!("{} is waiting on dependency {}", agent_id, missing))
            }
            _ => None,
        }
    }
}

/// Pure selector over project state and static agent metadata.
#[derive(Debug)]
pub struct StepSelector {
    registry: AgentRegistry,
    routes: RoutingTable,
    default_agent: Option<String>,
}

impl StepSelector {
    pub fn new(registry: AgentRegistry, routes: RoutingTable, default_agent: Option<String>) -> Self {
        Self {
            registry,
            routes,
            default_agent,
        }
    }

    /// Build from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.registry(),
            RoutingTable::from_config(&config.routes),
            config.default_agent.clone(),
        )
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Choose the next agent. Same input, same output.
    pub fn select(&self, state: &ProjectState) -> Selection {
        let text = state.next_recommended_step.as_deref().unwrap_or("");
        let tokens = tokenize(text);

        let chosen = self
            .explicit_mention(&tokens)
            .map(|id| (id.to_string(), SelectionReason::ExplicitMention))
            .or_else(|| {
                self.routes
                    .route_tokens(&tokens)
                    .map(|m| (m.agent_id.to_string(), SelectionReason::Route(m.rule)))
            })
            .or_else(|| {
                self.default_agent
                    .as_ref()
                    .map(|id| (id.clone(), SelectionReason::Default))
            });

        let Some((agent_id, reason)) = chosen else {
            tracing::debug!(project = %state.project_id, "No rule matched and no default agent");
            return Selection::Terminal;
        };

        if let Some(missing) = self.first_missing_dependency(&agent_id, state) {
            tracing::debug!(
                project = %state.project_id,
                agent = %agent_id,
                missing = %missing,
                "Selected agent is blocked"
            );
            return Selection::Blocked { agent_id, missing };
        }

        tracing::debug!(project = %state.project_id, agent = %agent_id, reason = ?reason, "Selected agent");
        Selection::Agent { agent_id, reason }
    }

    /// First token that equals a known agent id, case-insensitively.
    fn explicit_mention(&self, tokens: &[String]) -> Option<&str> {
        tokens
            .iter()
            .find_map(|token| self.registry.ids().find(|id| id.to_lowercase() == *token))
    }

    fn first_missing_dependency(&self, agent_id: &str, state: &ProjectState) -> Option<String> {
        self.registry.get(agent_id).and_then(|spec| {
            spec.dependencies
                .iter()
                .find(|dep| !state.agents_involved.contains(*dep))
                .cloned()
        })
    }

    /// Agents whose dependencies are all satisfied, in id order.
    pub fn ready_agents(&self, state: &ProjectState) -> Vec<&str> {
        self.registry
            .ids()
            .filter(|id| self.first_missing_dependency(id, state).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSpec, RouteConfig};
    use crate::selector::routing::KeywordPredicate;
    use std::collections::BTreeMap;

    fn selector_with_default(default_agent: Option<&str>) -> StepSelector {
        let mut agents = BTreeMap::new();
        agents.insert("coordinator".to_string(), AgentSpec::new("coordinator", 60));
        agents.insert("nova".to_string(), AgentSpec::new("builder", 60));
        agents.insert("iris".to_string(), AgentSpec::new("ui", 60).depends_on(&["nova"]));
        agents.insert("scribe".to_string(), AgentSpec::new("docs", 60).depends_on(&["nova"]));
        agents.insert(
            "atlas".to_string(),
            AgentSpec::new("deploy", 60).depends_on(&["nova", "critic"]),
        );
        agents.insert("critic".to_string(), AgentSpec::new("review", 60));

        let routes = RoutingTable::from_config(&[
            RouteConfig::new(&["ui", "interface", "dashboard"], "iris"),
            RouteConfig::new(&["document"], "scribe"),
            RouteConfig::new(&["review", "feedback"], "critic"),
            RouteConfig::new(&["deploy"], "atlas"),
        ]);

        StepSelector::new(
            AgentRegistry::new(agents, 60),
            routes,
            default_agent.map(str::to_string),
        )
    }

    fn state_with(step: &str, involved: &[&str]) -> ProjectState {
        let mut state = ProjectState::new("p");
        state.next_recommended_step = Some(step.to_string());
        state.agents_involved = involved.iter().map(|a| a.to_string()).collect();
        state
    }

    #[test]
    fn test_explicit_mention_beats_routes() {
        let selector = selector_with_default(Some("coordinator"));
        // "dashboard" would route to iris, but nova is named
        let state = state_with("Run NOVA to build the dashboard", &[]);
        assert_eq!(
            selector.select(&state),
            Selection::Agent {
                agent_id: "nova".into(),
                reason: SelectionReason::ExplicitMention
            }
        );
    }

    #[test]
    fn test_explicit_mention_first_in_text_order() {
        let selector = selector_with_default(None);
        let state = state_with("critic then nova", &["nova"]);
        assert_eq!(selector.select(&state).agent_id(), Some("critic"));
    }

    #[test]
    fn test_routes_when_no_mention() {
        let selector = selector_with_default(Some("coordinator"));
        let state = state_with("Collect feedback from users", &[]);
        let selection = selector.select(&state);
        assert_eq!(selection.agent_id(), Some("critic"));
        assert!(matches!(
            selection,
            Selection::Agent {
                reason: SelectionReason::Route(_),
                ..
            }
        ));
    }

    #[test]
    fn test_default_when_nothing_matches() {
        let selector = selector_with_default(Some("coordinator"));
        let state = state_with("Think about it", &[]);
        assert_eq!(
            selector.select(&state),
            Selection::Agent {
                agent_id: "coordinator".into(),
                reason: SelectionReason::Default
            }
        );
    }

    #[test]
    fn test_terminal_without_default() {
        let selector = selector_with_default(None);
        assert_eq!(selector.select(&state_with("Think about it", &[])), Selection::Terminal);
        assert_eq!(selector.select(&ProjectState::new("p")), Selection::Terminal);
    }

    #[test]
    fn test_blocked_names_first_missing_dependency() {
        let selector = selector_with_default(Some("coordinator"));
        let state = state_with("deploy to prod", &[]);
        let selection = selector.select(&state);
        assert_eq!(
            selection,
            Selection::Blocked {
                agent_id: "atlas".into(),
                missing: "nova".into()
            }
        );
        assert_eq!(
            selection.blocked_reason().unwrap(),
            "atlas is waiting on dependency nova"
        );

        let state = state_with("deploy to prod", &["nova"]);
        assert_eq!(
            selector.select(&state),
            Selection::Blocked {
                agent_id: "atlas".into(),
                missing: "critic".into()
            }
        );
    }

    #[test]
    fn test_blocked_does_not_fall_through() {
        let selector = selector_with_default(Some("coordinator"));
        let state = state_with("polish the ui", &[]);
        assert!(matches!(selector.select(&state), Selection::Blocked { .. }));
    }

    #[test]
    fn test_dependencies_satisfied() {
        let selector = selector_with_default(Some("coordinator"));
        let state = state_with("deploy to prod", &["nova", "critic"]);
        assert_eq!(selector.select(&state).agent_id(), Some("atlas"));
    }

    #[test]
    fn test_select_is_pure() {
        let selector = selector_with_default(Some("coordinator"));
        for text in ["Run NOVA", "deploy", "write docs", "", "review ui"] {
            let state = state_with(text, &["nova"]);
            assert_eq!(selector.select(&state), selector.select(&state));
        }
    }

    #[test]
    fn test_custom_route_order_does_not_affect_mention() {
        let routes = RoutingTable::new().with_rule(KeywordPredicate::new(&["run"]), "critic");
        let selector = StepSelector::new(selector_with_default(None).registry().clone(), routes, None);
        let state = state_with("run nova", &[]);
        assert_eq!(selector.select(&state).agent_id(), Some("nova"));
    }

    #[test]
    fn test_ready_agents() {
        let selector = selector_with_default(None);
        let ready = selector.ready_agents(&ProjectState::new("p"));
        assert_eq!(ready, vec!["coordinator", "critic", "nova"]);
    }

    #[test]
    fn test_from_default_config() {
        let selector = StepSelector::from_config(&Config::default());
        let state = state_with("Ship the release", &["nova", "critic"]);
        assert_eq!(selector.select(&state).agent_id(), Some("atlas"));
    }
}
