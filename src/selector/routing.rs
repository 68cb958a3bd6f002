//! Ordered keyword routing table.
//!
//! Each rule pairs a predicate over the tokenized recommendation text with
//! the agent it selects. Rules are evaluated in order and the first match
//! wins, so the table is testable without the rest of selection.

use crate::config::RouteConfig;

/// Predicate over a tokenized recommendation.
pub trait RoutePredicate: Send + Sync + std::fmt::Debug {
    /// Check whether the tokens satisfy this predicate.
    fn matches(&self, tokens: &[String]) -> bool;

    /// Short description for logs and selection reasons.
    fn describe(&self) -> String;
}

/// Matches when any keyword matches a token by prefix.
///
/// Prefix matching lets `deploy` match `deployment` while `ui` never matches
/// inside `build`. Keywords with whitespace match as a phrase.
#[derive(Debug, Clone)]
pub struct KeywordPredicate {
    keywords: Vec<String>,
}

impl KeywordPredicate {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl RoutePredicate for KeywordPredicate {
    fn matches(&self, tokens: &[String]) -> bool {
        let mut phrase: Option<String> = None;
        self.keywords.iter().any(|keyword| {
            if keyword.contains(char::is_whitespace) {
                let joined = phrase.get_or_insert_with(|| tokens.join(" "));
                let normalized = tokenize(keyword).join(" ");
                joined.contains(&normalized)
            } else {
                tokens.iter().any(|t| t.starts_with(keyword.as_str()))
            }
        })
    }

    fn describe(&self) -> String {
        format!("keywords[{}]", self.keywords.join("|"))
    }
}

/// A single routing rule.
#[derive(Debug)]
pub struct RoutingRule {
    pub predicate: Box<dyn RoutePredicate>,
    pub agent_id: String,
}

/// Result of routing a recommendation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub agent_id: &'a str,
    pub rule_index: usize,
    pub rule: String,
}

/// Ordered `(predicate, agent)` pairs; first match wins.
#[derive(Debug, Default)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config entries, preserving order.
    pub fn from_config(routes: &[RouteConfig]) -> Self {
        let mut table = Self::new();
        for route in routes {
            table.push(KeywordPredicate::new(&route.keywords), &route.agent);
        }
        table
    }

    /// Append a rule at the lowest priority.
    pub fn push(&mut self, predicate: impl RoutePredicate + 'static, agent_id: &str) {
        self.rules.push(RoutingRule {
            predicate: Box::new(predicate),
            agent_id: agent_id.to_string(),
        });
    }

    /// Builder form of `push`.
    pub fn with_rule(mut self, predicate: impl RoutePredicate + 'static, agent_id: &str) -> Self {
        self.push(predicate, agent_id);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate rules in order against pre-tokenized text.
    pub fn route_tokens(&self, tokens: &[String]) -> Option<RouteMatch<'_>> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.predicate.matches(tokens))
            .map(|(rule_index, rule)| RouteMatch {
                agent_id: &rule.agent_id,
                rule_index,
                rule: rule.predicate.describe(),
            })
    }

    /// Evaluate rules in order against free text.
    pub fn route(&self, text: &str) -> Option<RouteMatch<'_>> {
        self.route_tokens(&tokenize(text))
    }
}

/// Lowercase tokens split on anything other than alphanumerics, `-` and `_`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
