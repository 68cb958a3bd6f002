//! Defensive decoding of worker self-reflections.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::selector::tokenize;

/// Words ignored when extracting goal keywords.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "then", "than", "are", "was", "were", "will",
    "have", "has", "had", "not", "but", "all", "any", "can", "our", "its", "out", "use", "using", "should", "must",
    "make", "sure", "also", "each", "more", "some", "such", "about", "after", "before", "over", "under", "your", "you",
];

/// A reflection payload after decoding.
///
/// Missing or mistyped required fields fall back to empty values and clear
/// `schema_ok`; decoding itself never fails.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reflection {
    pub summary: String,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub goal: Option<String>,
    pub agent_id: Option<String>,
    pub schema_ok: bool,

    /// Required fields that were missing or had the wrong type
    pub schema_errors: Vec<String>,
}

impl Reflection {
    /// Decode a raw payload.
    pub fn decode(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self {
                schema_errors: vec!["payload is not an object".to_string()],
                ..Default::default()
            };
        };

        let mut errors = Vec::new();

        let summary = match obj.get("summary") {
            Some(Value::String(s)) => s.clone(),
            _ => {
                errors.push("summary".to_string());
                String::new()
            }
        };

        let confidence = match obj.get("confidence").and_then(Value::as_f64) {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            _ => {
                errors.push("confidence".to_string());
                0.0
            }
        };

        let tags = match obj.get("tags") {
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::Array(items)) => {
                errors.push("tags".to_string());
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            }
            _ => {
                errors.push("tags".to_string());
                Vec::new()
            }
        };

        let goal = obj
            .get("goal")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string);

        let agent_id = obj
            .get("agent_id")
            .or_else(|| obj.get("agent"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            summary,
            confidence,
            tags,
            goal,
            agent_id,
            schema_ok: errors.is_empty(),
            schema_errors: errors,
        }
    }

    /// True when any tag references the loop: `loop`, `loop:<..>` or `loop-<..>`.
    pub fn has_loop_tag(&self, loop_tag: &str) -> bool {
        let loop_tag = loop_tag.to_lowercase();
        self.tags.iter().any(|tag| {
            let tag = tag.trim().to_lowercase();
            tag == loop_tag
                || tag
                    .strip_prefix(loop_tag.as_str())
                    .is_some_and(|rest| rest.starts_with(':') || rest.starts_with('-'))
        })
    }
}

/// Distinct goal keywords: tokens of at least three characters, minus stopwords.
pub fn goal_keywords(goal: &str) -> BTreeSet<String> {
    tokenize(goal)
        .into_iter()
        .filter(|t| t.chars().count() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Fraction of goal keywords present in the summary.
///
/// A keyword counts when some summary token starts with it, so `deploy`
/// is found in `deployed`. Returns `None` when the goal has no keywords.
pub fn keyword_overlap(summary: &str, goal: &str) -> Option<f64> {
    let keywords = goal_keywords(goal);
    if keywords.is_empty() {
        return None;
    }
    let tokens = tokenize(summary);
    let hits = keywords
        .iter()
        .filter(|k| tokens.iter().any(|t| t.starts_with(k.as_str())))
        .count();
    Some(hits as f64 / keywords.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_complete_payload() {
        let r = Reflection::decode(&json!({
            "summary": "Built the parser",
            "confidence": 0.9,
            "tags": ["loop", "parser"],
            "goal": "Build a parser",
            "agent_id": "nova"
        }));
        assert!(r.schema_ok);
        assert_eq!(r.summary, "Built the parser");
        assert_eq!(r.confidence, 0.9);
        assert_eq!(r.tags, vec!["loop", "parser"]);
        assert_eq!(r.goal.as_deref(), Some("Build a parser"));
        assert_eq!(r.agent_id.as_deref(), Some("nova"));
    }

    #[test]
    fn test_decode_mistyped_fields() {
        let r = Reflection::decode(&json!({
            "summary": 42,
            "confidence": "high",
            "tags": ["loop", 7]
        }));
        assert!(!r.schema_ok);
        assert_eq!(r.schema_errors, vec!["summary", "confidence", "tags"]);
        assert_eq!(r.summary, "");
        assert_eq!(r.confidence, 0.0);
        // String entries survive a partially bad list
        assert_eq!(r.tags, vec!["loop"]);
    }

    #[test]
    fn test_decode_non_object() {
        for raw in [json!(null), json!("text"), json!([1, 2]), json!(0.4)] {
            let r = Reflection::decode(&raw);
            assert!(!r.schema_ok);
            assert!(r.tags.is_empty());
        }
    }

    #[test]
    fn test_confidence_clamped() {
        let r = Reflection::decode(&json!({"summary": "", "confidence": 3.5, "tags": []}));
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn test_blank_goal_is_none() {
        let r = Reflection::decode(&json!({"summary": "", "confidence": 1, "tags": [], "goal": "   "}));
        assert!(r.goal.is_none());
        assert!(r.schema_ok);
    }

    #[test]
    fn test_loop_tag_variants() {
        let with = |tags: &[&str]| Reflection {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        assert!(with(&["LOOP"]).has_loop_tag("loop"));
        assert!(with(&["x", "loop:3"]).has_loop_tag("loop"));
        assert!(with(&["loop-review"]).has_loop_tag("loop"));
        assert!(!with(&["loops"]).has_loop_tag("loop"));
        assert!(!with(&[]).has_loop_tag("loop"));
    }

    #[test]
    fn test_goal_keywords_drop_short_and_stopwords() {
        let kw = goal_keywords("Build the UI for a login page");
        assert_eq!(
            kw.into_iter().collect::<Vec<_>>(),
            vec!["build", "login", "page"]
        );
    }

    #[test]
    fn test_keyword_overlap() {
        let overlap = keyword_overlap("Deployed the login service", "deploy login page").unwrap();
        assert!((overlap - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(keyword_overlap("anything", "to a an"), None);
        assert_eq!(keyword_overlap("", "deploy"), Some(0.0));
    }
}
