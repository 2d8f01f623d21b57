//! Validation policy configuration.
//!
//! Global defaults plus per-operation overrides, keyed by the
//! operation key derived from the ambient scope string.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One rule the checker can enforce, referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub text: String,
}

impl ValidationRule {
    /// Rule with an id and human-readable text.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Per-operation policy overrides. Unset fields fall back to the
/// global [`ValidationOptions`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// Restrict the checker to these rule ids.
    pub rule_ids: Option<Vec<String>>,
    pub enable_checker: Option<bool>,
    pub max_retries: Option<u32>,
    pub ask_failure_reason: Option<bool>,
}

/// Global validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOptions {
    /// Master switch; off makes the wrapper a passthrough.
    pub enabled: bool,
    pub enable_checker: bool,
    /// Retries after the first attempt; total attempts are
    /// `max_retries + 1`.
    pub max_retries: u32,
    /// Issue a single-turn diagnosis call on terminal failure.
    pub ask_failure_reason: bool,
    /// Hand terminally-failed calls to the fallback controller.
    pub enable_fallback: bool,
    /// Roles whose calls bypass validation entirely.
    pub skip_roles: Vec<String>,
    /// Rule catalog offered to the checker.
    pub rules: Vec<ValidationRule>,
    /// Per-operation overrides keyed by operation key.
    pub operations: HashMap<String, OperationPolicy>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_checker: false,
            max_retries: 2,
            ask_failure_reason: false,
            enable_fallback: true,
            skip_roles: vec!["response_checker".to_string(), "summarizer".to_string()],
            rules: Vec::new(),
            operations: HashMap::new(),
        }
    }
}

/// Effective per-call policy after merging overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub operation_key: String,
    pub enable_checker: bool,
    pub max_retries: u32,
    pub ask_failure_reason: bool,
    pub rule_ids: Option<Vec<String>>,
}

impl ValidationOptions {
    /// Register a per-operation override.
    pub fn with_operation(mut self, key: impl Into<String>, policy: OperationPolicy) -> Self {
        self.operations.insert(key.into(), policy);
        self
    }

    /// Whether calls issued by `role` skip validation.
    pub fn skips_role(&self, role: Option<&str>) -> bool {
        match role {
            Some(role) => self.skip_roles.iter().any(|r| r == role),
            None => false,
        }
    }

    /// Merge global defaults with the operation override for `scope`.
    pub fn policy_for_scope(&self, scope: &str) -> EffectivePolicy {
        let key = operation_key(scope);
        let op = self.operations.get(&key);
        EffectivePolicy {
            operation_key: key,
            enable_checker: op
                .and_then(|o| o.enable_checker)
                .unwrap_or(self.enable_checker),
            max_retries: op.and_then(|o| o.max_retries).unwrap_or(self.max_retries),
            ask_failure_reason: op
                .and_then(|o| o.ask_failure_reason)
                .unwrap_or(self.ask_failure_reason),
            rule_ids: op.and_then(|o| o.rule_ids.clone()),
        }
    }

    /// The rule set visible to the checker for a policy.
    pub fn rules_for(&self, policy: &EffectivePolicy) -> Vec<&ValidationRule> {
        match &policy.rule_ids {
            Some(ids) => self
                .rules
                .iter()
                .filter(|rule| ids.contains(&rule.id))
                .collect(),
            None => self.rules.iter().collect(),
        }
    }
}

/// Map an ambient scope to its operation key.
///
/// Scopes shaped `tests/<group>/<model>` resolve to `test_<group>`,
/// lowercased with non-alphanumerics replaced by `_`. Every other
/// scope is its own key.
pub fn operation_key(scope: &str) -> String {
    let mut parts = scope.splitn(3, '/');
    if parts.next() == Some("tests") {
        if let Some(group) = parts.next() {
            let normalized: String = group
                .to_lowercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            return format!("test_{normalized}");
        }
    }
    scope.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_key_for_tests_scope() {
        assert_eq!(operation_key("tests/base/gpt-4o"), "test_base");
        assert_eq!(operation_key("tests/TTS-Json/llama3.3"), "test_tts_json");
        assert_eq!(operation_key("tests/fx"), "test_fx");
    }

    #[test]
    fn test_operation_key_passthrough() {
        assert_eq!(
            operation_key("story/add_voice_tags_to_story"),
            "story/add_voice_tags_to_story"
        );
        assert_eq!(operation_key("story/generate"), "story/generate");
    }

    #[test]
    fn test_policy_merging() {
        let options = ValidationOptions::default().with_operation(
            "test_base",
            OperationPolicy {
                enable_checker: Some(true),
                max_retries: Some(5),
                ..Default::default()
            },
        );

        let merged = options.policy_for_scope("tests/base/gpt-4o");
        assert!(merged.enable_checker);
        assert_eq!(merged.max_retries, 5);
        assert!(!merged.ask_failure_reason);

        let default = options.policy_for_scope("story/generate");
        assert!(!default.enable_checker);
        assert_eq!(default.max_retries, 2);
    }

    #[test]
    fn test_skip_roles() {
        let options = ValidationOptions::default();
        assert!(options.skips_role(Some("response_checker")));
        assert!(options.skips_role(Some("summarizer")));
        assert!(!options.skips_role(Some("writer")));
        assert!(!options.skips_role(None));
    }

    #[test]
    fn test_rule_filtering() {
        let mut options = ValidationOptions::default();
        options.rules = vec![
            ValidationRule::new("r1", "no empty output"),
            ValidationRule::new("r2", "stay in character"),
        ];
        let options = options.with_operation(
            "story/generate",
            OperationPolicy {
                rule_ids: Some(vec!["r2".to_string()]),
                ..Default::default()
            },
        );

        let policy = options.policy_for_scope("story/generate");
        let rules = options.rules_for(&policy);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r2");

        let policy = options.policy_for_scope("story/other");
        assert_eq!(options.rules_for(&policy).len(), 2);
    }
}
