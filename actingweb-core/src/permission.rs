//! Permission evaluator (spec §4.1).
//!
//! Fail-closed: anything the evaluator can't positively allow is denied.
//! Patterns use `globset`'s standard syntax (Open Question 3, SPEC_FULL.md
//! §C.3) — `*` does not cross `/`, `**` does.

use std::collections::HashMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::types::strip_list_prefix;

/// Outcome of a single permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResult {
    Allowed,
    Denied,
    /// No rule addressed the path and no default applies. Treated as
    /// `Denied` at every enforcement point (fail-closed, spec §4.1).
    NotApplicable,
}

impl PermissionResult {
    pub fn is_allowed(self) -> bool {
        matches!(self, PermissionResult::Allowed)
    }
}

/// One rule in a permission set: a glob pattern, an operation set, and
/// whether matching it allows or denies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_pattern: Option<String>,
    pub operations: Vec<String>,
    #[serde(default = "default_allow")]
    pub allow: bool,
}

fn default_allow() -> bool {
    true
}

/// A peer's full permission grant for one target, e.g. `properties` or
/// `methods` (spec §3, §4.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    pub rules: Vec<PermissionRule>,
}

/// Compiled form of a [`PermissionSet`], ready to evaluate paths. Rules are
/// evaluated in order; the first matching rule (pattern matches and
/// excluded_pattern doesn't, and the operation is listed) decides the
/// outcome.
pub struct PermissionEvaluator {
    compiled: Vec<CompiledRule>,
}

struct CompiledRule {
    include: GlobSet,
    exclude: Option<GlobSet>,
    operations: Vec<String>,
    allow: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionCompileError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

impl PermissionEvaluator {
    pub fn compile(set: &PermissionSet) -> Result<Self, PermissionCompileError> {
        let mut compiled = Vec::with_capacity(set.rules.len());
        for rule in &set.rules {
            let include = single_glob_set(&rule.pattern)?;
            let exclude = rule
                .excluded_pattern
                .as_deref()
                .map(single_glob_set)
                .transpose()?;
            compiled.push(CompiledRule {
                include,
                exclude,
                operations: rule.operations.clone(),
                allow: rule.allow,
            });
        }
        Ok(PermissionEvaluator { compiled })
    }

    /// Evaluate whether `operation` is permitted on `path` (the `list:`
    /// prefix, if present, is stripped before matching — spec §4.1).
    pub fn evaluate(&self, path: &str, operation: &str) -> PermissionResult {
        let path = strip_list_prefix(path);
        for rule in &self.compiled {
            if !rule.operations.iter().any(|op| op == operation || op == "*") {
                continue;
            }
            if !rule.include.is_match(path) {
                continue;
            }
            if let Some(exclude) = &rule.exclude {
                if exclude.is_match(path) {
                    continue;
                }
            }
            return if rule.allow {
                PermissionResult::Allowed
            } else {
                PermissionResult::Denied
            };
        }
        PermissionResult::NotApplicable
    }
}

fn single_glob_set(pattern: &str) -> Result<GlobSet, PermissionCompileError> {
    let glob = Glob::new(pattern).map_err(|source| PermissionCompileError::InvalidGlob {
        pattern: pattern.to_string(),
        source,
    })?;
    let mut builder = GlobSetBuilder::new();
    builder.add(glob);
    builder
        .build()
        .map_err(|source| PermissionCompileError::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })
}

/// Filters an outbound JSON object's top-level keys by permission, per spec
/// §4.3 / the original's `_filter_subscription_data_by_permissions`: drop
/// denied keys, return `None` if every key is denied, or if the evaluator
/// isn't available.
pub fn filter_by_permission(
    evaluator: Option<&PermissionEvaluator>,
    target: &str,
    data: &serde_json::Map<String, serde_json::Value>,
    operation: &str,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let evaluator = evaluator?;
    let mut out = serde_json::Map::new();
    for (key, value) in data {
        let path = format!("{target}/{key}");
        if evaluator.evaluate(&path, operation).is_allowed() {
            out.insert(key.clone(), value.clone());
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Per-peer table of compiled evaluators, keyed by target (`properties`,
/// `methods`, ...). Built once per trust and cached by the trust engine.
#[derive(Default)]
pub struct PeerPermissions {
    by_target: HashMap<String, PermissionEvaluator>,
}

impl PeerPermissions {
    pub fn insert(&mut self, target: impl Into<String>, evaluator: PermissionEvaluator) {
        self.by_target.insert(target.into(), evaluator);
    }

    pub fn for_target(&self, target: &str) -> Option<&PermissionEvaluator> {
        self.by_target.get(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, ops: &[&str], allow: bool) -> PermissionRule {
        PermissionRule {
            pattern: pattern.to_string(),
            excluded_pattern: None,
            operations: ops.iter().map(|s| s.to_string()).collect(),
            allow,
        }
    }

    #[test]
    fn allows_matching_pattern_and_operation() {
        let set = PermissionSet {
            rules: vec![rule("properties/*", &["read"], true)],
        };
        let evaluator = PermissionEvaluator::compile(&set).unwrap();
        assert_eq!(
            evaluator.evaluate("properties/email", "read"),
            PermissionResult::Allowed
        );
    }

    #[test]
    fn wrong_operation_is_not_applicable() {
        let set = PermissionSet {
            rules: vec![rule("properties/*", &["read"], true)],
        };
        let evaluator = PermissionEvaluator::compile(&set).unwrap();
        assert_eq!(
            evaluator.evaluate("properties/email", "write"),
            PermissionResult::NotApplicable
        );
    }

    #[test]
    fn excluded_pattern_takes_priority_over_include() {
        let set = PermissionSet {
            rules: vec![PermissionRule {
                pattern: "properties/**".to_string(),
                excluded_pattern: Some("properties/secret".to_string()),
                operations: vec!["read".to_string()],
                allow: true,
            }],
        };
        let evaluator = PermissionEvaluator::compile(&set).unwrap();
        assert_eq!(
            evaluator.evaluate("properties/secret", "read"),
            PermissionResult::NotApplicable
        );
        assert_eq!(
            evaluator.evaluate("properties/email", "read"),
            PermissionResult::Allowed
        );
    }

    #[test]
    fn star_does_not_cross_slash() {
        let set = PermissionSet {
            rules: vec![rule("properties/*", &["read"], true)],
        };
        let evaluator = PermissionEvaluator::compile(&set).unwrap();
        assert_eq!(
            evaluator.evaluate("properties/nested/email", "read"),
            PermissionResult::NotApplicable
        );
    }

    #[test]
    fn filter_drops_denied_keys_and_none_if_all_denied() {
        let set = PermissionSet {
            rules: vec![rule("properties/allowed", &["read"], true)],
        };
        let evaluator = PermissionEvaluator::compile(&set).unwrap();
        let mut data = serde_json::Map::new();
        data.insert("allowed".into(), serde_json::json!(1));
        data.insert("denied".into(), serde_json::json!(2));

        let filtered = filter_by_permission(Some(&evaluator), "properties", &data, "read").unwrap();
        assert!(filtered.contains_key("allowed"));
        assert!(!filtered.contains_key("denied"));

        let mut all_denied = serde_json::Map::new();
        all_denied.insert("denied".into(), serde_json::json!(2));
        assert!(filter_by_permission(Some(&evaluator), "properties", &all_denied, "read").is_none());
    }

    #[test]
    fn filter_is_none_with_no_evaluator() {
        let mut data = serde_json::Map::new();
        data.insert("anything".into(), serde_json::json!(1));
        assert!(filter_by_permission(None, "properties", &data, "read").is_none());
    }
}
