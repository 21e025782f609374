// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Declarative policy engine: evaluates triggers against step output and
//! applies redaction, approval injection, blocking, or alerting actions.

use crate::expr::eval_condition;
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn builtin_patterns() -> &'static HashMap<&'static str, &'static str> {
    static PATTERNS: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("email", r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}");
        m.insert("phone", r"[\+]?[(]?[0-9]{1,4}[)]?[-\s\./0-9]{7,15}");
        m.insert("ssn", r"\b\d{3}-\d{2}-\d{4}\b");
        m.insert("credit_card", r"\b(?:\d[ \-]*?){13,19}\b");
        m
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPattern {
    #[serde(rename = "type")]
    pub kind: String,
    pub pattern: Option<String>,
}

fn pattern_regex(pattern: &PolicyPattern) -> crate::error::Result<Regex> {
    let source = if pattern.kind == "regex" {
        pattern
            .pattern
            .as_deref()
            .ok_or_else(|| crate::error::SandcastleError::other("regex pattern requires a 'pattern' field"))?
    } else {
        builtin_patterns().get(pattern.kind.as_str()).copied().ok_or_else(|| {
            crate::error::SandcastleError::other(format!("unknown pattern type '{}'", pattern.kind))
        })?
    };
    Regex::new(source).map_err(|e| crate::error::SandcastleError::other(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTrigger {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub patterns: Option<Vec<PolicyPattern>>,
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub apply_to: Option<Vec<String>>,
    #[serde(default)]
    pub approval_config: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub notify: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub id: String,
    pub trigger: PolicyTrigger,
    pub action: PolicyAction,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_severity")]
    pub severity: String,
}

fn default_severity() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone)]
pub struct PolicyViolation {
    pub policy_id: String,
    pub severity: String,
    pub trigger_details: String,
    pub action_taken: String,
    pub output_modified: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEvalResult {
    pub violations: Vec<PolicyViolation>,
    pub modified_output: Value,
    pub redacted_output: Value,
    pub should_inject_approval: bool,
    pub approval_config: Option<serde_json::Value>,
    pub should_block: bool,
    pub block_reason: Option<String>,
}

/// Context visible to condition expressions and policy message templates.
pub struct PolicyContext<'a> {
    pub step_id: &'a str,
    pub run_id: &'a str,
    pub total_cost_usd: f64,
    pub input: &'a Value,
}

pub struct PolicyEngine {
    policies: Vec<PolicyDefinition>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<PolicyDefinition>) -> Self {
        Self { policies }
    }

    pub async fn evaluate(
        &self,
        output: &Value,
        ctx: &PolicyContext<'_>,
        step_cost_usd: f64,
    ) -> crate::error::Result<PolicyEvalResult> {
        let mut violations = Vec::new();
        let mut modified_output = output.clone();
        let mut should_inject_approval = false;
        let mut approval_config = None;
        let mut should_block = false;
        let mut block_reason = None;
        let mut redact_targets: HashSet<String> = HashSet::new();

        for policy in &self.policies {
            let (matched, details) = self.check_trigger(policy, &modified_output, ctx, step_cost_usd)?;
            if !matched {
                continue;
            }

            let mut violation = PolicyViolation {
                policy_id: policy.id.clone(),
                severity: policy.severity.clone(),
                trigger_details: details,
                action_taken: policy.action.kind.clone(),
                output_modified: false,
            };

            match policy.action.kind.as_str() {
                "redact" => {
                    modified_output = apply_redaction(
                        &modified_output,
                        policy.trigger.patterns.as_deref(),
                        &policy.action,
                    )?;
                    violation.output_modified = true;
                    if let Some(targets) = &policy.action.apply_to {
                        redact_targets.extend(targets.iter().cloned());
                    }
                }
                "inject_approval" => {
                    should_inject_approval = true;
                    approval_config = policy.action.approval_config.clone().map(|mut cfg| {
                        if let Some(message) = cfg.get("message").and_then(|m| m.as_str()) {
                            let resolved = resolve_policy_template(message, output, ctx);
                            if let serde_json::Value::Object(map) = &mut cfg {
                                map.insert("message".to_string(), serde_json::Value::String(resolved));
                            }
                        }
                        cfg
                    });
                }
                "block" => {
                    should_block = true;
                    block_reason = Some(
                        policy
                            .action
                            .message
                            .clone()
                            .unwrap_or_else(|| "Policy violation: output blocked".to_string()),
                    );
                    if policy.trigger.patterns.is_some() {
                        let block_action = PolicyAction {
                            kind: "redact".to_string(),
                            replacement: Some("[BLOCKED]".to_string()),
                            apply_to: None,
                            approval_config: None,
                            message: None,
                            notify: None,
                        };
                        modified_output =
                            apply_redaction(&modified_output, policy.trigger.patterns.as_deref(), &block_action)?;
                        violation.output_modified = true;
                    }
                }
                "alert" => {
                    let msg = policy
                        .action
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("Policy '{}' triggered", policy.id));
                    let msg = resolve_policy_template(&msg, output, ctx);
                    tracing::warn!(policy_id = %policy.id, severity = %policy.severity, "policy alert: {}", msg);
                }
                "log" => {
                    tracing::info!(policy_id = %policy.id, "policy log: {}", violation.trigger_details);
                }
                _ => {}
            }

            violations.push(violation);
        }

        let mut redacted_output = modified_output.clone();
        if !redact_targets.is_empty() {
            redacted_output = output.clone();
            for policy in &self.policies {
                if policy.action.kind == "redact" && policy.trigger.patterns.is_some() {
                    redacted_output =
                        apply_redaction(&redacted_output, policy.trigger.patterns.as_deref(), &policy.action)?;
                }
            }
        }

        Ok(PolicyEvalResult {
            violations,
            modified_output,
            redacted_output,
            should_inject_approval,
            approval_config,
            should_block,
            block_reason,
        })
    }

    fn check_trigger(
        &self,
        policy: &PolicyDefinition,
        output: &Value,
        ctx: &PolicyContext<'_>,
        step_cost_usd: f64,
    ) -> crate::error::Result<(bool, String)> {
        match policy.trigger.kind.as_str() {
            "output_contains" => {
                let Some(patterns) = &policy.trigger.patterns else { return Ok((false, String::new())) };
                let output_str = output.render();
                for pattern in patterns {
                    let regex = pattern_regex(pattern)?;
                    let count = regex.find_iter(&output_str).count();
                    if count > 0 {
                        return Ok((true, format!("Pattern '{}' found: {} match(es)", pattern.kind, count)));
                    }
                }
                Ok((false, String::new()))
            }
            "condition" => {
                let Some(expression) = &policy.trigger.expression else { return Ok((false, String::new())) };
                let mut vars = HashMap::new();
                vars.insert("output".to_string(), output.clone());
                vars.insert("step_cost_usd".to_string(), Value::Number(step_cost_usd));
                vars.insert("step_id".to_string(), Value::Scalar(ctx.step_id.to_string()));
                vars.insert("run_id".to_string(), Value::Scalar(ctx.run_id.to_string()));
                vars.insert("total_cost_usd".to_string(), Value::Number(ctx.total_cost_usd));
                match eval_condition(expression, &vars) {
                    Ok(true) => Ok((true, format!("Condition '{}' = true", expression))),
                    Ok(false) => Ok((false, String::new())),
                    Err(e) => {
                        tracing::warn!(policy_id = %policy.id, error = %e, "policy condition eval error");
                        Ok((false, String::new()))
                    }
                }
            }
            _ => Ok((false, String::new())),
        }
    }
}

fn apply_redaction(
    output: &Value,
    patterns: Option<&[PolicyPattern]>,
    action: &PolicyAction,
) -> crate::error::Result<Value> {
    let Some(patterns) = patterns else { return Ok(output.clone()) };
    let replacement = action.replacement.as_deref().unwrap_or("[REDACTED]");
    let mut output_str = output.render();
    for pattern in patterns {
        let regex = pattern_regex(pattern)?;
        output_str = regex.replace_all(&output_str, replacement).into_owned();
    }
    if matches!(output, Value::Json(_)) {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&output_str) {
            return Ok(Value::from_json(parsed));
        }
        return Ok(Value::Scalar(output_str));
    }
    Ok(Value::Scalar(output_str))
}

fn resolve_policy_template(template: &str, output: &Value, ctx: &PolicyContext<'_>) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{([^}]+)\}").unwrap());
    re.replace_all(template, |caps: &regex::Captures| {
        let var_path = &caps[1];
        let mut parts = var_path.splitn(2, '.');
        let root = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        let resolved = match root {
            "output" => output.get_path(rest),
            "input" => ctx.input.get_path(rest),
            _ => None,
        };
        resolved.map(|v| v.render()).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Reference to a global policy, or an inline definition, in a step's
/// `policies:` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepPolicyRef {
    Named(String),
    Inline(PolicyDefinition),
}

/// Resolves which policies apply to a step: `None` means all global
/// policies apply, `Some(vec![])` means none apply, otherwise each entry is
/// either a reference by id or an inline definition.
pub fn resolve_step_policies(
    step_policies: Option<&[StepPolicyRef]>,
    global_policies: &[PolicyDefinition],
) -> Vec<PolicyDefinition> {
    let Some(step_policies) = step_policies else { return global_policies.to_vec() };
    if step_policies.is_empty() {
        return Vec::new();
    }
    let global_map: HashMap<&str, &PolicyDefinition> =
        global_policies.iter().map(|p| (p.id.as_str(), p)).collect();
    let mut result = Vec::new();
    for item in step_policies {
        match item {
            StepPolicyRef::Named(id) => {
                if let Some(policy) = global_map.get(id.as_str()) {
                    result.push((*policy).clone());
                } else {
                    tracing::warn!(policy_id = %id, "policy referenced but not found in global policies");
                }
            }
            StepPolicyRef::Inline(def) => result.push(def.clone()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(input: &'a Value) -> PolicyContext<'a> {
        PolicyContext { step_id: "s1", run_id: "r1", total_cost_usd: 0.0, input }
    }

    #[tokio::test]
    async fn redacts_email_in_output() {
        let policy = PolicyDefinition {
            id: "no-email".to_string(),
            trigger: PolicyTrigger {
                kind: "output_contains".to_string(),
                patterns: Some(vec![PolicyPattern { kind: "email".to_string(), pattern: None }]),
                expression: None,
            },
            action: PolicyAction {
                kind: "redact".to_string(),
                replacement: Some("[REDACTED]".to_string()),
                apply_to: None,
                approval_config: None,
                message: None,
                notify: None,
            },
            description: None,
            severity: "high".to_string(),
        };
        let engine = PolicyEngine::new(vec![policy]);
        let output = Value::Scalar("contact ada@example.com now".to_string());
        let input = Value::Null;
        let result = engine.evaluate(&output, &ctx(&input), 0.0).await.unwrap();
        assert_eq!(result.violations.len(), 1);
        assert!(result.modified_output.render().contains("[REDACTED]"));
        assert!(!result.modified_output.render().contains("ada@example.com"));
    }

    #[tokio::test]
    async fn condition_trigger_blocks() {
        let policy = PolicyDefinition {
            id: "expensive".to_string(),
            trigger: PolicyTrigger {
                kind: "condition".to_string(),
                patterns: None,
                expression: Some("step_cost_usd > 1.0".to_string()),
            },
            action: PolicyAction {
                kind: "block".to_string(),
                replacement: None,
                apply_to: None,
                approval_config: None,
                message: Some("too expensive".to_string()),
                notify: None,
            },
            description: None,
            severity: "critical".to_string(),
        };
        let engine = PolicyEngine::new(vec![policy]);
        let output = Value::Scalar("ok".to_string());
        let input = Value::Null;
        let result = engine.evaluate(&output, &ctx(&input), 2.5).await.unwrap();
        assert!(result.should_block);
        assert_eq!(result.block_reason.as_deref(), Some("too expensive"));
    }

    #[test]
    fn resolve_step_policies_none_means_all() {
        let global = vec![PolicyDefinition {
            id: "p1".to_string(),
            trigger: PolicyTrigger { kind: "output_contains".to_string(), patterns: None, expression: None },
            action: PolicyAction {
                kind: "log".to_string(),
                replacement: None,
                apply_to: None,
                approval_config: None,
                message: None,
                notify: None,
            },
            description: None,
            severity: "low".to_string(),
        }];
        let resolved = resolve_step_policies(None, &global);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn resolve_step_policies_empty_means_none() {
        let global = vec![];
        let resolved = resolve_step_policies(Some(&[]), &global);
        assert!(resolved.is_empty());
    }
}
