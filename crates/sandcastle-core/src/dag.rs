// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Workflow YAML schema, validation, and topological stage planning.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Abort,
    Skip,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_on_failure")]
    pub on_failure: OnFailure,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}
fn default_on_failure() -> OnFailure {
    OnFailure::Abort
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            on_failure: default_on_failure(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_fallback_model")]
    pub model: String,
}

fn default_fallback_model() -> String {
    "haiku".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    Abort,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub message: String,
    pub show_data: Option<String>,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: f64,
    #[serde(default = "default_on_timeout")]
    pub on_timeout: OnTimeout,
    #[serde(default)]
    pub allow_edit: bool,
}

fn default_timeout_hours() -> f64 {
    24.0
}
fn default_on_timeout() -> OnTimeout {
    OnTimeout::Abort
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    pub workflow: String,
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
    pub max_concurrent: Option<usize>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeFor {
    Cost,
    Quality,
    Latency,
    Balanced,
    Pareto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantConfig {
    pub id: String,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMethod {
    SchemaCompleteness,
    LlmJudge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub method: EvaluationMethod,
    pub criteria: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPilotConfig {
    #[serde(default)]
    pub enabled: bool,
    pub optimize_for: OptimizeFor,
    pub variants: Vec<VariantConfig>,
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default)]
    pub auto_deploy: bool,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    pub evaluation: Option<EvaluationConfig>,
}

fn default_min_samples() -> u32 {
    10
}
fn default_quality_threshold() -> f64 {
    0.5
}
fn default_sample_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    #[serde(default)]
    pub quality_min: f64,
    pub cost_max_usd: Option<f64>,
    pub latency_max_seconds: Option<f64>,
    pub optimize_for: OptimizeFor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPoolOption {
    pub id: String,
    pub model: String,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvMode {
    NewFile,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvOutputConfig {
    pub directory: String,
    pub mode: CsvMode,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Standard,
    Approval,
    SubWorkflow,
}

impl Default for StepType {
    fn default() -> Self {
        StepType::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: Option<u64>,
    pub parallel_over: Option<String>,
    pub output_schema: Option<serde_json::Value>,
    pub retry: Option<RetryConfig>,
    pub fallback: Option<FallbackConfig>,
    #[serde(default, rename = "type")]
    pub step_type: StepType,
    pub approval_config: Option<ApprovalConfig>,
    pub sub_workflow: Option<SubWorkflowConfig>,
    pub autopilot: Option<AutoPilotConfig>,
    pub slo: Option<SloConfig>,
    pub model_pool: Option<Vec<ModelPoolOption>>,
    /// `None` = all global policies apply, `Some(vec![])` = none, otherwise
    /// a mix of policy-id references (as strings) and inline definitions.
    pub policies: Option<Vec<serde_json::Value>>,
    pub csv_output: Option<CsvOutputConfig>,
    /// Opts the step out of result caching.
    #[serde(default)]
    pub no_cache: bool,
}

impl StepDefinition {
    pub fn effective_model(&self, default_model: &str) -> String {
        self.model.clone().unwrap_or_else(|| default_model.to_string())
    }

    pub fn effective_timeout(&self, default_timeout: u64) -> u64 {
        self.timeout.unwrap_or(default_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub webhook: Option<String>,
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    #[serde(default)]
    pub dead_letter: bool,
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "sandstorm_url", default = "default_sandshore_url")]
    pub sandshore_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    pub steps: Vec<StepDefinition>,
    pub on_complete: Option<CompletionConfig>,
    pub on_failure: Option<FailureConfig>,
    pub schedule: Option<String>,
    #[serde(default)]
    pub policies: Vec<serde_json::Value>,
    pub input_schema: Option<serde_json::Value>,
}

fn default_sandshore_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_model() -> String {
    "sonnet".to_string()
}
fn default_max_turns() -> u32 {
    10
}
fn default_timeout() -> u64 {
    300
}

impl WorkflowDefinition {
    pub fn get_step(&self, step_id: &str) -> crate::error::Result<&StepDefinition> {
        self.steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| crate::error::SandcastleError::StepNotFound(step_id.to_string()))
    }

    /// Interpolates `${ENV_VAR}` patterns in a scalar string.
    pub fn resolve_env_vars(value: &str) -> String {
        resolve_env_vars(value)
    }
}

fn resolve_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = value[i + 2..].find('}') {
                let var_name = &value[i + 2..i + 2 + end];
                if var_name.chars().all(|c| c.is_alphanumeric() || c == '_') && !var_name.is_empty()
                {
                    match std::env::var(var_name) {
                        Ok(v) => out.push_str(&v),
                        Err(_) => out.push_str(&value[i..i + 2 + end + 1]),
                    }
                    i += 2 + end + 1;
                    continue;
                }
            }
        }
        let ch = value[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    let _ = &mut chars;
    out
}

/// Parses a workflow definition from a YAML string.
pub fn parse(yaml: &str) -> crate::error::Result<WorkflowDefinition> {
    let mut workflow: WorkflowDefinition = serde_yaml::from_str(yaml)?;
    workflow.sandshore_url = resolve_env_vars(&workflow.sandshore_url);
    if let Some(oc) = &mut workflow.on_complete {
        if let Some(webhook) = &oc.webhook {
            oc.webhook = Some(resolve_env_vars(webhook));
        }
    }
    if let Some(of) = &mut workflow.on_failure {
        if let Some(webhook) = &of.webhook {
            of.webhook = Some(resolve_env_vars(webhook));
        }
    }
    Ok(workflow)
}

/// Topologically sorted execution stages: `stages[i]` is the set of step
/// ids whose dependencies are all satisfied by stages `0..i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Vec<String>>,
}

/// Collects all validation errors; never short-circuits.
pub fn validate(workflow: &WorkflowDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if workflow.name.is_empty() {
        errors.push("Workflow name is required".to_string());
    }
    if workflow.steps.is_empty() {
        errors.push("Workflow must have at least one step".to_string());
    }

    let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("Duplicate step ID: '{}'", step.id));
        }
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !step_ids.contains(dep.as_str()) {
                errors.push(format!(
                    "Step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }

        if step.step_type == StepType::Approval && step.approval_config.is_none() {
            errors.push(format!(
                "Step '{}' has type=approval but no approval_config.message",
                step.id
            ));
        }
        if step.step_type == StepType::SubWorkflow && step.sub_workflow.is_none() {
            errors.push(format!(
                "Step '{}' has type=sub_workflow but no child workflow name",
                step.id
            ));
        }
        if let Some(slo) = &step.slo {
            let _ = slo.optimize_for; // enum already restricts valid values at parse time
        }
        if let Some(model) = &step.model {
            if !crate::registry::is_known_model(model) {
                errors.push(format!("Step '{}' references unknown model '{}'", step.id, model));
            }
        }
    }

    errors.extend(detect_cycles(&workflow.steps));

    errors
}

fn detect_cycles(steps: &[StepDefinition]) -> Vec<String> {
    let adj: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut errors = Vec::new();

    fn dfs<'a>(
        node: &'a str,
        adj: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
        errors: &mut Vec<String>,
    ) -> bool {
        visited.insert(node);
        in_stack.insert(node);
        if let Some(deps) = adj.get(node) {
            for neighbor in deps.iter() {
                let neighbor = neighbor.as_str();
                if in_stack.contains(neighbor) {
                    errors.push(format!("Cycle detected involving step '{}' -> '{}'", node, neighbor));
                    return true;
                }
                if !visited.contains(neighbor) && dfs(neighbor, adj, visited, in_stack, errors) {
                    return true;
                }
            }
        }
        in_stack.remove(node);
        false
    }

    for step in steps {
        if !visited.contains(step.id.as_str()) {
            dfs(&step.id, &adj, &mut visited, &mut in_stack, &mut errors);
        }
    }

    errors
}

/// Builds a topologically layered execution plan via Kahn's algorithm.
/// Stages are sorted lexicographically for deterministic ordering.
pub fn build_plan(workflow: &WorkflowDefinition) -> crate::error::Result<ExecutionPlan> {
    let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> =
        workflow.steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> =
        workflow.steps.iter().map(|s| (s.id.as_str(), Vec::new())).collect();

    for step in &workflow.steps {
        for dep in &step.depends_on {
            *in_degree.get_mut(step.id.as_str()).unwrap() += 1;
            dependents.get_mut(dep.as_str()).unwrap().push(step.id.as_str());
        }
    }

    let mut stages: Vec<Vec<String>> = Vec::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    while !ready.is_empty() {
        ready.sort_unstable();
        stages.push(ready.iter().map(|s| s.to_string()).collect());

        let mut next_ready = Vec::new();
        for sid in &ready {
            for dependent in &dependents[sid] {
                let deg = in_degree.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    next_ready.push(*dependent);
                }
            }
        }
        ready = next_ready;
    }

    let scheduled: HashSet<&str> = stages.iter().flatten().map(|s| s.as_str()).collect();
    if scheduled != step_ids {
        let unscheduled: Vec<&str> = step_ids.difference(&scheduled).copied().collect();
        return Err(crate::error::SandcastleError::Cycle(format!(
            "unschedulable steps (cycle?): {:?}",
            unscheduled
        )));
    }

    Ok(ExecutionPlan { stages })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            prompt: "hi".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            model: Some("haiku".to_string()),
            max_turns: None,
            timeout: None,
            parallel_over: None,
            output_schema: None,
            retry: None,
            fallback: None,
            step_type: StepType::Standard,
            approval_config: None,
            sub_workflow: None,
            autopilot: None,
            slo: None,
            model_pool: None,
            policies: None,
            csv_output: None,
            no_cache: false,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".to_string(),
            description: String::new(),
            sandshore_url: default_sandshore_url(),
            default_model: default_model(),
            default_max_turns: default_max_turns(),
            default_timeout: default_timeout(),
            steps,
            on_complete: None,
            on_failure: None,
            schedule: None,
            policies: Vec::new(),
            input_schema: None,
        }
    }

    #[test]
    fn linear_chain_produces_three_stages() {
        let wf = workflow(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let plan = build_plan(&wf).unwrap();
        assert_eq!(plan.stages, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn independent_steps_share_a_stage_lexicographically() {
        let wf = workflow(vec![step("b", &[]), step("a", &[])]);
        let plan = build_plan(&wf).unwrap();
        assert_eq!(plan.stages, vec![vec!["a", "b"]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let wf = workflow(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(build_plan(&wf).is_err());
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("Cycle detected")));
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let wf = workflow(vec![step("a", &["ghost"])]);
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("unknown step 'ghost'")));
    }

    #[test]
    fn env_var_is_interpolated() {
        std::env::set_var("SANDCASTLE_TEST_TOKEN", "secret123");
        assert_eq!(resolve_env_vars("token=${SANDCASTLE_TEST_TOKEN}"), "token=secret123");
        std::env::remove_var("SANDCASTLE_TEST_TOKEN");
    }

    #[test]
    fn unset_env_var_is_left_verbatim() {
        assert_eq!(resolve_env_vars("${SANDCASTLE_DOES_NOT_EXIST}"), "${SANDCASTLE_DOES_NOT_EXIST}");
    }
}
