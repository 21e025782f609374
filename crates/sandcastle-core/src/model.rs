// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence-model entities: runs, steps, checkpoints, approvals,
//! AutoPilot experiments, routing decisions, policy violations, dead
//! letters, and workflow versions.

use crate::value::{Value, ValueMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
    BudgetExceeded,
    AwaitingApproval,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Partial
                | RunStatus::Cancelled
                | RunStatus::BudgetExceeded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    AwaitingApproval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub input: ValueMap,
    pub outputs: ValueMap,
    pub total_cost: f64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub max_cost: Option<f64>,
    pub tenant: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub replay_from_step: Option<String>,
    pub depth: u32,
}

impl Run {
    pub fn new(workflow_name: impl Into<String>, input: ValueMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            workflow_version: 1,
            input,
            outputs: ValueMap::new(),
            total_cost: 0.0,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            max_cost: None,
            tenant: None,
            idempotency_key: None,
            parent_run_id: None,
            replay_from_step: None,
            depth: 0,
        }
    }

    pub fn with_builder(self, f: impl FnOnce(Self) -> Self) -> Self {
        f(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub parallel_index: Option<usize>,
    pub status: StepStatus,
    pub input_prompt: String,
    pub output: Option<Value>,
    pub model: Option<String>,
    pub cost: f64,
    pub duration_seconds: f64,
    pub attempt: u32,
    pub error: Option<String>,
    pub sub_run_ids: Vec<Uuid>,
    pub policy_violation_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStep {
    pub fn new(run_id: Uuid, step_id: impl Into<String>, input_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_id: step_id.into(),
            parallel_index: None,
            status: StepStatus::Running,
            input_prompt: input_prompt.into(),
            output: None,
            model: None,
            cost: 0.0,
            duration_seconds: 0.0,
            attempt: 1,
            error: None,
            sub_run_ids: Vec::new(),
            policy_violation_count: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: Uuid,
    pub stage_index: usize,
    pub step_outputs: ValueMap,
    pub accumulated_cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCacheEntry {
    pub cache_key: String,
    pub output: Value,
    pub cost: f64,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    Abort,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub status: ApprovalStatus,
    pub message: String,
    pub data_snapshot: Option<Value>,
    pub reviewer_id: Option<String>,
    pub comment: Option<String>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub on_timeout: OnTimeout,
    pub allow_edit: bool,
    pub edited_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_terminal(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPilotExperiment {
    pub id: Uuid,
    pub workflow_name: String,
    pub step_id: String,
    pub status: ExperimentStatus,
    pub optimize_for: String,
    pub min_samples: u32,
    pub auto_deploy: bool,
    pub quality_threshold: f64,
    pub deployed_variant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPilotSample {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub run_id: Uuid,
    pub variant_id: String,
    pub output: Value,
    pub quality_score: f64,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub selected_model: String,
    pub variant_id: Option<String>,
    pub reason: String,
    pub budget_pressure: f64,
    pub confidence: f64,
    pub alternatives_considered: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub policy_id: String,
    pub severity: String,
    pub trigger_details: String,
    pub action_taken: String,
    pub output_modified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub input: Value,
    pub error: String,
    pub attempt_count: u32,
    pub parallel_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowVersionStatus {
    Draft,
    Staging,
    Production,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_name: String,
    pub version: u32,
    pub status: WorkflowVersionStatus,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Peripheral entities, specified only by interface (§6 of the requirements).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub workflow_name: String,
    pub cron_expression: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}
