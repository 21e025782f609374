// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Step and workflow executors: the engine that walks a topologically
//! planned workflow, runs each step against the sandbox runtime (with
//! caching, optimizer/AutoPilot routing, retry/backoff/fallback, and policy
//! enforcement), and drives the run to completion, pausing for approval
//! gates and recursing into sub-workflows as needed.

use crate::autopilot::{self, ExperimentSource, LlmJudge};
use crate::blob_store::BlobStorage;
use crate::config::Settings;
use crate::dag::{
    self, BackoffStrategy, CsvMode, OptimizeFor as DagOptimizeFor, StepDefinition, StepType, WorkflowDefinition,
};
use crate::error::SandcastleError;
use crate::events::EventBus;
use crate::model::{
    ApprovalRequest, ApprovalStatus, AutoPilotExperiment, AutoPilotSample, DeadLetterItem, ExperimentStatus,
    PolicyViolation as PersistedPolicyViolation, Run, RunCheckpoint, RunStatus, RunStep, RoutingDecision,
    StepCacheEntry, StepStatus,
};
use crate::optimizer::{self, CostLatencyOptimizer, ModelOption, PerformanceSource, PerformanceStats, Slo};
use crate::policy::{PolicyContext, PolicyDefinition, PolicyEngine, StepPolicyRef};
use crate::sandbox::{CancelSignal, SandboxError, SandboxRequest, SandboxRuntime};
use crate::store::Store;
use crate::template::{self, RenderContext};
use crate::value::{Value, ValueMap};
use crate::webhook::{WebhookDispatcher, WebhookPayload};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const FIXED_BACKOFF_SECONDS: u64 = 2;

#[async_trait]
impl<T: PerformanceSource> PerformanceSource for Arc<T> {
    async fn query_stats(&self, step_id: &str, workflow_name: &str) -> anyhow::Result<Vec<PerformanceStats>> {
        (**self).query_stats(step_id, workflow_name).await
    }
}

/// Resolves a named workflow definition, used by `sub_workflow` steps.
/// Concrete loaders (filesystem, registry-backed) live above this crate.
#[async_trait]
pub trait WorkflowLookup: Send + Sync {
    async fn load(&self, name: &str) -> anyhow::Result<Option<WorkflowDefinition>>;
}

/// Run-scoped execution state threaded through a run's stages. A checkpoint
/// is a snapshot of `step_outputs` and `costs` taken after every fully
/// completed stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub input: ValueMap,
    pub step_outputs: ValueMap,
    pub costs: f64,
    pub max_cost: Option<f64>,
}

/// Outcome of running a single step (or one fan-out item of a step).
pub struct StepResult {
    pub output: Value,
    pub cost: f64,
    pub duration_seconds: f64,
    pub status: StepStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub model_used: Option<String>,
    /// Set when the policy engine's `inject_approval` action fired on this
    /// step's output.
    pub inject_approval: Option<serde_json::Value>,
}

enum StepOutcome {
    Done { step_id: String, result: StepResult },
    FanOut { step_id: String, results: Vec<StepResult> },
    Aborted { error: String },
}

struct EffectiveStep {
    def: StepDefinition,
    variant_id: Option<String>,
    experiment_id: Option<Uuid>,
}

pub struct WorkflowExecutor<P>
where
    P: Store + PerformanceSource + ExperimentSource + Send + Sync + 'static,
{
    store: Arc<P>,
    sandbox: Arc<dyn SandboxRuntime>,
    blob: Arc<dyn BlobStorage>,
    events: Arc<EventBus>,
    webhooks: WebhookDispatcher,
    optimizer: CostLatencyOptimizer<Arc<P>>,
    workflows: Arc<dyn WorkflowLookup>,
    settings: Settings,
}

impl<P> WorkflowExecutor<P>
where
    P: Store + PerformanceSource + ExperimentSource + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<P>,
        sandbox: Arc<dyn SandboxRuntime>,
        blob: Arc<dyn BlobStorage>,
        events: Arc<EventBus>,
        workflows: Arc<dyn WorkflowLookup>,
        settings: Settings,
    ) -> Self {
        let optimizer = CostLatencyOptimizer::new(store.clone());
        let webhooks = WebhookDispatcher::new(settings.webhook_secret.clone(), 3);
        Self { store, sandbox, blob, events, webhooks, optimizer, workflows, settings }
    }

    /// Applies an external reviewer decision to a pending approval. Resuming
    /// the paused run is a separate call to [`Self::execute`] with the same
    /// run id: the stage containing this step re-enters from the last
    /// checkpoint and finds the request terminal.
    pub async fn resolve_approval(
        &self,
        approval_id: Uuid,
        decision: crate::approval::ApprovalDecision,
        reviewer_id: Option<String>,
        comment: Option<String>,
        edited_data: Option<Value>,
    ) -> anyhow::Result<()> {
        let mut request = self
            .store
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!(SandcastleError::ApprovalNotFound(approval_id.to_string())))?;
        crate::approval::resolve(&mut request, decision, reviewer_id, comment, edited_data);
        self.store.update_approval(request).await
    }

    /// Runs `workflow` to completion (or to its next pause/terminal point),
    /// starting from `run`'s last saved checkpoint if one exists.
    pub fn execute<'a>(
        &'a self,
        workflow: &'a WorkflowDefinition,
        mut run: Run,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Run>> + Send + 'a>> {
        Box::pin(async move {
            let plan = dag::build_plan(workflow)?;

            let mut ctx = RunContext {
                run_id: run.id,
                input: run.input.clone(),
                step_outputs: run.outputs.clone(),
                costs: run.total_cost,
                max_cost: run.max_cost,
            };

            let start_stage = match self.store.latest_checkpoint(run.id).await? {
                Some(cp) => {
                    ctx.step_outputs = cp.step_outputs;
                    ctx.costs = cp.accumulated_cost;
                    cp.stage_index
                }
                None => {
                    self.events
                        .publish("run.started", serde_json::json!({"run_id": run.id, "workflow": workflow.name}))
                        .await;
                    0
                }
            };

            'stages: for (stage_index, stage) in plan.stages.iter().enumerate().skip(start_stage) {
                if cancel.is_cancelled() {
                    run.status = RunStatus::Cancelled;
                    run.error = Some("run was cancelled".to_string());
                    break 'stages;
                }

                let pressure = optimizer::calculate_budget_pressure(ctx.costs, ctx.max_cost);
                if pressure >= 1.0 {
                    run.status = RunStatus::BudgetExceeded;
                    run.error =
                        Some(format!("budget exceeded: {:.4} / {:.4}", ctx.costs, ctx.max_cost.unwrap_or(0.0)));
                    break 'stages;
                } else if pressure >= 0.8 {
                    tracing::warn!(run_id = %run.id, pressure, "run approaching its cost budget");
                }

                let outcomes: Vec<StepOutcome> = stream::iter(stage.iter().cloned())
                    .map(|step_id| {
                        let ctx_ref = &ctx;
                        let run_ref = &run;
                        let cancel = cancel.clone();
                        async move {
                            let step = match workflow.get_step(&step_id) {
                                Ok(s) => s,
                                Err(e) => return StepOutcome::Aborted { error: e.to_string() },
                            };
                            self.execute_stage_step(workflow, step, run_ref, ctx_ref, &cancel).await
                        }
                    })
                    .buffer_unordered(self.settings.stage_concurrency.max(1))
                    .collect()
                    .await;

                let mut paused = false;
                let mut aborted = false;
                for outcome in outcomes {
                    match outcome {
                        StepOutcome::Done { step_id, result } => {
                            self.record_step(&run, &step_id, None, &result).await;
                            ctx.costs += result.cost;
                            if let Some(approval_cfg) = &result.inject_approval {
                                self.create_injected_approval(&run, &step_id, approval_cfg, &result.output)
                                    .await
                                    .ok();
                                paused = true;
                            }
                            if result.status == StepStatus::AwaitingApproval {
                                paused = true;
                            }
                            ctx.step_outputs.insert(step_id.clone(), result.output.clone());
                            if result.status == StepStatus::Failed {
                                let step_def = workflow.get_step(&step_id)?;
                                if self.on_failure_aborts(step_def) {
                                    run.status = RunStatus::Failed;
                                    run.error = result.error.clone();
                                    aborted = true;
                                }
                            }
                        }
                        StepOutcome::FanOut { step_id, results } => {
                            let mut outputs = Vec::with_capacity(results.len());
                            let mut any_failed = false;
                            let mut first_error = None;
                            for (idx, result) in results.iter().enumerate() {
                                self.record_step(&run, &step_id, Some(idx), result).await;
                                ctx.costs += result.cost;
                                outputs.push(result.output.clone());
                                if result.status == StepStatus::Failed {
                                    any_failed = true;
                                    first_error = first_error.or_else(|| result.error.clone());
                                }
                            }
                            ctx.step_outputs.insert(step_id.clone(), Value::List(outputs));
                            if any_failed {
                                let step_def = workflow.get_step(&step_id)?;
                                if self.on_failure_aborts(step_def) {
                                    run.status = RunStatus::Failed;
                                    run.error = first_error;
                                    aborted = true;
                                }
                            }
                        }
                        StepOutcome::Aborted { error } => {
                            run.status = RunStatus::Failed;
                            run.error = Some(error);
                            aborted = true;
                        }
                    }
                    if aborted {
                        break;
                    }
                }

                if aborted {
                    break 'stages;
                }
                if paused {
                    run.status = RunStatus::AwaitingApproval;
                    break 'stages;
                }

                self.store
                    .save_checkpoint(RunCheckpoint {
                        run_id: run.id,
                        stage_index: stage_index + 1,
                        step_outputs: ctx.step_outputs.clone(),
                        accumulated_cost: ctx.costs,
                        created_at: Utc::now(),
                    })
                    .await
                    .ok();
            }

            if run.status == RunStatus::Running {
                let has_failures =
                    self.store.steps_for_run(run.id).await?.iter().any(|s| s.status == StepStatus::Failed);
                run.status = if has_failures { RunStatus::Partial } else { RunStatus::Completed };
            }

            run.outputs = ctx.step_outputs;
            run.total_cost = ctx.costs;
            if run.status.is_terminal() {
                run.completed_at = Some(Utc::now());
            }
            self.store.update_run(run.clone()).await?;

            if run.status.is_terminal() {
                self.handle_completion(workflow, &run).await;
            }

            Ok(run)
        })
    }

    fn on_failure_aborts(&self, step: &StepDefinition) -> bool {
        step.retry.as_ref().map(|r| r.on_failure).unwrap_or(dag::OnFailure::Abort) == dag::OnFailure::Abort
    }

    async fn handle_completion(&self, workflow: &WorkflowDefinition, run: &Run) {
        let duration_seconds =
            run.completed_at.map(|end| (end - run.started_at).num_milliseconds() as f64 / 1000.0).unwrap_or(0.0);

        match run.status {
            RunStatus::Completed | RunStatus::Partial => {
                self.events
                    .publish(
                        "run.completed",
                        serde_json::json!({"run_id": run.id, "status": format!("{:?}", run.status)}),
                    )
                    .await;
                if let Some(on_complete) = &workflow.on_complete {
                    if let Some(path) = &on_complete.storage_path {
                        let render_ctx = RenderContext { run_id: run.id, input: &run.input, step_outputs: &run.outputs };
                        let resolved_path = template::resolve_templates(path, &render_ctx);
                        let body = serde_json::to_string_pretty(&run.outputs).unwrap_or_default();
                        if let Err(e) = self.blob.write(&resolved_path, &body).await {
                            tracing::warn!(error = %e, path = %resolved_path, "failed to write completion output");
                        }
                    }
                    if let Some(url) = &on_complete.webhook {
                        let payload = WebhookPayload {
                            event: "workflow.completed".to_string(),
                            run_id: run.id,
                            workflow: workflow.name.clone(),
                            status: format!("{:?}", run.status).to_lowercase(),
                            outputs: Some(serde_json::to_value(&run.outputs).unwrap_or_default()),
                            costs: run.total_cost,
                            duration_seconds,
                            error: None,
                            timestamp: Utc::now(),
                        };
                        self.webhooks.dispatch(url, &payload).await;
                    }
                }
            }
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::BudgetExceeded => {
                self.events
                    .publish(
                        "run.failed",
                        serde_json::json!({"run_id": run.id, "status": format!("{:?}", run.status)}),
                    )
                    .await;
                if let Some(on_failure) = &workflow.on_failure {
                    if let Some(url) = &on_failure.webhook {
                        let payload = WebhookPayload {
                            event: "workflow.failed".to_string(),
                            run_id: run.id,
                            workflow: workflow.name.clone(),
                            status: format!("{:?}", run.status).to_lowercase(),
                            outputs: None,
                            costs: run.total_cost,
                            duration_seconds,
                            error: run.error.clone(),
                            timestamp: Utc::now(),
                        };
                        self.webhooks.dispatch(url, &payload).await;
                    }
                    if on_failure.dead_letter {
                        if let Ok(steps) = self.store.steps_for_run(run.id).await {
                            for step in steps.into_iter().filter(|s| s.status == StepStatus::Failed) {
                                let item = DeadLetterItem {
                                    id: Uuid::new_v4(),
                                    run_id: run.id,
                                    step_id: step.step_id.clone(),
                                    input: Value::Scalar(step.input_prompt.clone()),
                                    error: step.error.clone().unwrap_or_default(),
                                    attempt_count: step.attempt,
                                    parallel_index: step.parallel_index,
                                    created_at: Utc::now(),
                                    resolved_at: None,
                                    resolved_by: None,
                                };
                                self.store.record_dead_letter(item).await.ok();
                                self.events.publish("dlq.new", serde_json::json!({"run_id": run.id})).await;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    async fn record_step(&self, run: &Run, step_id: &str, parallel_index: Option<usize>, result: &StepResult) {
        let mut row = RunStep::new(run.id, step_id, String::new());
        row.parallel_index = parallel_index;
        row.status = result.status;
        row.output = Some(result.output.clone());
        row.model = result.model_used.clone();
        row.cost = result.cost;
        row.duration_seconds = result.duration_seconds;
        row.attempt = result.attempt;
        row.error = result.error.clone();
        row.completed_at = Some(Utc::now());
        self.store.create_step(row).await.ok();
        let event = if result.status == StepStatus::Failed { "step.failed" } else { "step.completed" };
        self.events.publish(event, serde_json::json!({"run_id": run.id, "step_id": step_id})).await;
    }

    async fn create_injected_approval(
        &self,
        run: &Run,
        step_id: &str,
        approval_cfg: &serde_json::Value,
        data_snapshot: &Value,
    ) -> anyhow::Result<()> {
        if self.store.approval_for_step(run.id, step_id).await?.is_some() {
            return Ok(());
        }
        let message =
            approval_cfg.get("message").and_then(|m| m.as_str()).unwrap_or("policy requires approval").to_string();
        let timeout_hours = approval_cfg.get("timeout_hours").and_then(|v| v.as_f64()).unwrap_or(24.0);
        let on_timeout = match approval_cfg.get("on_timeout").and_then(|v| v.as_str()) {
            Some("skip") => crate::model::OnTimeout::Skip,
            _ => crate::model::OnTimeout::Abort,
        };
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            run_id: run.id,
            step_id: step_id.to_string(),
            status: ApprovalStatus::Pending,
            message,
            data_snapshot: Some(data_snapshot.clone()),
            reviewer_id: None,
            comment: None,
            timeout_at: Some(Utc::now() + chrono::Duration::milliseconds((timeout_hours * 3_600_000.0) as i64)),
            on_timeout,
            allow_edit: approval_cfg.get("allow_edit").and_then(|v| v.as_bool()).unwrap_or(false),
            edited_data: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.store.create_approval(request).await
    }

    async fn execute_stage_step(
        &self,
        workflow: &WorkflowDefinition,
        step: &StepDefinition,
        run: &Run,
        ctx: &RunContext,
        cancel: &CancelSignal,
    ) -> StepOutcome {
        match step.step_type {
            StepType::Approval => self.execute_approval_step(step, run, ctx).await,
            StepType::SubWorkflow => self.execute_sub_workflow_step(step, run, ctx, cancel).await,
            StepType::Standard => {
                if let Some(path) = &step.parallel_over {
                    let render_ctx = RenderContext { run_id: run.id, input: &ctx.input, step_outputs: &ctx.step_outputs };
                    let items = match template::resolve_path(path, &render_ctx) {
                        Some(Value::List(items)) => items,
                        Some(other) => vec![other],
                        None => Vec::new(),
                    };
                    let results: Vec<StepResult> = stream::iter(items.into_iter().enumerate())
                        .map(|(idx, item)| {
                            let mut derived_input = ctx.input.clone();
                            derived_input.insert("_item".to_string(), item);
                            derived_input.insert("_index".to_string(), Value::Number(idx as f64));
                            async move {
                                self.execute_step(workflow, step, run, ctx, Some(idx), &derived_input, cancel).await
                            }
                        })
                        .buffer_unordered(self.settings.stage_concurrency.max(1))
                        .collect()
                        .await;
                    StepOutcome::FanOut { step_id: step.id.clone(), results }
                } else {
                    let result = self.execute_step(workflow, step, run, ctx, None, &ctx.input, cancel).await;
                    StepOutcome::Done { step_id: step.id.clone(), result }
                }
            }
        }
    }

    async fn execute_approval_step(&self, step: &StepDefinition, run: &Run, ctx: &RunContext) -> StepOutcome {
        let existing = self.store.approval_for_step(run.id, &step.id).await.ok().flatten();

        let request = match existing {
            Some(mut req) if !req.is_terminal() => {
                if let Some(deadline) = req.timeout_at {
                    if Utc::now() >= deadline {
                        crate::approval::apply_timeout(&mut req);
                        self.store.update_approval(req.clone()).await.ok();
                    }
                }
                req
            }
            Some(req) => req,
            None => {
                let Some(cfg) = &step.approval_config else {
                    return StepOutcome::Aborted { error: "approval step missing approval_config".to_string() };
                };
                let snapshot = cfg
                    .show_data
                    .as_ref()
                    .and_then(|path| {
                        let render_ctx = RenderContext { run_id: run.id, input: &ctx.input, step_outputs: &ctx.step_outputs };
                        template::resolve_path(path, &render_ctx)
                    })
                    .unwrap_or(Value::Null);
                let req = ApprovalRequest {
                    id: Uuid::new_v4(),
                    run_id: run.id,
                    step_id: step.id.clone(),
                    status: ApprovalStatus::Pending,
                    message: cfg.message.clone(),
                    data_snapshot: Some(snapshot),
                    reviewer_id: None,
                    comment: None,
                    timeout_at: Some(Utc::now() + chrono::Duration::milliseconds((cfg.timeout_hours * 3_600_000.0) as i64)),
                    on_timeout: match cfg.on_timeout {
                        dag::OnTimeout::Skip => crate::model::OnTimeout::Skip,
                        dag::OnTimeout::Abort => crate::model::OnTimeout::Abort,
                    },
                    allow_edit: cfg.allow_edit,
                    edited_data: None,
                    created_at: Utc::now(),
                    resolved_at: None,
                };
                self.store.create_approval(req.clone()).await.ok();
                req
            }
        };

        if !request.is_terminal() {
            let result = StepResult {
                output: Value::Null,
                cost: 0.0,
                duration_seconds: 0.0,
                status: StepStatus::AwaitingApproval,
                attempt: 1,
                error: None,
                model_used: None,
                inject_approval: None,
            };
            return StepOutcome::Done { step_id: step.id.clone(), result };
        }

        let output = crate::approval::gate_output(&request).unwrap_or(Value::Null);
        let status = match request.status {
            ApprovalStatus::Approved => StepStatus::Completed,
            ApprovalStatus::Skipped | ApprovalStatus::TimedOut => StepStatus::Skipped,
            ApprovalStatus::Rejected | ApprovalStatus::Pending => StepStatus::Failed,
        };
        let result = StepResult {
            output,
            cost: 0.0,
            duration_seconds: 0.0,
            status,
            attempt: 1,
            error: if status == StepStatus::Failed { Some("approval rejected".to_string()) } else { None },
            model_used: None,
            inject_approval: None,
        };
        StepOutcome::Done { step_id: step.id.clone(), result }
    }

    async fn execute_sub_workflow_step(
        &self,
        step: &StepDefinition,
        run: &Run,
        ctx: &RunContext,
        cancel: &CancelSignal,
    ) -> StepOutcome {
        let Some(sub) = &step.sub_workflow else {
            return StepOutcome::Aborted { error: "sub_workflow step missing config".to_string() };
        };

        if run.depth + 1 > self.settings.max_workflow_depth {
            return StepOutcome::Aborted {
                error: SandcastleError::DepthExceeded { depth: run.depth + 1, max: self.settings.max_workflow_depth }
                    .to_string(),
            };
        }

        let child_workflow = match self.workflows.load(&sub.workflow).await {
            Ok(Some(wf)) => wf,
            Ok(None) => {
                return StepOutcome::Aborted { error: SandcastleError::WorkflowNotFound(sub.workflow.clone()).to_string() }
            }
            Err(e) => return StepOutcome::Aborted { error: e.to_string() },
        };

        let render_ctx = RenderContext { run_id: run.id, input: &ctx.input, step_outputs: &ctx.step_outputs };
        let mut child_input = ValueMap::new();
        for (target, source_path) in &sub.input_mapping {
            if let Some(value) = template::resolve_path(source_path, &render_ctx) {
                child_input.insert(target.clone(), value);
            }
        }

        let mut child_run = Run::new(child_workflow.name.clone(), child_input);
        child_run.parent_run_id = Some(run.id);
        child_run.depth = run.depth + 1;
        self.store.create_run(child_run.clone()).await.ok();

        let child_run = match self.execute(&child_workflow, child_run, cancel.clone()).await {
            Ok(r) => r,
            Err(e) => return StepOutcome::Aborted { error: e.to_string() },
        };

        let mut mapped = serde_json::Map::new();
        let child_render_ctx =
            RenderContext { run_id: child_run.id, input: &child_run.input, step_outputs: &child_run.outputs };
        for (target, source_path) in &sub.output_mapping {
            if let Some(value) = template::resolve_path(source_path, &child_render_ctx) {
                mapped.insert(target.clone(), value.to_json());
            }
        }

        let status = match child_run.status {
            RunStatus::Completed | RunStatus::Partial => StepStatus::Completed,
            _ => StepStatus::Failed,
        };

        let result = StepResult {
            output: Value::Json(serde_json::Value::Object(mapped)),
            cost: child_run.total_cost,
            duration_seconds: 0.0,
            status,
            attempt: 1,
            error: child_run.error.clone(),
            model_used: None,
            inject_approval: None,
        };
        StepOutcome::Done { step_id: step.id.clone(), result }
    }

    async fn execute_step(
        &self,
        workflow: &WorkflowDefinition,
        step: &StepDefinition,
        run: &Run,
        ctx: &RunContext,
        _parallel_index: Option<usize>,
        derived_input: &ValueMap,
        cancel: &CancelSignal,
    ) -> StepResult {
        let start = std::time::Instant::now();
        let effective = self.resolve_autopilot_variant(workflow, step).await;
        let step_def = &effective.def;

        let render_ctx = RenderContext { run_id: run.id, input: derived_input, step_outputs: &ctx.step_outputs };
        let templated_prompt = template::resolve_templates(&step_def.prompt, &render_ctx);
        let blob = self.blob.clone();
        let resolved_prompt = template::resolve_storage_refs(&templated_prompt, |path| {
            let blob = blob.clone();
            async move { blob.read(&path).await.ok().flatten() }
        })
        .await;

        let (mut effective_model, mut effective_max_turns) = (
            step_def.effective_model(&workflow.default_model),
            step_def.max_turns.unwrap_or(workflow.default_max_turns),
        );
        if let Some((model, max_turns)) = self.route_model(workflow, step_def, run.id, ctx.costs, ctx.max_cost).await {
            effective_model = model;
            effective_max_turns = max_turns;
        }

        let key = cache_key(&workflow.name, &step.id, &resolved_prompt, &effective_model);
        if !step.no_cache {
            if let Ok(Some(entry)) = self.store.cache_get(&key).await {
                return StepResult {
                    output: entry.output,
                    cost: 0.0,
                    duration_seconds: start.elapsed().as_secs_f64(),
                    status: StepStatus::Completed,
                    attempt: 0,
                    error: None,
                    model_used: Some(effective_model),
                    inject_approval: None,
                };
            }
        }

        let request = SandboxRequest {
            prompt: resolved_prompt.clone(),
            model: effective_model.clone(),
            max_turns: effective_max_turns,
            timeout: step_def.effective_timeout(workflow.default_timeout),
            output_format: step_def.output_schema.clone(),
        };

        let retry_cfg = step_def.retry.clone().unwrap_or_default();
        let mut attempt = 0u32;
        let mut last_error: Option<String> = None;
        let mut sandbox_result = None;

        for a in 1..=retry_cfg.max_attempts {
            attempt = a;
            if cancel.is_cancelled() {
                return cancelled_result(start.elapsed().as_secs_f64());
            }
            match self.sandbox.query(request.clone(), cancel.clone()).await {
                Ok(result) => {
                    sandbox_result = Some(result);
                    last_error = None;
                    break;
                }
                Err(SandboxError::Cancelled) => return cancelled_result(start.elapsed().as_secs_f64()),
                Err(SandboxError::Runtime(msg)) => {
                    last_error = Some(msg);
                    if a < retry_cfg.max_attempts {
                        tokio::time::sleep(Duration::from_secs(backoff_seconds(retry_cfg.backoff, a))).await;
                    }
                }
            }
        }

        if sandbox_result.is_none() {
            if let Some(fallback) = &step_def.fallback {
                attempt += 1;
                let fallback_prompt =
                    if fallback.prompt.trim().is_empty() { resolved_prompt.clone() } else { fallback.prompt.clone() };
                let fallback_prompt = template::resolve_templates(&fallback_prompt, &render_ctx);
                let fallback_request = SandboxRequest {
                    prompt: fallback_prompt,
                    model: fallback.model.clone(),
                    max_turns: effective_max_turns,
                    timeout: request.timeout,
                    output_format: request.output_format.clone(),
                };
                match self.sandbox.query(fallback_request, cancel.clone()).await {
                    Ok(result) => {
                        effective_model = fallback.model.clone();
                        sandbox_result = Some(result);
                        last_error = None;
                    }
                    Err(SandboxError::Cancelled) => return cancelled_result(start.elapsed().as_secs_f64()),
                    Err(SandboxError::Runtime(msg)) => last_error = Some(msg),
                }
            }
        }

        let Some(result) = sandbox_result else {
            return StepResult {
                output: Value::Null,
                cost: 0.0,
                duration_seconds: start.elapsed().as_secs_f64(),
                status: StepStatus::Failed,
                attempt,
                error: last_error,
                model_used: Some(effective_model),
                inject_approval: None,
            };
        };

        let cost = result.total_cost_usd;
        let raw_output = match result.structured_output {
            Some(v) => Value::from_json(v),
            None => Value::Scalar(result.text.clone()),
        };

        let global_policies = parse_policy_definitions(&workflow.policies);
        let step_refs = step.policies.as_ref().map(|raw| parse_step_policy_refs(raw));
        let applicable = crate::policy::resolve_step_policies(step_refs.as_deref(), &global_policies);
        let engine = PolicyEngine::new(applicable);
        let input_value = Value::Json(serde_json::to_value(&ctx.input).unwrap_or(serde_json::Value::Null));
        let run_id_str = run.id.to_string();
        let policy_ctx =
            PolicyContext { step_id: &step.id, run_id: &run_id_str, total_cost_usd: ctx.costs + cost, input: &input_value };

        let (final_output, status, error, inject_approval) = match engine.evaluate(&raw_output, &policy_ctx, cost).await
        {
            Ok(eval) => {
                for violation in &eval.violations {
                    let row = PersistedPolicyViolation {
                        id: Uuid::new_v4(),
                        run_id: run.id,
                        step_id: step.id.clone(),
                        policy_id: violation.policy_id.clone(),
                        severity: violation.severity.clone(),
                        trigger_details: violation.trigger_details.clone(),
                        action_taken: violation.action_taken.clone(),
                        output_modified: violation.output_modified,
                        created_at: Utc::now(),
                    };
                    self.store.record_policy_violation(row).await.ok();
                }
                if eval.should_block {
                    (Value::Null, StepStatus::Failed, eval.block_reason, None)
                } else if eval.modified_output.is_null() {
                    (eval.modified_output, StepStatus::Skipped, None, eval.approval_config)
                } else {
                    (eval.modified_output, StepStatus::Completed, None, eval.approval_config)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, step_id = %step.id, "policy evaluation failed");
                (raw_output, StepStatus::Completed, None, None)
            }
        };

        if status != StepStatus::Failed {
            write_csv_output(step_def, &final_output, run.id).await;
        }

        if !step.no_cache && status != StepStatus::Failed {
            self.store
                .cache_put(StepCacheEntry {
                    cache_key: key,
                    output: final_output.clone(),
                    cost,
                    hit_count: 0,
                    created_at: Utc::now(),
                    expires_at: None,
                })
                .await
                .ok();
        }

        if let (Some(cfg), Some(experiment_id)) = (&step.autopilot, effective.experiment_id) {
            if cfg.enabled {
                let variant_id = effective.variant_id.clone().unwrap_or_else(|| "control".to_string());
                let judge = SandboxJudge { sandbox: self.sandbox.as_ref() };
                let quality = autopilot::evaluate_result(cfg, step_def, &final_output, &judge).await;
                let sample = AutoPilotSample {
                    id: Uuid::new_v4(),
                    experiment_id,
                    run_id: run.id,
                    variant_id,
                    output: final_output.clone(),
                    quality_score: quality,
                    cost_usd: cost,
                    duration_seconds: start.elapsed().as_secs_f64(),
                    created_at: Utc::now(),
                };
                self.store.save_autopilot_sample(sample).await.ok();
                self.maybe_complete_experiment(&workflow.name, &step.id, cfg).await;
            }
        }

        StepResult {
            output: final_output,
            cost,
            duration_seconds: start.elapsed().as_secs_f64(),
            status,
            attempt,
            error,
            model_used: Some(effective_model),
            inject_approval,
        }
    }

    async fn maybe_complete_experiment(&self, workflow_name: &str, step_id: &str, cfg: &crate::dag::AutoPilotConfig) {
        let Ok(Some(mut experiment)) = self.store.get_or_create_experiment(workflow_name, step_id).await else {
            return;
        };
        if experiment.status != ExperimentStatus::Running {
            return;
        }
        let Ok(counts) = self.store.variant_sample_counts(experiment.id).await else { return };
        let total: u64 = counts.iter().map(|(_, c)| *c).sum();
        if (total as u32) < cfg.min_samples * cfg.variants.len().max(1) as u32 {
            return;
        }
        let Ok(stats) = self.store.variant_stats(experiment.id).await else { return };
        let Some(winner) = autopilot::select_winner(&stats, cfg) else { return };

        experiment.status = ExperimentStatus::Completed;
        if cfg.auto_deploy {
            experiment.deployed_variant_id = Some(winner.variant_id.clone());
        }
        experiment.completed_at = Some(Utc::now());
        self.store.save_experiment(experiment).await.ok();
    }

    async fn resolve_autopilot_variant(&self, workflow: &WorkflowDefinition, step: &StepDefinition) -> EffectiveStep {
        let Some(cfg) = &step.autopilot else {
            return EffectiveStep { def: step.clone(), variant_id: None, experiment_id: None };
        };
        if !cfg.enabled || cfg.variants.is_empty() {
            return EffectiveStep { def: step.clone(), variant_id: None, experiment_id: None };
        }
        if cfg.sample_rate < 1.0 && rand::thread_rng().gen::<f64>() > cfg.sample_rate {
            return EffectiveStep { def: step.clone(), variant_id: None, experiment_id: None };
        }

        let experiment = match self.store.get_or_create_experiment(&workflow.name, &step.id).await {
            Ok(Some(e)) => e,
            Ok(None) => {
                let e = AutoPilotExperiment {
                    id: Uuid::new_v4(),
                    workflow_name: workflow.name.clone(),
                    step_id: step.id.clone(),
                    status: ExperimentStatus::Running,
                    optimize_for: format!("{:?}", cfg.optimize_for).to_lowercase(),
                    min_samples: cfg.min_samples,
                    auto_deploy: cfg.auto_deploy,
                    quality_threshold: cfg.quality_threshold,
                    deployed_variant_id: None,
                    created_at: Utc::now(),
                    completed_at: None,
                };
                self.store.save_experiment(e.clone()).await.ok();
                e
            }
            Err(e) => {
                tracing::warn!(error = %e, "autopilot experiment lookup failed");
                return EffectiveStep { def: step.clone(), variant_id: None, experiment_id: None };
            }
        };

        if let Some(deployed) = &experiment.deployed_variant_id {
            if let Some(variant) = cfg.variants.iter().find(|v| &v.id == deployed) {
                return EffectiveStep {
                    def: autopilot::apply_variant(step, variant),
                    variant_id: Some(variant.id.clone()),
                    experiment_id: Some(experiment.id),
                };
            }
        }

        match autopilot::pick_variant(self.store.as_ref(), experiment.id, &cfg.variants).await {
            Ok(Some(variant)) => EffectiveStep {
                def: autopilot::apply_variant(step, &variant),
                variant_id: Some(variant.id.clone()),
                experiment_id: Some(experiment.id),
            },
            _ => EffectiveStep { def: step.clone(), variant_id: None, experiment_id: Some(experiment.id) },
        }
    }

    async fn route_model(
        &self,
        workflow: &WorkflowDefinition,
        step: &StepDefinition,
        run_id: Uuid,
        costs: f64,
        max_cost: Option<f64>,
    ) -> Option<(String, u32)> {
        let slo_cfg = step.slo.as_ref()?;
        let slo = Slo {
            quality_min: slo_cfg.quality_min,
            cost_max_usd: slo_cfg.cost_max_usd.unwrap_or(0.20),
            latency_max_seconds: slo_cfg.latency_max_seconds.unwrap_or(120.0),
            optimize_for: translate_optimize_for(slo_cfg.optimize_for),
        };
        let pool: Vec<ModelOption> = step
            .model_pool
            .as_ref()
            .map(|opts| {
                opts.iter().map(|o| ModelOption::new(o.id.clone(), o.model.clone(), o.max_turns.unwrap_or(10))).collect()
            })
            .unwrap_or_else(optimizer::default_model_pool);

        let pressure = optimizer::calculate_budget_pressure(costs, max_cost);
        let decision = self.optimizer.select_model(&step.id, &workflow.name, &slo, &pool, pressure).await;

        self.store
            .record_routing_decision(RoutingDecision {
                id: Uuid::new_v4(),
                run_id,
                step_id: step.id.clone(),
                selected_model: decision.selected.model.clone(),
                variant_id: None,
                reason: decision.reason.clone(),
                budget_pressure: decision.budget_pressure,
                confidence: decision.confidence,
                alternatives_considered: decision.alternatives.iter().map(|a| a.model.clone()).collect(),
                created_at: Utc::now(),
            })
            .await
            .ok();

        Some((decision.selected.model, decision.selected.max_turns))
    }
}

fn translate_optimize_for(o: DagOptimizeFor) -> optimizer::OptimizeFor {
    match o {
        DagOptimizeFor::Cost => optimizer::OptimizeFor::Cost,
        DagOptimizeFor::Quality => optimizer::OptimizeFor::Quality,
        DagOptimizeFor::Latency => optimizer::OptimizeFor::Latency,
        DagOptimizeFor::Balanced | DagOptimizeFor::Pareto => optimizer::OptimizeFor::Balanced,
    }
}

fn backoff_seconds(strategy: BackoffStrategy, attempt: u32) -> u64 {
    match strategy {
        BackoffStrategy::Fixed => FIXED_BACKOFF_SECONDS,
        BackoffStrategy::Exponential => 2u64.saturating_pow(attempt).min(30),
    }
}

fn cache_key(workflow_name: &str, step_id: &str, resolved_prompt: &str, effective_model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_name.as_bytes());
    hasher.update(b"::");
    hasher.update(step_id.as_bytes());
    hasher.update(b"::");
    hasher.update(resolved_prompt.as_bytes());
    hasher.update(b"::");
    hasher.update(effective_model.as_bytes());
    hex::encode(hasher.finalize())
}

/// Appends (or starts) a step's CSV export, silently doing nothing when the
/// step has no `csv_output` configured. A `new_file` step gets a fresh
/// timestamped file per run; `append` writes into one running file, adding
/// the header only the first time.
async fn write_csv_output(step: &StepDefinition, output: &Value, run_id: Uuid) {
    let Some(cfg) = &step.csv_output else { return };
    if let Err(e) = write_csv_output_inner(cfg, &step.id, output, run_id).await {
        tracing::warn!(error = %e, step_id = %step.id, run_id = %run_id, "failed to write csv output");
    }
}

async fn write_csv_output_inner(
    cfg: &crate::dag::CsvOutputConfig,
    step_id: &str,
    output: &Value,
    _run_id: Uuid,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&cfg.directory).await?;
    let base_name = match cfg.filename.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => step_id,
    };
    let path = match cfg.mode {
        CsvMode::Append => std::path::Path::new(&cfg.directory).join(format!("{base_name}.csv")),
        CsvMode::NewFile => std::path::Path::new(&cfg.directory)
            .join(format!("{base_name}_{}.csv", Utc::now().format("%Y%m%dT%H%M%S%.6f"))),
    };

    let rows = csv_rows(output);
    if rows.is_empty() {
        return Ok(());
    }

    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        for (key, _) in row {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let file_exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
    let write_header = cfg.mode == CsvMode::NewFile || !file_exists;

    let mut buffer = String::new();
    if write_header {
        buffer.push_str(&columns.iter().map(|c| csv_escape(c)).collect::<Vec<_>>().join(","));
        buffer.push('\n');
    }
    for row in &rows {
        let rendered: Vec<String> = columns
            .iter()
            .map(|col| row.iter().find(|(k, _)| k == col).map(|(_, v)| csv_escape(v)).unwrap_or_default())
            .collect();
        buffer.push_str(&rendered.join(","));
        buffer.push('\n');
    }

    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(buffer.as_bytes()).await?;
    Ok(())
}

/// Flattens a step's output into CSV rows: an object becomes one row, a list
/// of objects becomes one row per entry, and anything else becomes a single
/// `value` column.
fn csv_rows(output: &Value) -> Vec<Vec<(String, String)>> {
    match output {
        Value::Json(serde_json::Value::Object(map)) => {
            vec![map.iter().map(|(k, v)| (k.clone(), json_scalar(v))).collect()]
        }
        Value::Json(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), json_scalar(v))).collect(),
                other => vec![("value".to_string(), json_scalar(other))],
            })
            .collect(),
        Value::List(items) => items.iter().flat_map(csv_rows).collect(),
        Value::Null => Vec::new(),
        Value::Scalar(s) => vec![vec![("value".to_string(), s.clone())]],
        Value::Number(n) => vec![vec![("value".to_string(), n.to_string())]],
        Value::Bool(b) => vec![vec![("value".to_string(), b.to_string())]],
    }
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn cancelled_result(duration_seconds: f64) -> StepResult {
    StepResult {
        output: Value::Null,
        cost: 0.0,
        duration_seconds,
        status: StepStatus::Failed,
        attempt: 0,
        error: Some(SandcastleError::Cancelled.to_string()),
        model_used: None,
        inject_approval: None,
    }
}

fn parse_policy_definitions(raw: &[serde_json::Value]) -> Vec<PolicyDefinition> {
    raw.iter()
        .filter_map(|v| match serde_json::from_value::<PolicyDefinition>(v.clone()) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(error = %e, "could not parse policy definition");
                None
            }
        })
        .collect()
}

fn parse_step_policy_refs(raw: &[serde_json::Value]) -> Vec<StepPolicyRef> {
    raw.iter()
        .filter_map(|v| match serde_json::from_value::<StepPolicyRef>(v.clone()) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(error = %e, "could not parse step policy reference");
                None
            }
        })
        .collect()
}

struct SandboxJudge<'a> {
    sandbox: &'a dyn SandboxRuntime,
}

#[async_trait]
impl<'a> LlmJudge for SandboxJudge<'a> {
    async fn rate(&self, prompt: &str) -> anyhow::Result<f64> {
        let request =
            SandboxRequest { prompt: prompt.to_string(), model: "haiku".to_string(), max_turns: 1, timeout: 30, output_format: None };
        let result =
            self.sandbox.query(request, CancelSignal::new()).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        result.text.trim().parse::<f64>().map_err(|_| anyhow::anyhow!("judge response was not a number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_capped_at_thirty() {
        assert_eq!(backoff_seconds(BackoffStrategy::Exponential, 1), 2);
        assert_eq!(backoff_seconds(BackoffStrategy::Exponential, 10), 30);
    }

    #[test]
    fn backoff_is_constant_when_fixed() {
        assert_eq!(backoff_seconds(BackoffStrategy::Fixed, 1), FIXED_BACKOFF_SECONDS);
        assert_eq!(backoff_seconds(BackoffStrategy::Fixed, 5), FIXED_BACKOFF_SECONDS);
    }

    #[test]
    fn cache_key_changes_with_model() {
        let a = cache_key("wf", "s1", "prompt", "haiku");
        let b = cache_key("wf", "s1", "prompt", "sonnet");
        assert_ne!(a, b);
    }

    #[test]
    fn pareto_maps_to_balanced_optimizer_target() {
        assert_eq!(translate_optimize_for(DagOptimizeFor::Pareto), optimizer::OptimizeFor::Balanced);
        assert_eq!(translate_optimize_for(DagOptimizeFor::Cost), optimizer::OptimizeFor::Cost);
    }

    #[test]
    fn csv_rows_flattens_a_single_object() {
        let output = Value::Json(serde_json::json!({"name": "Alice", "score": 95}));
        let rows = csv_rows(&output);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains(&("name".to_string(), "Alice".to_string())));
        assert!(rows[0].contains(&("score".to_string(), "95".to_string())));
    }

    #[test]
    fn csv_rows_flattens_a_list_of_objects() {
        let output = Value::Json(serde_json::json!([{"name": "Alice"}, {"name": "Bob"}]));
        let rows = csv_rows(&output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![("name".to_string(), "Bob".to_string())]);
    }

    #[test]
    fn csv_rows_wraps_a_scalar_in_a_value_column() {
        let rows = csv_rows(&Value::Scalar("Hello world".to_string()));
        assert_eq!(rows, vec![vec![("value".to_string(), "Hello world".to_string())]]);
    }

    #[test]
    fn csv_escape_quotes_fields_with_commas() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("has \"quote\""), "\"has \"\"quote\"\"\"");
    }
}
