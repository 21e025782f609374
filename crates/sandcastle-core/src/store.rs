// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence adapter seam. `Store` is the trait the executor and
//! optimizer depend on; `InMemoryStore` is the default in-process
//! implementation (a real backend can be swapped in behind the same trait
//! without touching caller code).

use crate::autopilot::{ExperimentSource, VariantStats};
use crate::model::{
    ApprovalRequest, AutoPilotExperiment, AutoPilotSample, DeadLetterItem, PolicyViolation, Run, RunCheckpoint,
    RunStep, RunStatus, RoutingDecision, StepCacheEntry, StepStatus,
};
use crate::optimizer::{PerformanceSource, PerformanceStats};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_run(&self, run: Run) -> anyhow::Result<()>;
    async fn get_run(&self, run_id: Uuid) -> anyhow::Result<Option<Run>>;
    async fn update_run(&self, run: Run) -> anyhow::Result<()>;

    async fn create_step(&self, step: RunStep) -> anyhow::Result<()>;
    async fn update_step(&self, step: RunStep) -> anyhow::Result<()>;
    async fn steps_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<RunStep>>;

    async fn save_checkpoint(&self, checkpoint: RunCheckpoint) -> anyhow::Result<()>;
    async fn latest_checkpoint(&self, run_id: Uuid) -> anyhow::Result<Option<RunCheckpoint>>;

    async fn cache_get(&self, cache_key: &str) -> anyhow::Result<Option<StepCacheEntry>>;
    async fn cache_put(&self, entry: StepCacheEntry) -> anyhow::Result<()>;

    async fn create_approval(&self, approval: ApprovalRequest) -> anyhow::Result<()>;
    async fn get_approval(&self, approval_id: Uuid) -> anyhow::Result<Option<ApprovalRequest>>;
    async fn update_approval(&self, approval: ApprovalRequest) -> anyhow::Result<()>;
    async fn approval_for_step(&self, run_id: Uuid, step_id: &str) -> anyhow::Result<Option<ApprovalRequest>>;

    async fn record_routing_decision(&self, decision: RoutingDecision) -> anyhow::Result<()>;
    async fn record_policy_violation(&self, violation: PolicyViolation) -> anyhow::Result<()>;
    async fn record_dead_letter(&self, item: DeadLetterItem) -> anyhow::Result<()>;

    async fn get_or_create_experiment(
        &self,
        workflow_name: &str,
        step_id: &str,
    ) -> anyhow::Result<Option<AutoPilotExperiment>>;
    async fn save_experiment(&self, experiment: AutoPilotExperiment) -> anyhow::Result<()>;
    async fn save_autopilot_sample(&self, sample: AutoPilotSample) -> anyhow::Result<()>;
    async fn autopilot_samples(&self, experiment_id: Uuid) -> anyhow::Result<Vec<AutoPilotSample>>;
}

/// Default in-process persistence backend. No external dependency: every
/// table is a `DashMap` keyed by id, scoped to the process lifetime.
#[derive(Default)]
pub struct InMemoryStore {
    runs: DashMap<Uuid, Run>,
    steps: DashMap<Uuid, RunStep>,
    checkpoints: DashMap<Uuid, Vec<RunCheckpoint>>,
    cache: DashMap<String, StepCacheEntry>,
    approvals: DashMap<Uuid, ApprovalRequest>,
    routing_decisions: DashMap<Uuid, RoutingDecision>,
    policy_violations: DashMap<Uuid, PolicyViolation>,
    dead_letters: DashMap<Uuid, DeadLetterItem>,
    experiments: DashMap<(String, String), Uuid>,
    experiments_by_id: DashMap<Uuid, AutoPilotExperiment>,
    autopilot_samples: DashMap<Uuid, Vec<AutoPilotSample>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_run(&self, run: Run) -> anyhow::Result<()> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> anyhow::Result<Option<Run>> {
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn update_run(&self, run: Run) -> anyhow::Result<()> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn create_step(&self, step: RunStep) -> anyhow::Result<()> {
        self.steps.insert(step.id, step);
        Ok(())
    }

    async fn update_step(&self, step: RunStep) -> anyhow::Result<()> {
        self.steps.insert(step.id, step);
        Ok(())
    }

    async fn steps_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<RunStep>> {
        Ok(self.steps.iter().filter(|e| e.run_id == run_id).map(|e| e.clone()).collect())
    }

    async fn save_checkpoint(&self, checkpoint: RunCheckpoint) -> anyhow::Result<()> {
        self.checkpoints.entry(checkpoint.run_id).or_default().push(checkpoint);
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: Uuid) -> anyhow::Result<Option<RunCheckpoint>> {
        Ok(self.checkpoints.get(&run_id).and_then(|list| list.last().cloned()))
    }

    async fn cache_get(&self, cache_key: &str) -> anyhow::Result<Option<StepCacheEntry>> {
        if let Some(mut entry) = self.cache.get_mut(cache_key) {
            if let Some(expires_at) = entry.expires_at {
                if expires_at < Utc::now() {
                    drop(entry);
                    self.cache.remove(cache_key);
                    return Ok(None);
                }
            }
            entry.hit_count += 1;
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn cache_put(&self, entry: StepCacheEntry) -> anyhow::Result<()> {
        self.cache.insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn create_approval(&self, approval: ApprovalRequest) -> anyhow::Result<()> {
        self.approvals.insert(approval.id, approval);
        Ok(())
    }

    async fn get_approval(&self, approval_id: Uuid) -> anyhow::Result<Option<ApprovalRequest>> {
        Ok(self.approvals.get(&approval_id).map(|a| a.clone()))
    }

    async fn update_approval(&self, approval: ApprovalRequest) -> anyhow::Result<()> {
        self.approvals.insert(approval.id, approval);
        Ok(())
    }

    async fn approval_for_step(&self, run_id: Uuid, step_id: &str) -> anyhow::Result<Option<ApprovalRequest>> {
        Ok(self
            .approvals
            .iter()
            .filter(|a| a.run_id == run_id && a.step_id == step_id)
            .map(|a| a.clone())
            .max_by_key(|a| a.created_at))
    }

    async fn record_routing_decision(&self, decision: RoutingDecision) -> anyhow::Result<()> {
        self.routing_decisions.insert(decision.id, decision);
        Ok(())
    }

    async fn record_policy_violation(&self, violation: PolicyViolation) -> anyhow::Result<()> {
        self.policy_violations.insert(violation.id, violation);
        Ok(())
    }

    async fn record_dead_letter(&self, item: DeadLetterItem) -> anyhow::Result<()> {
        self.dead_letters.insert(item.id, item);
        Ok(())
    }

    async fn get_or_create_experiment(
        &self,
        workflow_name: &str,
        step_id: &str,
    ) -> anyhow::Result<Option<AutoPilotExperiment>> {
        let key = (workflow_name.to_string(), step_id.to_string());
        if let Some(id) = self.experiments.get(&key) {
            return Ok(self.experiments_by_id.get(&id).map(|e| e.clone()));
        }
        Ok(None)
    }

    async fn save_experiment(&self, experiment: AutoPilotExperiment) -> anyhow::Result<()> {
        let key = (experiment.workflow_name.clone(), experiment.step_id.clone());
        self.experiments.insert(key, experiment.id);
        self.experiments_by_id.insert(experiment.id, experiment);
        Ok(())
    }

    async fn save_autopilot_sample(&self, sample: AutoPilotSample) -> anyhow::Result<()> {
        self.autopilot_samples.entry(sample.experiment_id).or_default().push(sample);
        Ok(())
    }

    async fn autopilot_samples(&self, experiment_id: Uuid) -> anyhow::Result<Vec<AutoPilotSample>> {
        Ok(self.autopilot_samples.get(&experiment_id).map(|v| v.clone()).unwrap_or_default())
    }
}

/// Groups completed `RunStep` records by their recorded `model` field
/// (rather than bucketing by cost) to produce optimizer performance stats.
#[async_trait]
impl PerformanceSource for InMemoryStore {
    async fn query_stats(&self, step_id: &str, workflow_name: &str) -> anyhow::Result<Vec<PerformanceStats>> {
        let mut by_model: HashMap<String, (f64, f64, u64)> = HashMap::new();
        for entry in self.steps.iter() {
            let step = entry.value();
            if step.step_id != step_id || step.status != StepStatus::Completed {
                continue;
            }
            let Some(model) = &step.model else { continue };
            let bucket = by_model.entry(model.clone()).or_insert((0.0, 0.0, 0));
            bucket.0 += step.cost;
            bucket.1 += step.duration_seconds;
            bucket.2 += 1;
        }

        let mut stats: Vec<PerformanceStats> = by_model
            .into_iter()
            .map(|(model, (total_cost, total_duration, count))| PerformanceStats {
                model,
                avg_quality: None,
                avg_cost: Some(total_cost / count as f64),
                avg_latency: Some(total_duration / count as f64),
                sample_count: count,
            })
            .collect();

        for experiment in self.experiments_by_id.iter() {
            if experiment.step_id != step_id || experiment.workflow_name != workflow_name {
                continue;
            }
            let samples = self.autopilot_samples.get(&experiment.id).map(|v| v.clone()).unwrap_or_default();
            let mut by_variant: HashMap<String, (f64, f64, f64, u64)> = HashMap::new();
            for sample in &samples {
                let bucket = by_variant.entry(sample.variant_id.clone()).or_insert((0.0, 0.0, 0.0, 0));
                bucket.0 += sample.quality_score;
                bucket.1 += sample.cost_usd;
                bucket.2 += sample.duration_seconds;
                bucket.3 += 1;
            }
            for (variant_id, (q, c, d, n)) in by_variant {
                stats.push(PerformanceStats {
                    model: variant_id,
                    avg_quality: Some(q / n as f64),
                    avg_cost: Some(c / n as f64),
                    avg_latency: Some(d / n as f64),
                    sample_count: n,
                });
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl ExperimentSource for InMemoryStore {
    async fn variant_sample_counts(&self, experiment_id: Uuid) -> anyhow::Result<Vec<(String, u64)>> {
        let samples = self.autopilot_samples.get(&experiment_id).map(|v| v.clone()).unwrap_or_default();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for sample in samples {
            *counts.entry(sample.variant_id).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn variant_stats(&self, experiment_id: Uuid) -> anyhow::Result<Vec<VariantStats>> {
        let samples = self.autopilot_samples.get(&experiment_id).map(|v| v.clone()).unwrap_or_default();
        let mut by_variant: HashMap<String, (f64, f64, f64, u64)> = HashMap::new();
        for sample in &samples {
            let bucket = by_variant.entry(sample.variant_id.clone()).or_insert((0.0, 0.0, 0.0, 0));
            bucket.0 += sample.quality_score;
            bucket.1 += sample.cost_usd;
            bucket.2 += sample.duration_seconds;
            bucket.3 += 1;
        }
        Ok(by_variant
            .into_iter()
            .map(|(variant_id, (q, c, d, n))| VariantStats {
                variant_id,
                count: n,
                avg_quality: q / n as f64,
                avg_cost: c / n as f64,
                avg_duration: d / n as f64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    #[tokio::test]
    async fn run_round_trips() {
        let store = InMemoryStore::new();
        let run = Run::new("demo", ValueMap::new());
        let run_id = run.id;
        store.create_run(run).await.unwrap();
        let fetched = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(fetched.workflow_name, "demo");
        assert_eq!(fetched.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn cache_entry_expires() {
        let store = InMemoryStore::new();
        let entry = StepCacheEntry {
            cache_key: "k".to_string(),
            output: crate::value::Value::Scalar("v".to_string()),
            cost: 0.0,
            hit_count: 0,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        };
        store.cache_put(entry).await.unwrap();
        assert!(store.cache_get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_group_by_recorded_model() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        let mut step = RunStep::new(run_id, "summarize", "prompt");
        step.status = StepStatus::Completed;
        step.model = Some("haiku".to_string());
        step.cost = 0.02;
        step.duration_seconds = 4.0;
        store.create_step(step).await.unwrap();

        let stats = PerformanceSource::query_stats(&store, "summarize", "wf").await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].model, "haiku");
    }
}
