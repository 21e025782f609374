// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! AutoPilot: self-optimizing step experiments that A/B multiple prompt or
//! model variants and promote the winner once enough samples are in.

use crate::dag::{AutoPilotConfig, EvaluationMethod, StepDefinition, StepType, VariantConfig};
use crate::value::Value;
use async_trait::async_trait;
use uuid::Uuid;

/// Variant sample counts and experiment bookkeeping, backed by the
/// persistence layer.
#[async_trait]
pub trait ExperimentSource: Send + Sync {
    async fn variant_sample_counts(&self, experiment_id: Uuid) -> anyhow::Result<Vec<(String, u64)>>;
    async fn variant_stats(&self, experiment_id: Uuid) -> anyhow::Result<Vec<VariantStats>>;
}

#[derive(Debug, Clone)]
pub struct VariantStats {
    pub variant_id: String,
    pub count: u64,
    pub avg_quality: f64,
    pub avg_cost: f64,
    pub avg_duration: f64,
}

#[derive(Debug, Clone)]
pub struct Winner {
    pub variant_id: String,
    pub count: u64,
    pub avg_quality: f64,
    pub avg_cost: f64,
    pub avg_duration: f64,
}

/// Picks the variant with the fewest recorded samples (round robin).
pub async fn pick_variant<S: ExperimentSource>(
    source: &S,
    experiment_id: Uuid,
    variants: &[VariantConfig],
) -> anyhow::Result<Option<VariantConfig>> {
    if variants.is_empty() {
        return Ok(None);
    }
    let counts = source.variant_sample_counts(experiment_id).await?;
    let count_map: std::collections::HashMap<&str, u64> =
        counts.iter().map(|(id, c)| (id.as_str(), *c)).collect();

    let mut min_count = u64::MAX;
    let mut selected = &variants[0];
    for variant in variants {
        let count = *count_map.get(variant.id.as_str()).unwrap_or(&0);
        if count < min_count {
            min_count = count;
            selected = variant;
        }
    }
    Ok(Some(selected.clone()))
}

/// Produces a step definition with the variant's overrides applied. The
/// variant's own `autopilot` is never carried over, so the derived step does
/// not recurse into another experiment.
pub fn apply_variant(step: &StepDefinition, variant: &VariantConfig) -> StepDefinition {
    StepDefinition {
        id: step.id.clone(),
        prompt: variant.prompt.clone().unwrap_or_else(|| step.prompt.clone()),
        depends_on: step.depends_on.clone(),
        model: variant.model.clone().or_else(|| step.model.clone()),
        max_turns: variant.max_turns.or(step.max_turns),
        timeout: step.timeout,
        parallel_over: step.parallel_over.clone(),
        output_schema: step.output_schema.clone(),
        retry: step.retry.clone(),
        fallback: step.fallback.clone(),
        step_type: StepType::Standard,
        approval_config: None,
        sub_workflow: None,
        autopilot: None,
        slo: step.slo.clone(),
        model_pool: step.model_pool.clone(),
        policies: step.policies.clone(),
        csv_output: step.csv_output.clone(),
        no_cache: step.no_cache,
    }
}

/// Scores a step result in `[0, 1]`.
pub async fn evaluate_result<J: LlmJudge>(
    config: &AutoPilotConfig,
    step: &StepDefinition,
    output: &Value,
    judge: &J,
) -> f64 {
    match config.evaluation.as_ref().map(|e| e.method) {
        Some(EvaluationMethod::SchemaCompleteness) | None => {
            evaluate_schema_completeness(output, step.output_schema.as_ref())
        }
        Some(EvaluationMethod::LlmJudge) => evaluate_llm_judge(output, config, judge).await,
    }
}

fn evaluate_schema_completeness(output: &Value, schema: Option<&serde_json::Value>) -> f64 {
    let Some(schema) = schema else { return if output.is_null() { 0.0 } else { 1.0 } };
    let Value::Json(serde_json::Value::Object(obj)) = output else { return 0.0 };
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else { return 1.0 };
    if properties.is_empty() {
        return 1.0;
    }
    let present = properties
        .keys()
        .filter(|key| obj.get(key.as_str()).map(|v| !v.is_null()).unwrap_or(false))
        .count();
    present as f64 / properties.len() as f64
}

/// LLM-as-judge evaluator, implemented by the sandbox runtime.
#[async_trait]
pub trait LlmJudge: Send + Sync {
    async fn rate(&self, prompt: &str) -> anyhow::Result<f64>;
}

async fn evaluate_llm_judge<J: LlmJudge>(output: &Value, config: &AutoPilotConfig, judge: &J) -> f64 {
    let criteria = config
        .evaluation
        .as_ref()
        .and_then(|e| e.criteria.clone())
        .unwrap_or_else(|| "overall quality".to_string());
    let output_str: String = output.render().chars().take(2000).collect();
    let prompt = format!(
        "Rate the following output on a scale of 0.0 to 1.0 based on: {}\n\nOutput:\n{}\n\nRespond with ONLY a number between 0.0 and 1.0.",
        criteria, output_str
    );
    match judge.rate(&prompt).await {
        Ok(score) => score.clamp(0.0, 1.0),
        Err(e) => {
            tracing::warn!(error = %e, "LLM judge evaluation failed");
            0.5
        }
    }
}

/// Selects the winning variant for the optimization target, given
/// already-aggregated per-variant stats.
pub fn select_winner(stats: &[VariantStats], config: &AutoPilotConfig) -> Option<Winner> {
    if stats.is_empty() {
        return None;
    }

    let candidates: Vec<&VariantStats> =
        stats.iter().filter(|s| s.avg_quality >= config.quality_threshold).collect();

    if candidates.is_empty() {
        let best = stats.iter().max_by(|a, b| a.avg_quality.partial_cmp(&b.avg_quality).unwrap())?;
        return Some(to_winner(best));
    }

    use crate::dag::OptimizeFor;
    let winner = match config.optimize_for {
        OptimizeFor::Cost => candidates.iter().min_by(|a, b| a.avg_cost.partial_cmp(&b.avg_cost).unwrap()),
        OptimizeFor::Latency => {
            candidates.iter().min_by(|a, b| a.avg_duration.partial_cmp(&b.avg_duration).unwrap())
        }
        OptimizeFor::Pareto => {
            let max_cost = candidates.iter().map(|c| c.avg_cost).fold(0.0_f64, f64::max).max(f64::MIN_POSITIVE);
            let max_dur = candidates.iter().map(|c| c.avg_duration).fold(0.0_f64, f64::max).max(f64::MIN_POSITIVE);
            candidates.iter().max_by(|a, b| {
                let score = |c: &&VariantStats| {
                    let cost_score = 1.0 - (c.avg_cost / max_cost);
                    let dur_score = 1.0 - (c.avg_duration / max_dur);
                    (c.avg_quality + cost_score + dur_score) / 3.0
                };
                score(a).partial_cmp(&score(b)).unwrap()
            })
        }
        _ => candidates.iter().max_by(|a, b| a.avg_quality.partial_cmp(&b.avg_quality).unwrap()),
    };

    winner.map(|w| to_winner(w))
}

fn to_winner(stats: &VariantStats) -> Winner {
    Winner {
        variant_id: stats.variant_id.clone(),
        count: stats.count,
        avg_quality: stats.avg_quality,
        avg_cost: stats.avg_cost,
        avg_duration: stats.avg_duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::OptimizeFor;

    fn cfg(optimize_for: OptimizeFor, threshold: f64) -> AutoPilotConfig {
        AutoPilotConfig {
            enabled: true,
            optimize_for,
            variants: Vec::new(),
            min_samples: 10,
            auto_deploy: false,
            quality_threshold: threshold,
            sample_rate: 1.0,
            evaluation: None,
        }
    }

    fn stats(id: &str, quality: f64, cost: f64, duration: f64) -> VariantStats {
        VariantStats { variant_id: id.to_string(), count: 20, avg_quality: quality, avg_cost: cost, avg_duration: duration }
    }

    #[test]
    fn selects_cheapest_above_threshold() {
        let stats = vec![stats("a", 0.8, 0.10, 5.0), stats("b", 0.9, 0.02, 8.0)];
        let winner = select_winner(&stats, &cfg(OptimizeFor::Cost, 0.5)).unwrap();
        assert_eq!(winner.variant_id, "b");
    }

    #[test]
    fn falls_back_to_best_quality_when_none_meet_threshold() {
        let stats = vec![stats("a", 0.2, 0.10, 5.0), stats("b", 0.3, 0.02, 8.0)];
        let winner = select_winner(&stats, &cfg(OptimizeFor::Cost, 0.9)).unwrap();
        assert_eq!(winner.variant_id, "b");
    }

    #[test]
    fn pareto_balances_all_three_axes() {
        let stats = vec![stats("cheap", 0.6, 0.01, 20.0), stats("best", 0.95, 0.05, 5.0)];
        let winner = select_winner(&stats, &cfg(OptimizeFor::Pareto, 0.5)).unwrap();
        assert_eq!(winner.variant_id, "best");
    }

    #[test]
    fn schema_completeness_counts_present_fields() {
        let schema = serde_json::json!({"properties": {"a": {}, "b": {}}});
        let output = Value::Json(serde_json::json!({"a": 1, "b": null}));
        assert_eq!(evaluate_schema_completeness(&output, Some(&schema)), 0.5);
    }

    #[test]
    fn no_schema_scores_by_presence() {
        assert_eq!(evaluate_schema_completeness(&Value::Null, None), 0.0);
        assert_eq!(evaluate_schema_completeness(&Value::Scalar("x".into()), None), 1.0);
    }
}
