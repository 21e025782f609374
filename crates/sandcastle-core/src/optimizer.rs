// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Real-time cost-latency optimizer: SLO-based dynamic model routing using
//! historical performance data from completed runs and AutoPilot samples.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Slo {
    pub quality_min: f64,
    pub cost_max_usd: f64,
    pub latency_max_seconds: f64,
    pub optimize_for: OptimizeFor,
}

impl Default for Slo {
    fn default() -> Self {
        Self {
            quality_min: 0.6,
            cost_max_usd: 0.20,
            latency_max_seconds: 120.0,
            optimize_for: OptimizeFor::Balanced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeFor {
    Cost,
    Quality,
    Latency,
    Balanced,
}

#[derive(Debug, Clone)]
pub struct ModelOption {
    pub id: String,
    pub model: String,
    pub max_turns: u32,
    pub avg_quality: Option<f64>,
    pub avg_cost: Option<f64>,
    pub avg_latency: Option<f64>,
    pub sample_count: u64,
}

impl ModelOption {
    pub fn new(id: impl Into<String>, model: impl Into<String>, max_turns: u32) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            max_turns,
            avg_quality: None,
            avg_cost: None,
            avg_latency: None,
            sample_count: 0,
        }
    }
}

/// The pool shipped when a step doesn't declare its own model options.
pub fn default_model_pool() -> Vec<ModelOption> {
    vec![
        ModelOption::new("fast-cheap", "haiku", 5),
        ModelOption::new("balanced", "sonnet", 10),
        ModelOption::new("thorough", "opus", 20),
    ]
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub selected: ModelOption,
    pub reason: String,
    pub alternatives: Vec<ModelOption>,
    pub budget_pressure: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct PerformanceStats {
    pub model: String,
    pub avg_quality: Option<f64>,
    pub avg_cost: Option<f64>,
    pub avg_latency: Option<f64>,
    pub sample_count: u64,
}

/// Historical performance source. Implemented by the persistence layer;
/// kept as a trait so the optimizer has no direct storage dependency.
#[async_trait]
pub trait PerformanceSource: Send + Sync {
    async fn query_stats(&self, step_id: &str, workflow_name: &str) -> anyhow::Result<Vec<PerformanceStats>>;
}

pub struct CostLatencyOptimizer<S: PerformanceSource> {
    source: S,
    cache: Mutex<HashMap<String, (Instant, Vec<PerformanceStats>)>>,
    cache_ttl: Duration,
}

impl<S: PerformanceSource> CostLatencyOptimizer<S> {
    pub fn new(source: S) -> Self {
        Self { source, cache: Mutex::new(HashMap::new()), cache_ttl: Duration::from_secs(300) }
    }

    pub async fn select_model(
        &self,
        step_id: &str,
        workflow_name: &str,
        slo: &Slo,
        model_pool: &[ModelOption],
        budget_pressure: f64,
    ) -> RoutingDecision {
        let stats = self.performance_stats(step_id, workflow_name).await;
        let enriched = enrich_pool(model_pool, &stats);

        let mut viable: Vec<ModelOption> = enriched
            .iter()
            .filter(|o| o.avg_quality.map(|q| q >= slo.quality_min).unwrap_or(true))
            .filter(|o| o.avg_cost.map(|c| c <= slo.cost_max_usd).unwrap_or(true))
            .filter(|o| o.avg_latency.map(|l| l <= slo.latency_max_seconds).unwrap_or(true))
            .cloned()
            .collect();

        if viable.is_empty() {
            viable = vec![fallback(&enriched)];
        }

        let (mut selected, mut reason) = if budget_pressure > 0.9 {
            let cheapest = viable
                .iter()
                .min_by(|a, b| {
                    a.avg_cost.unwrap_or(f64::INFINITY).partial_cmp(&b.avg_cost.unwrap_or(f64::INFINITY)).unwrap()
                })
                .cloned()
                .unwrap();
            (cheapest, format!("Budget critical ({:.0}%). Forced cheapest viable option.", budget_pressure * 100.0))
        } else if budget_pressure > 0.7 {
            (
                score_with_bias(&viable, 0.7),
                format!("Budget pressure ({:.0}%). Biased toward cost savings.", budget_pressure * 100.0),
            )
        } else {
            (score_options(&viable, slo), format!("Optimized for {}.", optimize_for_label(slo.optimize_for)))
        };

        if enriched.iter().all(|o| o.sample_count == 0) {
            selected = fallback(&enriched);
            reason = "Cold start - no historical data. Using balanced default.".to_string();
        }

        let confidence = confidence_for(&selected);
        let alternatives = viable.into_iter().filter(|o| o.id != selected.id).collect();

        RoutingDecision { selected, reason, alternatives, budget_pressure, confidence }
    }

    async fn performance_stats(&self, step_id: &str, workflow_name: &str) -> Vec<PerformanceStats> {
        let cache_key = format!("{}:{}", workflow_name, step_id);
        let now = Instant::now();

        {
            let cache = self.cache.lock().await;
            if let Some((cached_at, data)) = cache.get(&cache_key) {
                if now.duration_since(*cached_at) < self.cache_ttl {
                    return data.clone();
                }
            }
        }

        let stats = match self.source.query_stats(step_id, workflow_name).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "could not load performance stats");
                Vec::new()
            }
        };

        self.cache.lock().await.insert(cache_key, (now, stats.clone()));
        stats
    }
}

fn enrich_pool(pool: &[ModelOption], stats: &[PerformanceStats]) -> Vec<ModelOption> {
    let stats_map: HashMap<&str, &PerformanceStats> = stats.iter().map(|s| (s.model.as_str(), s)).collect();
    pool.iter()
        .map(|option| match stats_map.get(option.model.as_str()) {
            Some(s) => ModelOption {
                id: option.id.clone(),
                model: option.model.clone(),
                max_turns: option.max_turns,
                avg_quality: s.avg_quality,
                avg_cost: s.avg_cost,
                avg_latency: s.avg_latency,
                sample_count: s.sample_count,
            },
            None => option.clone(),
        })
        .collect()
}

fn score_options(options: &[ModelOption], slo: &Slo) -> ModelOption {
    let score = |o: &ModelOption| -> f64 {
        let q = o.avg_quality.unwrap_or(0.5);
        let c = o.avg_cost.unwrap_or(0.10);
        let latency = o.avg_latency.unwrap_or(60.0);
        match slo.optimize_for {
            OptimizeFor::Cost => -c + (q * 0.1),
            OptimizeFor::Quality => q - (c * 0.1),
            OptimizeFor::Latency => -latency + (q * 0.1),
            OptimizeFor::Balanced => (q * 0.4) + (-c * 0.3 / 0.5) + (-latency * 0.3 / 120.0),
        }
    };
    options
        .iter()
        .max_by(|a, b| score(a).partial_cmp(&score(b)).unwrap())
        .cloned()
        .expect("options must be non-empty")
}

fn score_with_bias(options: &[ModelOption], cost_bias: f64) -> ModelOption {
    let score = |o: &ModelOption| -> f64 {
        let q = o.avg_quality.unwrap_or(0.5);
        let c = o.avg_cost.unwrap_or(0.10);
        (q * (1.0 - cost_bias)) + (-c * cost_bias / 0.5)
    };
    options
        .iter()
        .max_by(|a, b| score(a).partial_cmp(&score(b)).unwrap())
        .cloned()
        .expect("options must be non-empty")
}

fn fallback(pool: &[ModelOption]) -> ModelOption {
    let mut sorted: Vec<&ModelOption> = pool.iter().collect();
    sorted.sort_by(|a, b| a.avg_cost.unwrap_or(0.10).partial_cmp(&b.avg_cost.unwrap_or(0.10)).unwrap());
    sorted[sorted.len() / 2].clone()
}

fn confidence_for(option: &ModelOption) -> f64 {
    match option.sample_count {
        n if n >= 50 => 0.95,
        n if n >= 20 => 0.8,
        n if n >= 5 => 0.6,
        n if n >= 1 => 0.3,
        _ => 0.1,
    }
}

fn optimize_for_label(optimize_for: OptimizeFor) -> &'static str {
    match optimize_for {
        OptimizeFor::Cost => "cost",
        OptimizeFor::Quality => "quality",
        OptimizeFor::Latency => "latency",
        OptimizeFor::Balanced => "balanced",
    }
}

/// Current budget utilization in `[0, 1]`.
pub fn calculate_budget_pressure(current_cost: f64, max_cost: Option<f64>) -> f64 {
    match max_cost {
        Some(max) if max > 0.0 => (current_cost / max).min(1.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptySource;

    #[async_trait]
    impl PerformanceSource for EmptySource {
        async fn query_stats(&self, _step_id: &str, _workflow_name: &str) -> anyhow::Result<Vec<PerformanceStats>> {
            Ok(Vec::new())
        }
    }

    struct FixedSource(Vec<PerformanceStats>);

    #[async_trait]
    impl PerformanceSource for FixedSource {
        async fn query_stats(&self, _step_id: &str, _workflow_name: &str) -> anyhow::Result<Vec<PerformanceStats>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn cold_start_picks_balanced_fallback() {
        let optimizer = CostLatencyOptimizer::new(EmptySource);
        let decision = optimizer
            .select_model("s1", "wf", &Slo::default(), &default_model_pool(), 0.0)
            .await;
        assert!(decision.reason.contains("Cold start"));
        assert_eq!(decision.selected.model, "sonnet");
    }

    #[tokio::test]
    async fn budget_critical_forces_cheapest() {
        let stats = vec![
            PerformanceStats {
                model: "haiku".to_string(),
                avg_quality: Some(0.7),
                avg_cost: Some(0.01),
                avg_latency: Some(10.0),
                sample_count: 10,
            },
            PerformanceStats {
                model: "opus".to_string(),
                avg_quality: Some(0.9),
                avg_cost: Some(0.50),
                avg_latency: Some(30.0),
                sample_count: 10,
            },
        ];
        let optimizer = CostLatencyOptimizer::new(FixedSource(stats));
        let decision = optimizer
            .select_model("s1", "wf", &Slo::default(), &default_model_pool(), 0.95)
            .await;
        assert_eq!(decision.selected.model, "haiku");
        assert!(decision.reason.contains("Budget critical"));
    }

    #[test]
    fn budget_pressure_caps_at_one() {
        assert_eq!(calculate_budget_pressure(10.0, Some(5.0)), 1.0);
        assert_eq!(calculate_budget_pressure(1.0, Some(4.0)), 0.25);
        assert_eq!(calculate_budget_pressure(1.0, None), 0.0);
    }

    #[test]
    fn confidence_scales_with_samples() {
        let mut option = ModelOption::new("a", "sonnet", 10);
        option.sample_count = 0;
        assert_eq!(confidence_for(&option), 0.1);
        option.sample_count = 50;
        assert_eq!(confidence_for(&option), 0.95);
    }
}
