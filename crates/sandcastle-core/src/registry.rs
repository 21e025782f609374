// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Model registry: maps model strings to runner configs, API keys, and
//! pricing, plus the ordered failover chains used when a model is
//! rate-limited or unavailable.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Static configuration for a single model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub provider: &'static str,
    pub api_model_id: &'static str,
    pub runner: &'static str,
    pub api_key_env: &'static str,
    pub api_base_url: Option<&'static str>,
    pub input_price_per_m: f64,
    pub output_price_per_m: f64,
}

fn registry() -> &'static HashMap<&'static str, ModelInfo> {
    static REGISTRY: OnceLock<HashMap<&'static str, ModelInfo>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            "sonnet",
            ModelInfo {
                provider: "claude",
                api_model_id: "sonnet",
                runner: "runner.mjs",
                api_key_env: "ANTHROPIC_API_KEY",
                api_base_url: None,
                input_price_per_m: 3.0,
                output_price_per_m: 15.0,
            },
        );
        m.insert(
            "opus",
            ModelInfo {
                provider: "claude",
                api_model_id: "opus",
                runner: "runner.mjs",
                api_key_env: "ANTHROPIC_API_KEY",
                api_base_url: None,
                input_price_per_m: 15.0,
                output_price_per_m: 75.0,
            },
        );
        m.insert(
            "haiku",
            ModelInfo {
                provider: "claude",
                api_model_id: "haiku",
                runner: "runner.mjs",
                api_key_env: "ANTHROPIC_API_KEY",
                api_base_url: None,
                input_price_per_m: 0.80,
                output_price_per_m: 4.0,
            },
        );
        m.insert(
            "minimax/m2.5",
            ModelInfo {
                provider: "minimax",
                api_model_id: "MiniMax-M2.5",
                runner: "runner-openai.mjs",
                api_key_env: "MINIMAX_API_KEY",
                api_base_url: Some("https://api.minimaxi.chat/v1"),
                input_price_per_m: 0.30,
                output_price_per_m: 1.20,
            },
        );
        m.insert(
            "openai/codex-mini",
            ModelInfo {
                provider: "openai",
                api_model_id: "codex-mini",
                runner: "runner-openai.mjs",
                api_key_env: "OPENAI_API_KEY",
                api_base_url: Some("https://api.openai.com/v1"),
                input_price_per_m: 0.25,
                output_price_per_m: 2.0,
            },
        );
        m.insert(
            "openai/codex",
            ModelInfo {
                provider: "openai",
                api_model_id: "codex",
                runner: "runner-openai.mjs",
                api_key_env: "OPENAI_API_KEY",
                api_base_url: Some("https://api.openai.com/v1"),
                input_price_per_m: 1.25,
                output_price_per_m: 10.0,
            },
        );
        m.insert(
            "google/gemini-2.5-pro",
            ModelInfo {
                provider: "google",
                api_model_id: "google/gemini-2.5-pro",
                runner: "runner-openai.mjs",
                api_key_env: "OPENROUTER_API_KEY",
                api_base_url: Some("https://openrouter.ai/api/v1"),
                input_price_per_m: 4.0,
                output_price_per_m: 20.0,
            },
        );
        m
    })
}

fn failover_chains() -> &'static HashMap<&'static str, Vec<&'static str>> {
    static CHAINS: OnceLock<HashMap<&'static str, Vec<&'static str>>> = OnceLock::new();
    CHAINS.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            "sonnet",
            vec!["haiku", "opus", "openai/codex-mini", "minimax/m2.5", "google/gemini-2.5-pro"],
        );
        m.insert(
            "opus",
            vec!["sonnet", "haiku", "google/gemini-2.5-pro", "openai/codex"],
        );
        m.insert(
            "haiku",
            vec!["sonnet", "opus", "minimax/m2.5", "openai/codex-mini"],
        );
        m.insert("minimax/m2.5", vec!["openai/codex-mini", "haiku", "sonnet"]);
        m.insert(
            "openai/codex-mini",
            vec!["openai/codex", "minimax/m2.5", "haiku", "sonnet"],
        );
        m.insert(
            "openai/codex",
            vec!["openai/codex-mini", "sonnet", "google/gemini-2.5-pro"],
        );
        m.insert(
            "google/gemini-2.5-pro",
            vec!["sonnet", "opus", "openai/codex", "minimax/m2.5"],
        );
        m
    })
}

pub fn known_models() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = registry().keys().copied().collect();
    names.sort_unstable();
    names
}

pub fn is_known_model(model: &str) -> bool {
    registry().contains_key(model)
}

pub fn resolve_model(model: &str) -> crate::error::Result<ModelInfo> {
    registry().get(model).cloned().ok_or_else(|| crate::error::SandcastleError::UnknownModel {
        model: model.to_string(),
        available: known_models().join(", "),
    })
}

pub fn failover_chain(model: &str) -> &'static [&'static str] {
    failover_chains().get(model).map(|v| v.as_slice()).unwrap_or(&[])
}

pub fn is_claude_model(model: &str) -> bool {
    registry().get(model).map(|info| info.provider == "claude").unwrap_or(false)
}

/// Reads an API key for a model from the environment, falling back to
/// settings-provided values the caller supplies.
pub fn api_key_from_env_or(model_info: &ModelInfo, fallback: impl FnOnce() -> String) -> String {
    match std::env::var(model_info.api_key_env) {
        Ok(key) if !key.is_empty() => key,
        _ => fallback(),
    }
}

/// Thread-safe failover manager with per-API-key cooldown tracking.
///
/// Process-wide mutable state is scoped to this mutex-guarded map, per
/// design: everything else is explicitly constructed and injected.
pub struct Failover {
    cooldowns: parking_lot::Mutex<HashMap<String, std::time::Instant>>,
}

impl Default for Failover {
    fn default() -> Self {
        Self::new()
    }
}

impl Failover {
    pub fn new() -> Self {
        Self { cooldowns: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub fn mark_cooldown(&self, api_key_env: &str, duration: std::time::Duration) {
        let deadline = std::time::Instant::now() + duration;
        self.cooldowns.lock().insert(api_key_env.to_string(), deadline);
    }

    pub fn is_available(&self, api_key_env: &str) -> bool {
        let mut cooldowns = self.cooldowns.lock();
        match cooldowns.get(api_key_env) {
            None => true,
            Some(deadline) => {
                if std::time::Instant::now() >= *deadline {
                    cooldowns.remove(api_key_env);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Ordered fallback models for `model`, filtered by cooldown and by
    /// whether `has_key` reports a configured API key for the alternative.
    pub fn alternatives(&self, model: &str, has_key: impl Fn(&ModelInfo) -> bool) -> Vec<String> {
        failover_chain(model)
            .iter()
            .filter_map(|alt| registry().get(alt).map(|info| (*alt, info)))
            .filter(|(_, info)| self.is_available(info.api_key_env))
            .filter(|(_, info)| has_key(info))
            .map(|(alt, _)| alt.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_then_expires() {
        let failover = Failover::new();
        failover.mark_cooldown("ANTHROPIC_API_KEY", std::time::Duration::from_millis(0));
        assert!(failover.is_available("ANTHROPIC_API_KEY"));

        failover.mark_cooldown("ANTHROPIC_API_KEY", std::time::Duration::from_secs(60));
        assert!(!failover.is_available("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn resolves_known_model() {
        let info = resolve_model("sonnet").unwrap();
        assert_eq!(info.provider, "claude");
        assert_eq!(info.input_price_per_m, 3.0);
    }

    #[test]
    fn unknown_model_errors() {
        assert!(resolve_model("does-not-exist").is_err());
    }

    #[test]
    fn failover_chain_is_ordered() {
        assert_eq!(failover_chain("sonnet")[0], "haiku");
    }
}
