// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Application configuration loaded from environment variables.

/// Runtime configuration for the workflow execution core.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sandshore_url: String,
    pub anthropic_api_key: String,
    pub e2b_api_key: String,

    pub storage_backend: String,
    pub storage_bucket: String,
    pub storage_endpoint: String,
    pub local_storage_dir: String,

    pub webhook_secret: String,

    pub workflows_dir: String,

    pub max_workflow_depth: u32,
    pub failover_cooldown_seconds: u64,
    pub sandbox_max_concurrent: usize,
    pub stage_concurrency: usize,

    /// Which `SandboxBackend` to run queries through: `cloud`, `container`,
    /// `host`, or `edge`.
    pub sandbox_backend: String,
    pub container_image: String,
    pub container_runtime_url: Option<String>,
    pub edge_worker_url: String,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sandshore_url: "http://localhost:8000".to_string(),
            anthropic_api_key: String::new(),
            e2b_api_key: String::new(),
            storage_backend: "local".to_string(),
            storage_bucket: "sandcastle-data".to_string(),
            storage_endpoint: "http://localhost:9000".to_string(),
            local_storage_dir: "./data/storage".to_string(),
            webhook_secret: "your-webhook-signing-secret".to_string(),
            workflows_dir: "./workflows".to_string(),
            max_workflow_depth: 5,
            failover_cooldown_seconds: 300,
            sandbox_max_concurrent: 5,
            stage_concurrency: 10,
            sandbox_backend: "cloud".to_string(),
            container_image: "sandcastle-runner:latest".to_string(),
            container_runtime_url: None,
            edge_worker_url: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sandshore_url: env_or("SANDSHORE_URL", &defaults.sandshore_url),
            anthropic_api_key: env_or("ANTHROPIC_API_KEY", &defaults.anthropic_api_key),
            e2b_api_key: env_or("E2B_API_KEY", &defaults.e2b_api_key),
            storage_backend: env_or("STORAGE_BACKEND", &defaults.storage_backend),
            storage_bucket: env_or("STORAGE_BUCKET", &defaults.storage_bucket),
            storage_endpoint: env_or("STORAGE_ENDPOINT", &defaults.storage_endpoint),
            local_storage_dir: env_or("LOCAL_STORAGE_DIR", &defaults.local_storage_dir),
            webhook_secret: env_or("WEBHOOK_SECRET", &defaults.webhook_secret),
            workflows_dir: env_or("WORKFLOWS_DIR", &defaults.workflows_dir),
            max_workflow_depth: env_parsed("MAX_WORKFLOW_DEPTH", defaults.max_workflow_depth),
            failover_cooldown_seconds: env_parsed(
                "FAILOVER_COOLDOWN_SECONDS",
                defaults.failover_cooldown_seconds,
            ),
            sandbox_max_concurrent: env_parsed(
                "SANDBOX_MAX_CONCURRENT",
                defaults.sandbox_max_concurrent,
            ),
            stage_concurrency: env_parsed("STAGE_CONCURRENCY", defaults.stage_concurrency),
            sandbox_backend: env_or("SANDBOX_BACKEND", &defaults.sandbox_backend),
            container_image: env_or("CONTAINER_IMAGE", &defaults.container_image),
            container_runtime_url: std::env::var("CONTAINER_RUNTIME_URL").ok(),
            edge_worker_url: env_or("EDGE_WORKER_URL", &defaults.edge_worker_url),
            log_level: env_or("LOG_LEVEL", &defaults.log_level),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
