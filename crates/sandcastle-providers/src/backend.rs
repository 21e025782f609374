// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `SandboxBackend` contract every pluggable execution environment
//! implements. A backend only knows how to launch a runner script with a
//! set of environment variables and stream back its stdout events; model
//! resolution, retry and failover live one layer up in [`crate::runtime`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use sandcastle_core::sandbox::SandboxError;
use std::collections::HashMap;

/// A single event parsed from a runner's stdout stream.
pub type BackendEvent = sandcastle_core::sandbox::SandboxEvent;

/// Everything a backend needs to launch the runner, already resolved by
/// [`crate::runtime::SandshoreRuntime`] from the request's model.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub runner_file: String,
    pub envs: HashMap<String, String>,
    pub use_claude_runner: bool,
    pub timeout_seconds: u64,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Executes `request` and streams back its parsed runner events.
    async fn start(&self, request: BackendRequest) -> Result<BoxStream<'static, BackendEvent>, SandboxError>;

    /// True when this backend is available and ready to accept work.
    async fn health(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Parses newline-delimited JSON events the way every backend's runner
/// emits them on stdout, skipping blank lines and logging malformed ones
/// rather than failing the whole stream.
pub(crate) fn parse_ndjson_line(line: &str) -> Option<BackendEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(data) => {
            let event = data.get("type").and_then(|t| t.as_str()).unwrap_or("message").to_string();
            Some(BackendEvent { event, data })
        }
        Err(e) => {
            tracing::debug!(error = %e, line = %line.chars().take(200).collect::<String>(), "non-JSON runner output");
            None
        }
    }
}
