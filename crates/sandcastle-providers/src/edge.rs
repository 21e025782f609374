// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Edge backend: dispatches the runner to a deployed Cloudflare Worker over
//! HTTP, the one backend that is itself a `reqwest` client.

use crate::backend::{parse_ndjson_line, BackendRequest, SandboxBackend};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use sandcastle_core::sandbox::SandboxError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct EdgeBackend {
    client: Client,
    worker_url: String,
}

#[derive(Debug, Serialize)]
struct RunPayload<'a> {
    runner_file: &'a str,
    envs: &'a std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default, rename = "exitCode")]
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    ok: bool,
}

impl EdgeBackend {
    pub fn new(worker_url: String) -> Self {
        let worker_url = worker_url.trim_end_matches('/').to_string();
        Self { client: Client::new(), worker_url }
    }

    fn convert_error(err: reqwest::Error) -> SandboxError {
        if err.is_timeout() {
            SandboxError::Runtime("edge worker request timed out".to_string())
        } else {
            SandboxError::Runtime(format!("edge worker request failed: {err}"))
        }
    }
}

#[async_trait]
impl SandboxBackend for EdgeBackend {
    async fn start(&self, request: BackendRequest) -> Result<BoxStream<'static, sandcastle_core::sandbox::SandboxEvent>, SandboxError> {
        if self.worker_url.is_empty() {
            return Err(SandboxError::Runtime("edge worker URL is not configured".to_string()));
        }

        let payload = RunPayload { runner_file: &request.runner_file, envs: &request.envs };
        let response = self
            .client
            .post(format!("{}/run", self.worker_url))
            .timeout(Duration::from_secs(request.timeout_seconds))
            .json(&payload)
            .send()
            .await
            .map_err(Self::convert_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Runtime(format!("edge worker returned {status}: {body}")));
        }

        let body: RunResponse = response.json().await.map_err(Self::convert_error)?;

        let mut events: Vec<sandcastle_core::sandbox::SandboxEvent> =
            body.stdout.lines().filter_map(parse_ndjson_line).collect();

        if body.exit_code != 0 {
            events.push(sandcastle_core::sandbox::SandboxEvent {
                event: "error".to_string(),
                data: serde_json::json!({"type": "error", "error": format!("edge sandbox failed: {}", body.stderr)}),
            });
        }

        Ok(stream::iter(events).boxed())
    }

    async fn health(&self) -> bool {
        if self.worker_url.is_empty() {
            return false;
        }
        let Ok(response) = self.client.get(format!("{}/health", self.worker_url)).timeout(Duration::from_secs(10)).send().await else {
            return false;
        };
        response.json::<HealthResponse>().await.map(|h| h.ok).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "edge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRequest;
    use std::collections::HashMap;

    #[tokio::test]
    async fn health_reports_true_when_worker_reports_ok() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("GET", "/health").with_status(200).with_body(r#"{"ok": true}"#).create_async().await;

        let backend = EdgeBackend::new(server.url());
        assert!(backend.health().await);
    }

    #[tokio::test]
    async fn health_reports_false_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("GET", "/health").with_status(500).create_async().await;

        let backend = EdgeBackend::new(server.url());
        assert!(!backend.health().await);
    }

    #[tokio::test]
    async fn start_parses_ndjson_stdout_lines() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"stdout": "{\"type\": \"result\", \"result\": \"hi\"}\n", "stderr": "", "exitCode": 0}"#;
        let _m = server.mock("POST", "/run").with_status(200).with_body(body).create_async().await;

        let backend = EdgeBackend::new(server.url());
        let request = BackendRequest { runner_file: "runner.mjs".to_string(), envs: HashMap::new(), use_claude_runner: true, timeout_seconds: 30 };
        let events: Vec<_> = backend.start(request).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "result");
    }
}
