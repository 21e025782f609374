// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! `SandshoreRuntime`: the concrete `SandboxRuntime` that resolves a
//! request's model against the provider registry, runs it through one
//! pluggable backend under a concurrency semaphore, and fails over to an
//! alternative model on a retriable provider error.

use crate::backend::{BackendRequest, SandboxBackend};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use sandcastle_core::registry::{self, Failover, ModelInfo};
use sandcastle_core::sandbox::{
    self, extract_text, is_retriable_provider_error, CancelSignal, SandboxError, SandboxEvent, SandboxRequest, SandboxResult, SandboxRuntime,
};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const HEALTH_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct SandshoreRuntime {
    backend: Box<dyn SandboxBackend>,
    anthropic_api_key: String,
    failover: Failover,
    semaphore: Semaphore,
    health_cache: Mutex<(bool, Instant)>,
}

impl SandshoreRuntime {
    pub fn new(backend: Box<dyn SandboxBackend>, anthropic_api_key: String, max_concurrent: usize) -> Self {
        Self {
            backend,
            anthropic_api_key,
            failover: Failover::new(),
            semaphore: Semaphore::new(max_concurrent.max(1)),
            health_cache: Mutex::new((false, Instant::now() - HEALTH_CACHE_TTL - Duration::from_secs(1))),
        }
    }

    fn api_key_for(&self, info: &ModelInfo) -> String {
        if info.provider == "claude" {
            self.anthropic_api_key.clone()
        } else {
            registry::api_key_from_env_or(info, String::new)
        }
    }

    fn build_request(&self, request: &SandboxRequest, info: &ModelInfo) -> BackendRequest {
        let mut envs = std::collections::HashMap::new();
        envs.insert("SANDCASTLE_REQUEST".to_string(), serde_json::to_string(request).unwrap_or_default());

        if info.provider == "claude" {
            envs.insert("ANTHROPIC_API_KEY".to_string(), self.api_key_for(info));
        } else {
            envs.insert("MODEL_API_KEY".to_string(), self.api_key_for(info));
            envs.insert("MODEL_ID".to_string(), info.api_model_id.to_string());
            envs.insert("MODEL_INPUT_PRICE".to_string(), info.input_price_per_m.to_string());
            envs.insert("MODEL_OUTPUT_PRICE".to_string(), info.output_price_per_m.to_string());
            if let Some(base_url) = info.api_base_url {
                envs.insert("MODEL_BASE_URL".to_string(), base_url.to_string());
            }
        }

        BackendRequest {
            runner_file: info.runner.to_string(),
            envs,
            use_claude_runner: info.provider == "claude",
            timeout_seconds: request.timeout,
        }
    }

    async fn cached_health(&self) -> bool {
        {
            let cache = self.health_cache.lock();
            if cache.1.elapsed() < HEALTH_CACHE_TTL {
                return cache.0;
            }
        }
        let result = self.backend.health().await;
        *self.health_cache.lock() = (result, Instant::now());
        result
    }

    async fn stream_once(&self, request: &SandboxRequest, info: &ModelInfo, cancel: &CancelSignal) -> Result<Vec<SandboxEvent>, SandboxError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| SandboxError::Runtime("semaphore closed".to_string()))?;
        let backend_request = self.build_request(request, info);
        let mut stream: BoxStream<'static, SandboxEvent> = self.backend.start(backend_request).await?;

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            let is_error = event.event == "error" || event.data.get("type").and_then(|t| t.as_str()) == Some("error");
            if is_error {
                let error_msg = event.data.get("error").and_then(|e| e.as_str()).unwrap_or("unknown runtime error").to_string();
                if is_retriable_provider_error(&error_msg) {
                    return Err(SandboxError::Runtime(error_msg));
                }
            }
            events.push(event);
        }
        Ok(events)
    }

    /// Runs `request` against its resolved model, failing over to
    /// alternatives (in registry order, skipping keys on cooldown or
    /// without a configured credential) on a retriable error.
    async fn stream_with_failover(&self, request: &SandboxRequest, cancel: &CancelSignal) -> Result<Vec<SandboxEvent>, SandboxError> {
        let primary_model = request.model.clone();
        let primary_info = registry::resolve_model(&primary_model).unwrap_or_else(|_| {
            tracing::warn!(model = %primary_model, "unknown model, falling back to sonnet");
            registry::resolve_model("sonnet").expect("sonnet is always registered")
        });

        match self.stream_once(request, &primary_info, cancel).await {
            Ok(events) => return Ok(events),
            Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(SandboxError::Runtime(msg)) => {
                if !is_retriable_provider_error(&msg) {
                    return Err(SandboxError::Runtime(msg));
                }
                self.failover.mark_cooldown(primary_info.api_key_env, Duration::from_secs(300));
                tracing::warn!(model = %primary_model, error = %msg, "model hit a retriable error, trying alternatives");
            }
        }

        let has_key = |info: &ModelInfo| !self.api_key_for(info).is_empty();
        let alternatives = self.failover.alternatives(&primary_model, has_key);
        if alternatives.is_empty() {
            return Err(SandboxError::Runtime(format!("model '{primary_model}' is rate-limited and no alternatives are available")));
        }

        let mut last_error = None;
        for alt_model in alternatives {
            let Ok(alt_info) = registry::resolve_model(&alt_model) else { continue };
            let mut alt_request = request.clone();
            alt_request.model = alt_model.clone();
            tracing::info!(from = %primary_model, to = %alt_model, "failing over to alternative model");
            match self.stream_once(&alt_request, &alt_info, cancel).await {
                Ok(events) => return Ok(events),
                Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
                Err(SandboxError::Runtime(msg)) => {
                    if is_retriable_provider_error(&msg) {
                        self.failover.mark_cooldown(alt_info.api_key_env, Duration::from_secs(300));
                        last_error = Some(msg);
                        continue;
                    }
                    return Err(SandboxError::Runtime(msg));
                }
            }
        }

        Err(SandboxError::Runtime(format!(
            "all failover alternatives exhausted for '{primary_model}': {}",
            last_error.unwrap_or_default()
        )))
    }
}

#[async_trait]
impl SandboxRuntime for SandshoreRuntime {
    async fn query(&self, request: SandboxRequest, cancel: CancelSignal) -> Result<SandboxResult, SandboxError> {
        let events = self.stream_with_failover(&request, &cancel).await?;

        let mut result = SandboxResult::default();
        let mut assistant_texts = Vec::new();
        for event in events {
            let evt_type = event.data.get("type").and_then(|t| t.as_str()).unwrap_or(&event.event);
            match evt_type {
                "result" => {
                    result.text = event.data.get("result").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    if result.text.is_empty() {
                        result.text = event.data.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    }
                    result.structured_output = event.data.get("structured_output").cloned();
                    result.total_cost_usd = event.data.get("total_cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    result.num_turns = event.data.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                }
                "error" => {
                    let msg = event.data.get("error").and_then(|e| e.as_str()).unwrap_or("unknown runtime error").to_string();
                    return Err(SandboxError::Runtime(msg));
                }
                "assistant" | "message" => {
                    let text = extract_text(&event.data);
                    if !text.is_empty() {
                        assistant_texts.push(text);
                    }
                }
                _ => {}
            }
        }

        if result.text.is_empty() {
            if let Some(last) = assistant_texts.last() {
                result.text = last.clone();
            }
        }

        Ok(result)
    }

    async fn query_stream(&self, request: SandboxRequest, cancel: CancelSignal) -> Result<BoxStream<'static, SandboxEvent>, SandboxError> {
        let events = self.stream_with_failover(&request, &cancel).await?;
        Ok(futures::stream::iter(events).boxed())
    }

    async fn health(&self) -> bool {
        self.cached_health().await
    }

    fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, SandboxBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubBackend {
        calls: Arc<AtomicUsize>,
        responses: Vec<Result<Vec<BackendEvent>, String>>,
    }

    #[async_trait]
    impl SandboxBackend for StubBackend {
        async fn start(&self, _request: BackendRequest) -> Result<BoxStream<'static, BackendEvent>, SandboxError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self.responses.get(idx).cloned().unwrap_or_else(|| Ok(Vec::new()));
            let events = response.map_err(SandboxError::Runtime)?;
            Ok(futures::stream::iter(events).boxed())
        }

        async fn health(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    fn success_event() -> BackendEvent {
        sandbox::SandboxEvent { event: "result".to_string(), data: serde_json::json!({"type": "result", "result": "ok", "total_cost_usd": 0.01}) }
    }

    #[tokio::test]
    async fn query_returns_text_from_result_event() {
        let backend = StubBackend { calls: Arc::new(AtomicUsize::new(0)), responses: vec![Ok(vec![success_event()])] };
        let runtime = SandshoreRuntime::new(Box::new(backend), "test-key".to_string(), 5);
        let request = SandboxRequest { prompt: "hi".to_string(), model: "sonnet".to_string(), max_turns: 1, timeout: 30, output_format: None };
        let result = runtime.query(request, CancelSignal::new()).await.unwrap();
        assert_eq!(result.text, "ok");
        assert_eq!(result.total_cost_usd, 0.01);
    }

    #[tokio::test]
    async fn health_is_cached() {
        let backend = StubBackend { calls: Arc::new(AtomicUsize::new(0)), responses: vec![] };
        let runtime = SandshoreRuntime::new(Box::new(backend), "test-key".to_string(), 5);
        assert!(runtime.health().await);
        assert!(runtime.health().await);
    }
}
