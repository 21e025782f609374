// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sandbox runtime contract: the seam between the step executor and the
//! concrete backend (cloud/container/host/edge) that actually runs a
//! sandboxed LLM query.

use async_trait::async_trait;
use futures::stream::BoxStream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared cancellation flag, checked at stage boundaries and between
/// streamed sandbox events.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub prompt: String,
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub output_format: Option<serde_json::Value>,
}

fn default_max_turns() -> u32 {
    10
}
fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxResult {
    pub text: String,
    pub structured_output: Option<serde_json::Value>,
    pub total_cost_usd: f64,
    pub num_turns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("{0}")]
    Runtime(String),
    #[error("cancelled")]
    Cancelled,
}

/// Backends a workflow step can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cloud,
    Container,
    Host,
    Edge,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Runs a query to completion, returning the aggregated result.
    async fn query(&self, request: SandboxRequest, cancel: CancelSignal) -> Result<SandboxResult, SandboxError>;

    /// Runs a query, yielding events as they stream from the backend.
    async fn query_stream(
        &self,
        request: SandboxRequest,
        cancel: CancelSignal,
    ) -> Result<BoxStream<'static, SandboxEvent>, SandboxError>;

    async fn health(&self) -> bool;

    fn backend_name(&self) -> &'static str;
}

/// True if `error_msg` indicates a retriable provider error (rate limit or
/// 5xx), the condition under which the runtime should fail over to an
/// alternative model rather than surface the error.
pub fn is_retriable_provider_error(error_msg: &str) -> bool {
    let msg = error_msg.to_lowercase();
    if msg.contains("429") || msg.contains("rate limit") || msg.contains("too many requests") {
        return true;
    }
    if server_error_code_re().is_match(&msg) {
        return true;
    }
    msg.contains("server error") || msg.contains("overloaded") || msg.contains("capacity")
}

fn server_error_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b50[0-4]\b").unwrap())
}

/// Extracts assistant text from a loosely-structured event payload,
/// mirroring the several shapes a backend's SSE stream can emit a message
/// in.
pub fn extract_text(data: &serde_json::Value) -> String {
    for key in ["text", "content", "result", "data"] {
        if let Some(s) = data.get(key).and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                return s.to_string();
            }
        }
    }

    if let Some(blocks) = data.get("message").and_then(|m| m.get("content")).and_then(|c| c.as_array()) {
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        return text.to_string();
                    }
                }
            }
        }
    }

    if let Some(blocks) = data.get("content_blocks").and_then(|c| c.as_array()) {
        for block in blocks {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }

    if let Some(blocks) = data.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                return block.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string();
            }
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_phrases_are_retriable() {
        assert!(is_retriable_provider_error("HTTP 429 Too Many Requests"));
        assert!(is_retriable_provider_error("rate limit exceeded"));
    }

    #[test]
    fn five_hundreds_are_retriable() {
        assert!(is_retriable_provider_error("upstream returned 503"));
        assert!(!is_retriable_provider_error("upstream returned 404"));
    }

    #[test]
    fn capacity_phrases_are_retriable() {
        assert!(is_retriable_provider_error("model is overloaded right now"));
    }

    #[test]
    fn plain_validation_error_is_not_retriable() {
        assert!(!is_retriable_provider_error("invalid request: missing prompt"));
    }

    #[test]
    fn extract_text_prefers_flat_text_field() {
        let data = serde_json::json!({"text": "hello"});
        assert_eq!(extract_text(&data), "hello");
    }

    #[test]
    fn extract_text_falls_back_to_nested_message_content() {
        let data = serde_json::json!({"message": {"content": [{"type": "text", "text": "nested"}]}});
        assert_eq!(extract_text(&data), "nested");
    }
}
