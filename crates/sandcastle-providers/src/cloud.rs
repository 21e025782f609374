// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cloud backend: runs the bundled runner inside an E2B sandbox via the
//! `e2b` CLI (no official E2B Rust SDK exists, so the runtime shells out
//! the same way [`crate::container::ContainerBackend`] shells out to
//! `docker`).

use crate::backend::{parse_ndjson_line, BackendRequest, SandboxBackend};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sandcastle_core::sandbox::SandboxError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub struct CloudBackend {
    api_key: String,
}

impl CloudBackend {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl SandboxBackend for CloudBackend {
    async fn start(&self, request: BackendRequest) -> Result<BoxStream<'static, sandcastle_core::sandbox::SandboxEvent>, SandboxError> {
        if self.api_key.is_empty() {
            return Err(SandboxError::Runtime("E2B_API_KEY is not configured".to_string()));
        }

        let mut cmd = Command::new("e2b");
        cmd.arg("sandbox")
            .arg("run")
            .arg("--runtime")
            .arg("node")
            .arg("--timeout")
            .arg(request.timeout_seconds.to_string())
            .arg(&request.runner_file)
            .env("E2B_API_KEY", &self.api_key)
            .envs(&request.envs)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::Runtime(format!("failed to launch e2b sandbox: {e}")))?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Runtime("e2b sandbox produced no stdout".to_string()))?;
        let reader = BufReader::new(stdout);
        let timeout = std::time::Duration::from_secs(request.timeout_seconds + 30);

        let events = stream::unfold((reader.lines(), child), move |(mut lines, mut child)| async move {
            match tokio::time::timeout(timeout, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    let event = parse_ndjson_line(&line);
                    Some((event, (lines, child)))
                }
                Ok(Ok(None)) => {
                    let _ = child.wait().await;
                    None
                }
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!("cloud backend exceeded its deadline, killing sandbox");
                    let _ = child.start_kill();
                    None
                }
            }
        })
        .filter_map(futures::future::ready)
        .boxed();

        Ok(events)
    }

    async fn health(&self) -> bool {
        if self.api_key.is_empty() {
            return false;
        }
        Command::new("e2b").arg("--version").stdout(Stdio::null()).stderr(Stdio::null()).status().await.map(|s| s.success()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "cloud"
    }
}
