// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host backend: runs the bundled runner as a direct subprocess on the
//! local machine, no isolation. Development and testing only.

use crate::backend::{parse_ndjson_line, BackendRequest, SandboxBackend};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sandcastle_core::sandbox::SandboxError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub struct HostBackend;

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for HostBackend {
    async fn start(&self, request: BackendRequest) -> Result<BoxStream<'static, sandcastle_core::sandbox::SandboxEvent>, SandboxError> {
        let mut child = Command::new("node")
            .arg(&request.runner_file)
            .envs(&request.envs)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("failed to spawn host runner: {e}")))?;

        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Runtime("host runner has no stdout".to_string()))?;
        let reader = BufReader::new(stdout);
        let timeout = std::time::Duration::from_secs(request.timeout_seconds);

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
                    tracing::warn!("host backend timed out reading stdout");
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
        Command::new("node").arg("--version").stdout(Stdio::null()).stderr(Stdio::null()).status().await.map(|s| s.success()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "host"
    }
}
