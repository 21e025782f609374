// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Container backend: runs the bundled runner in a one-shot Docker
//! container via the `docker` CLI, with the same resource limits
//! `DockerBackend` applies.

use crate::backend::{parse_ndjson_line, BackendRequest, SandboxBackend};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sandcastle_core::sandbox::SandboxError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub struct ContainerBackend {
    image: String,
    docker_host: Option<String>,
}

impl ContainerBackend {
    pub fn new(image: String, docker_host: Option<String>) -> Self {
        Self { image, docker_host }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.docker_host {
            cmd.arg("-H").arg(host);
        }
        cmd
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    async fn start(&self, request: BackendRequest) -> Result<BoxStream<'static, sandcastle_core::sandbox::SandboxEvent>, SandboxError> {
        let mut cmd = self.base_command();
        cmd.arg("run")
            .arg("--rm")
            .arg("--network")
            .arg("bridge")
            .arg("--memory")
            .arg("512m")
            .arg("--user")
            .arg("1000:1000");
        for (key, value) in &request.envs {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(&self.image).arg("node").arg(format!("/home/user/{}", request.runner_file));
        cmd.stdout(Stdio::piped()).stderr(Stdio::null()).kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::Runtime(format!("failed to launch container: {e}")))?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Runtime("container produced no stdout".to_string()))?;
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
                    tracing::warn!("container backend timed out, killing container");
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
        self.base_command().arg("version").stdout(Stdio::null()).stderr(Stdio::null()).status().await.map(|s| s.success()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "container"
    }
}
