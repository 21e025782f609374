// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sandbox runtime with provider failover: the pluggable backends
//! (cloud/container/host/edge) that actually run a sandboxed query, and the
//! [`SandshoreRuntime`] that layers retry, model failover, a concurrency
//! semaphore and cached health checks on top of one backend.

pub mod backend;
pub mod cloud;
pub mod container;
pub mod edge;
pub mod host;
pub mod runtime;

pub use backend::{BackendEvent, SandboxBackend};
pub use cloud::CloudBackend;
pub use container::ContainerBackend;
pub use edge::EdgeBackend;
pub use host::HostBackend;
pub use runtime::SandshoreRuntime;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the backend named by `settings.sandbox_backend`, defaulting to
/// the cloud (E2B) backend for anything unrecognized.
pub fn create_backend(settings: &sandcastle_core::config::Settings) -> Box<dyn SandboxBackend> {
    match settings.sandbox_backend.as_str() {
        "container" => {
            Box::new(ContainerBackend::new(settings.container_image.clone(), settings.container_runtime_url.clone()))
        }
        "host" => Box::new(HostBackend::new()),
        "edge" => Box::new(EdgeBackend::new(settings.edge_worker_url.clone())),
        _ => Box::new(CloudBackend::new(settings.e2b_api_key.clone())),
    }
}
