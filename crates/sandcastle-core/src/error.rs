// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandcastleError>;

/// Errors raised by the workflow execution core.
#[derive(Debug, Error)]
pub enum SandcastleError {
    #[error("workflow validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("step '{0}' not found")]
    StepNotFound(String),

    #[error("cycle detected: {0}")]
    Cycle(String),

    #[error("unknown model '{model}'. available: {available}")]
    UnknownModel { model: String, available: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("policy blocked output: {0}")]
    PolicyBlocked(String),

    #[error("sub-workflow depth {depth} exceeds max_workflow_depth {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("budget exceeded: {spent:.4} / {max:.4}")]
    BudgetExceeded { spent: f64, max: f64 },

    #[error("run was cancelled")]
    Cancelled,

    #[error("approval request '{0}' not found")]
    ApprovalNotFound(String),

    #[error("child workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SandcastleError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
