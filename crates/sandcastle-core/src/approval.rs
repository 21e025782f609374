// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Approval gate state machine: `pending -> {approved, rejected, skipped,
//! timed_out}`. Terminal transitions are irreversible.

use crate::model::{ApprovalRequest, ApprovalStatus};
use crate::value::Value;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Skipped,
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
            ApprovalDecision::Skipped => ApprovalStatus::Skipped,
        }
    }
}

/// Applies an external reviewer decision to `request`, mutating it in
/// place. A no-op on an already-terminal request: it is returned unchanged
/// (Approval terminality — resolution calls past the first are idempotent).
pub fn resolve(
    request: &mut ApprovalRequest,
    decision: ApprovalDecision,
    reviewer_id: Option<String>,
    comment: Option<String>,
    edited_data: Option<Value>,
) {
    if request.is_terminal() {
        return;
    }
    request.status = decision.into();
    request.reviewer_id = reviewer_id;
    request.comment = comment;
    request.edited_data = edited_data;
    request.resolved_at = Some(Utc::now());
}

/// Marks a still-pending request as timed out, applying its `on_timeout`
/// policy. No-op if already terminal.
pub fn apply_timeout(request: &mut ApprovalRequest) {
    if request.is_terminal() {
        return;
    }
    request.status = ApprovalStatus::TimedOut;
    request.resolved_at = Some(Utc::now());
}

/// The step output to carry forward once an approval resolves.
pub fn gate_output(request: &ApprovalRequest) -> Option<Value> {
    match request.status {
        ApprovalStatus::Approved => {
            Some(request.edited_data.clone().unwrap_or_else(|| request.data_snapshot.clone().unwrap_or(Value::Null)))
        }
        ApprovalStatus::Skipped | ApprovalStatus::TimedOut => Some(Value::Null),
        ApprovalStatus::Rejected | ApprovalStatus::Pending => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pending() -> ApprovalRequest {
        ApprovalRequest {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            step_id: "review".to_string(),
            status: ApprovalStatus::Pending,
            message: "please review".to_string(),
            data_snapshot: Some(Value::Scalar("draft".to_string())),
            reviewer_id: None,
            comment: None,
            timeout_at: None,
            on_timeout: crate::model::OnTimeout::Abort,
            allow_edit: false,
            edited_data: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn resolve_transitions_from_pending() {
        let mut req = pending();
        resolve(&mut req, ApprovalDecision::Approved, Some("alice".to_string()), None, None);
        assert_eq!(req.status, ApprovalStatus::Approved);
        assert!(req.resolved_at.is_some());
    }

    #[test]
    fn resolve_on_terminal_is_noop() {
        let mut req = pending();
        resolve(&mut req, ApprovalDecision::Rejected, None, None, None);
        let resolved_at = req.resolved_at;
        resolve(&mut req, ApprovalDecision::Approved, None, None, None);
        assert_eq!(req.status, ApprovalStatus::Rejected);
        assert_eq!(req.resolved_at, resolved_at);
    }

    #[test]
    fn approved_output_prefers_edited_data() {
        let mut req = pending();
        resolve(&mut req, ApprovalDecision::Approved, None, None, Some(Value::Scalar("final".to_string())));
        assert_eq!(gate_output(&req), Some(Value::Scalar("final".to_string())));
    }

    #[test]
    fn rejected_has_no_output() {
        let mut req = pending();
        resolve(&mut req, ApprovalDecision::Rejected, None, None, None);
        assert_eq!(gate_output(&req), None);
    }
}
