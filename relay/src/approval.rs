//! Approval subsystem — policy-driven human-in-the-loop interruptions.
//!
//! A tool may carry an [`ApprovalPolicy`]. When the policy evaluates to
//! `true` for a call, the step executor skips execution and records an
//! [`ApprovalRequest`] instead; the run returns with
//! `finish_reason = interrupted` and resumes once decisions arrive.
//!
//! Policies compose: [`any`] and [`all`] combine the building blocks
//! ([`always`], [`never`], [`require_admin_role`], [`require_for_args`],
//! [`require_for_state`], [`require_after_count`]) and short-circuit.
//! A policy that errors counts as "approval required" — fail closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::RunContext;
use crate::error::Result;
use crate::tool::Severity;

type PolicyFn =
    dyn Fn(RunContext, Value, String) -> BoxFuture<'static, Result<bool>> + Send + Sync;

/// Decides whether a specific tool call needs human approval.
///
/// The policy receives the run context, the call's arguments, and the
/// model-assigned call id. It may suspend (e.g. to consult an external
/// policy service).
#[derive(Clone)]
pub struct ApprovalPolicy {
    inner: Arc<PolicyFn>,
}

impl ApprovalPolicy {
    /// Build a policy from a synchronous predicate.
    #[must_use]
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&RunContext, &Value, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(move |ctx, args, call_id| {
                let decision = predicate(&ctx, &args, &call_id);
                Box::pin(async move { Ok(decision) })
            }),
        }
    }

    /// Build a policy from an async, fallible function.
    #[must_use]
    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(RunContext, Value, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<bool>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |ctx, args, call_id| Box::pin(f(ctx, args, call_id))),
        }
    }

    /// Evaluate the policy for a tool call.
    ///
    /// Errors inside the policy are logged and count as "approval
    /// required".
    pub async fn evaluate(&self, ctx: &RunContext, args: &Value, call_id: &str) -> bool {
        match (self.inner)(ctx.clone(), args.clone(), call_id.to_owned()).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "approval policy failed; requiring approval");
                true
            }
        }
    }

    /// Raw evaluation preserving the error, used by combinators.
    async fn try_evaluate(&self, ctx: &RunContext, args: &Value, call_id: &str) -> Result<bool> {
        (self.inner)(ctx.clone(), args.clone(), call_id.to_owned()).await
    }
}

impl fmt::Debug for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApprovalPolicy(..)")
    }
}

/// Approval is always required.
#[must_use]
pub fn always() -> ApprovalPolicy {
    ApprovalPolicy::new(|_, _, _| true)
}

/// Approval is never required.
#[must_use]
pub fn never() -> ApprovalPolicy {
    ApprovalPolicy::new(|_, _, _| false)
}

/// Require approval unless the context's user holds `role`.
///
/// Reads `context.user.roles` (an array of strings) from the dependency
/// object; a missing or malformed field means the role is absent.
#[must_use]
pub fn require_admin_role(role: impl Into<String>) -> ApprovalPolicy {
    let role = role.into();
    ApprovalPolicy::new(move |ctx, _, _| {
        let has_role = ctx
            .context_pointer("/user/roles")
            .and_then(|roles| {
                roles.as_array().map(|list| {
                    list.iter()
                        .any(|r| r.as_str().is_some_and(|s| s == role))
                })
            })
            .unwrap_or(false);
        !has_role
    })
}

/// Require approval when the predicate matches the call's arguments.
#[must_use]
pub fn require_for_args<F>(predicate: F) -> ApprovalPolicy
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    ApprovalPolicy::new(move |_, args, _| predicate(args))
}

/// Require approval when the predicate matches the dependency object.
#[must_use]
pub fn require_for_state<F>(predicate: F) -> ApprovalPolicy
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    ApprovalPolicy::new(move |ctx, _, _| predicate(&ctx.context()))
}

/// Require approval once a numeric context counter reaches `threshold`.
#[must_use]
pub fn require_after_count(key: impl Into<String>, threshold: u64) -> ApprovalPolicy {
    let key = key.into();
    ApprovalPolicy::new(move |ctx, _, _| {
        ctx.context_get(&key)
            .and_then(|v| v.as_u64())
            .is_some_and(|count| count >= threshold)
    })
}

/// Logical OR over policies, short-circuiting on the first `true`.
///
/// A failing member counts as `true` (fail closed).
#[must_use]
pub fn any(policies: Vec<ApprovalPolicy>) -> ApprovalPolicy {
    ApprovalPolicy::new_async(move |ctx, args, call_id| {
        let policies = policies.clone();
        async move {
            for policy in &policies {
                match policy.try_evaluate(&ctx, &args, &call_id).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "approval policy failed; requiring approval");
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
    })
}

/// Logical AND over policies, short-circuiting on the first `false`.
///
/// A failing member counts as `true` (fail closed) and evaluation
/// continues with the remaining policies.
#[must_use]
pub fn all(policies: Vec<ApprovalPolicy>) -> ApprovalPolicy {
    ApprovalPolicy::new_async(move |ctx, args, call_id| {
        let policies = policies.clone();
        async move {
            for policy in &policies {
                match policy.try_evaluate(&ctx, &args, &call_id).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(false),
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "approval policy failed; requiring approval");
                    }
                }
            }
            Ok(true)
        }
    })
}

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting an external decision.
    Pending,
    /// Approved; the tool was (or will be) executed.
    Approved,
    /// Rejected; a synthetic rejection result was recorded.
    Rejected,
}

/// Metadata attached to a single approval request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRequestMetadata {
    /// Severity inherited from the tool's approval metadata.
    pub severity: Severity,
    /// Role required to decide this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    /// Why the call requires approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unix timestamp (milliseconds) when the request was raised.
    pub timestamp_ms: u64,
}

/// A paused tool call awaiting an external decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request id; equals the model's tool-call id for correlation.
    pub id: String,
    /// Name of the tool whose call is paused.
    pub tool_name: String,
    /// The call's arguments as proposed by the model.
    pub arguments: Value,
    /// The model's tool-call id.
    pub call_id: String,
    /// Snapshot of the dependency object when the request was raised.
    pub context_snapshot: Value,
    /// Request metadata.
    pub metadata: ApprovalRequestMetadata,
    /// Current decision state.
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    /// Create a pending request for a tool call.
    #[must_use]
    pub fn pending(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        context_snapshot: Value,
        metadata: ApprovalRequestMetadata,
    ) -> Self {
        let call_id = call_id.into();
        Self {
            id: call_id.clone(),
            tool_name: tool_name.into(),
            arguments,
            call_id,
            context_snapshot,
            metadata,
            status: ApprovalStatus::Pending,
        }
    }
}

/// An external decision on one pending approval request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Whether the call may execute.
    pub approve: bool,
    /// Optional rationale, recorded on rejection results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Replacement arguments to execute with, when approved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
}

impl ApprovalDecision {
    /// An approval without modifications.
    #[must_use]
    pub fn approve() -> Self {
        Self {
            approve: true,
            ..Self::default()
        }
    }

    /// An approval with replacement arguments.
    #[must_use]
    pub fn approve_with_args(args: Value) -> Self {
        Self {
            approve: true,
            reason: None,
            modified_args: Some(args),
        }
    }

    /// A rejection with a rationale.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approve: false,
            reason: Some(reason.into()),
            modified_args: None,
        }
    }
}

/// Tracks pending approval requests and the append-only decision log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalManager {
    pending: Vec<ApprovalRequest>,
    history: Vec<ApprovalRequest>,
}

impl ApprovalManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending request.
    pub fn add(&mut self, request: ApprovalRequest) {
        self.pending.push(request);
    }

    /// The pending requests, in the order they were raised.
    #[must_use]
    pub fn pending(&self) -> &[ApprovalRequest] {
        &self.pending
    }

    /// Whether any request is awaiting a decision.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The append-only log of decided requests.
    #[must_use]
    pub fn history(&self) -> &[ApprovalRequest] {
        &self.history
    }

    /// Look up a pending request by call id.
    #[must_use]
    pub fn get(&self, call_id: &str) -> Option<&ApprovalRequest> {
        self.pending.iter().find(|r| r.call_id == call_id)
    }

    /// Apply decisions positionally to the pending requests.
    ///
    /// Returns the decided requests (status updated) paired with their
    /// decisions, appends them to the history, and clears the pending
    /// list. Callers must supply exactly one decision per pending
    /// request.
    pub fn decide(
        &mut self,
        decisions: &[ApprovalDecision],
    ) -> Result<Vec<(ApprovalRequest, ApprovalDecision)>> {
        if decisions.len() != self.pending.len() {
            return Err(crate::error::Error::config(format!(
                "expected {} approval decisions, got {}",
                self.pending.len(),
                decisions.len()
            )));
        }

        let pending = std::mem::take(&mut self.pending);
        let mut decided = Vec::with_capacity(pending.len());
        for (mut request, decision) in pending.into_iter().zip(decisions.iter().cloned()) {
            request.status = if decision.approve {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            self.history.push(request.clone());
            decided.push((request, decision));
        }
        Ok(decided)
    }

    /// Drop all pending requests without deciding them.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Pending request count by tool, for observability.
    #[must_use]
    pub fn pending_by_tool(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for request in &self.pending {
            *counts.entry(request.tool_name.clone()).or_insert(0) += 1;
        }
        counts
    }
}
