//! Run results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::approval::ApprovalRequest;
use crate::message::Message;
use crate::model::FinishReason;
use crate::state::{AgentMetrics, RunState, StepResult};

/// Aggregate metadata attached to a [`RunResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run-wide total tokens.
    pub total_tokens: u64,
    /// Run-wide prompt/input tokens.
    pub prompt_tokens: u64,
    /// Run-wide completion/output tokens.
    pub completion_tokens: u64,
    /// Why the run ended.
    pub finish_reason: FinishReason,
    /// Total tool calls processed across all steps.
    pub total_tool_calls: usize,
    /// Agents visited, in first-appearance order.
    pub handoff_chain: Vec<String>,
    /// Per-agent metrics, keyed by agent name.
    pub agent_metrics: HashMap<String, AgentMetrics>,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Non-fatal warnings (e.g. output-schema fallback).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// The outcome of one run.
#[derive(Debug)]
pub struct RunResult {
    /// The final output: a parsed value when the agent has an output
    /// schema, a string otherwise, and `Null` when interrupted.
    pub final_output: Value,
    /// The conversation as of run end.
    pub messages: Vec<Message>,
    /// The recorded step history.
    pub steps: Vec<StepResult>,
    /// The run state, attached so interrupted runs can resume and
    /// callers can inspect or snapshot the final state.
    pub state: Option<RunState>,
    /// Aggregate metadata.
    pub metadata: RunMetadata,
}

impl RunResult {
    /// Whether the run paused for approval decisions.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.metadata.finish_reason == FinishReason::Interrupted
    }

    /// The pending approval requests, empty unless interrupted.
    #[must_use]
    pub fn pending_approvals(&self) -> &[ApprovalRequest] {
        self.state
            .as_ref()
            .map_or(&[], |state| state.pending_interruptions())
    }

    /// The final output rendered as text.
    #[must_use]
    pub fn final_output_text(&self) -> String {
        match &self.final_output {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Deserialize the final output into a concrete type.
    pub fn final_output_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.final_output.clone())
    }

    /// Take the run state out of the result, for resumption.
    pub fn take_state(&mut self) -> Option<RunState> {
        self.state.take()
    }
}

/// Whether a result is paused awaiting approval decisions.
#[must_use]
pub fn needs_approval(result: &RunResult) -> bool {
    result.is_interrupted() && !result.pending_approvals().is_empty()
}

/// The pending approval requests on a result.
#[must_use]
pub fn get_pending_approvals(result: &RunResult) -> &[ApprovalRequest] {
    result.pending_approvals()
}
