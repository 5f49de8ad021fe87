//! Transfer subsystem — delegating control to a named peer agent.
//!
//! When an agent has subagents, the runner synthesizes one
//! `transfer_to_<slug>` tool per subagent each turn. Executing such a
//! tool returns a sentinel marker; the step executor detects the first
//! marker in tool-call order and the runner switches agents.
//!
//! A transfer hands a focused sub-task to a specialist, not a
//! conversation: the target starts from a fresh two-message window (a
//! synthesized system line plus the isolated query). A transferring
//! agent that needs to carry context forward passes a summary in the
//! transfer tool's `query` argument.

use std::collections::HashMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Agent;
use crate::message::{Message, last_user_text};
use crate::tool::{FunctionTool, parse_args, schema_for};

/// Name prefix reserved for synthesized transfer tools.
pub const TRANSFER_PREFIX: &str = "transfer_to_";

/// Lowercase a name and collapse whitespace runs into underscores.
#[must_use]
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_gap = false;
    for ch in name.trim().chars() {
        if ch.is_whitespace() {
            in_gap = true;
        } else {
            if in_gap {
                out.push('_');
                in_gap = false;
            }
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// The wire name of the transfer tool targeting `agent_name`.
#[must_use]
pub fn transfer_tool_name(agent_name: &str) -> String {
    format!("{TRANSFER_PREFIX}{}", slug(agent_name))
}

/// Whether a tool call targets the transfer subsystem.
#[must_use]
pub fn is_transfer_tool(tool_name: &str) -> bool {
    tool_name.starts_with(TRANSFER_PREFIX)
}

/// Arguments accepted by every synthesized transfer tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransferArgs {
    /// Why control is being transferred.
    pub reason: String,
    /// Focused query for the target; defaults to the original user query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Sentinel emitted by transfer tools and detected in step results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMarker {
    /// Discriminator field; always `true` in emitted markers.
    #[serde(rename = "__transfer")]
    pub transfer: bool,
    /// Name of the target agent.
    pub agent_name: String,
    /// Why control is being transferred.
    pub reason: String,
    /// Focused query for the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl TransferMarker {
    /// Detect a transfer marker in a tool result value.
    #[must_use]
    pub fn detect(value: &Value) -> Option<Self> {
        if value.get("__transfer").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Synthesize the transfer tool for one subagent.
#[must_use]
pub fn transfer_tool(subagent: &Arc<Agent>) -> FunctionTool {
    let target = subagent.name().to_owned();
    let tool_name = transfer_tool_name(&target);
    let description = subagent.transfer_description().map_or_else(
        || format!("Transfer the conversation to the '{target}' agent."),
        str::to_owned,
    );

    FunctionTool::new(
        tool_name.clone(),
        description,
        schema_for::<TransferArgs>(),
        move |args: Value, _ctx| {
            let target = target.clone();
            let tool_name = tool_name.clone();
            async move {
                let args: TransferArgs = parse_args(&tool_name, &args)?;
                let marker = TransferMarker {
                    transfer: true,
                    agent_name: target,
                    reason: args.reason,
                    query: args.query,
                };
                serde_json::to_value(&marker)
                    .map_err(|e| crate::error::ToolError::execution(&tool_name, e.to_string()))
            }
        },
    )
}

/// Per-turn map from subagent name to template, for O(1) target lookup.
#[must_use]
pub fn target_map(agent: &Agent) -> HashMap<String, Arc<Agent>> {
    agent
        .subagents()
        .iter()
        .map(|sub| (sub.name().to_owned(), Arc::clone(sub)))
        .collect()
}

/// Build the isolated message window the target starts from.
///
/// Exactly two messages: a synthesized system line and one user message
/// whose content is the transfer `query` when provided, else the last
/// user message of the prior conversation, else the original input.
#[must_use]
pub fn isolation_messages(
    source: &str,
    target: &str,
    marker: &TransferMarker,
    prior_messages: &[Message],
    original_input: &str,
) -> Vec<Message> {
    let query = marker.query.clone().unwrap_or_else(|| {
        last_user_text(prior_messages).unwrap_or_else(|| original_input.to_owned())
    });
    vec![
        Message::system(format!(
            "[Transfer from {source}] You are now {target}. Reason: {reason}",
            reason = marker.reason
        )),
        Message::user(query),
    ]
}
