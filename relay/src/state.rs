//! Run state — the authoritative container for a run's mutable data.
//!
//! [`RunState`] owns the conversation, step history, per-agent metrics,
//! run-wide usage, the handoff chain, and pending interruptions. The
//! runner holds it for the duration of a run and hands tools a
//! [`RunContext`](crate::context::RunContext) view; on interruption the
//! state travels inside the [`RunResult`](crate::result::RunResult) so
//! the caller can resume.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::Agent;
use crate::approval::{ApprovalManager, ApprovalRequest};
use crate::context::RunContext;
use crate::message::Message;
use crate::model::FinishReason;
use crate::telemetry::{SpanHandle, TraceHandle};
use crate::usage::Usage;

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// One tool invocation recorded on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// The model-assigned tool-call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments the tool was (or would be) invoked with.
    pub arguments: Value,
    /// The tool's result; `None` when it failed or awaits approval.
    pub result: Option<Value>,
    /// Error message when the tool failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the call was held for approval.
    #[serde(default)]
    pub needs_approval: bool,
    /// Whether a held call has been approved.
    #[serde(default)]
    pub approved: bool,
    /// Wall-clock duration of the invocation.
    #[serde(default)]
    pub duration_ms: u64,
}

/// The recorded outcome of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-indexed step number.
    pub step_number: usize,
    /// Agent that drove the turn.
    pub agent_name: String,
    /// Tool calls processed this turn.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Text produced by the model, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// The model's finish reason for the turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Unix timestamp (milliseconds) when the step was recorded.
    pub timestamp_ms: u64,
}

/// Accumulated per-agent execution metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Turns driven by this agent.
    pub turns: usize,
    /// Tokens consumed by this agent.
    pub usage: Usage,
    /// Tool calls processed by this agent.
    pub tool_calls: usize,
    /// Total active duration.
    pub duration_ms: u64,
    /// When the agent first became active.
    pub started_at_ms: u64,
    /// When the agent's tenure ended (run end or transfer away).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
}

impl AgentMetrics {
    fn started_now() -> Self {
        Self {
            turns: 0,
            usage: Usage::zero(),
            tool_calls: 0,
            duration_ms: 0,
            started_at_ms: now_ms(),
            ended_at_ms: None,
        }
    }
}

/// The step executor's decision for the turn just processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextStep {
    /// Continue with the same agent next turn.
    RunAgain,
    /// Switch the current agent.
    Handoff {
        /// Target agent name.
        agent_name: String,
        /// Why control moved.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Focused query for the target.
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },
    /// Terminate with output.
    FinalOutput {
        /// The final output text.
        output: String,
    },
    /// Pause for external approval decisions.
    Interruption {
        /// The pending requests, in tool-call order.
        interruptions: Vec<ApprovalRequest>,
    },
}

/// Authoritative execution state for one run.
pub struct RunState {
    run_id: String,
    current_agent: Arc<Agent>,
    original_input: String,
    messages: Vec<Message>,
    context: Arc<Mutex<Value>>,
    max_turns: usize,
    current_turn: usize,
    step_number: usize,
    steps: Vec<StepResult>,
    agent_metrics: HashMap<String, AgentMetrics>,
    usage: Arc<Mutex<Usage>>,
    handoff_chain: Vec<String>,
    handoff_seen: HashSet<String>,
    approvals: ApprovalManager,
    current_step: Option<NextStep>,
    started_at_ms: u64,
    pub(crate) trace: Option<Arc<dyn TraceHandle>>,
    pub(crate) current_agent_span: Option<Arc<dyn SpanHandle>>,
}

impl RunState {
    /// Construct state for a fresh run.
    ///
    /// Seeds the conversation from the input, opens the handoff chain
    /// with the entry agent, and zeroes every counter.
    #[must_use]
    pub fn new(agent: Arc<Agent>, input: impl Into<String>, context: Value, max_turns: usize) -> Self {
        let input = input.into();
        let name = agent.name().to_owned();
        let mut handoff_seen = HashSet::new();
        handoff_seen.insert(name.clone());
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            current_agent: agent,
            messages: vec![Message::user(input.clone())],
            original_input: input,
            context: Arc::new(Mutex::new(context)),
            max_turns,
            current_turn: 0,
            step_number: 0,
            steps: Vec::new(),
            agent_metrics: HashMap::new(),
            usage: Arc::new(Mutex::new(Usage::zero())),
            handoff_chain: vec![name],
            handoff_seen,
            approvals: ApprovalManager::new(),
            current_step: None,
            started_at_ms: now_ms(),
            trace: None,
            current_agent_span: None,
        }
    }

    /// Unique id of this run, for log and span correlation.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The currently active agent.
    #[must_use]
    pub const fn current_agent(&self) -> &Arc<Agent> {
        &self.current_agent
    }

    /// Replace the active agent (transfer).
    pub(crate) fn set_current_agent(&mut self, agent: Arc<Agent>) {
        self.current_agent = agent;
    }

    /// The caller's original input.
    #[must_use]
    pub fn original_input(&self) -> &str {
        &self.original_input
    }

    /// The conversation carried by the run.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub(crate) fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    /// Replace the conversation (context isolation on transfer).
    pub(crate) fn reset_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Prepend session history ahead of the seeded input.
    pub(crate) fn prepend_history(&mut self, history: Vec<Message>) {
        if history.is_empty() {
            return;
        }
        let mut combined = history;
        combined.append(&mut self.messages);
        self.messages = combined;
    }

    /// The shared user context cell.
    pub(crate) fn context_cell(&self) -> Arc<Mutex<Value>> {
        Arc::clone(&self.context)
    }

    /// A clone of the user context object.
    #[must_use]
    pub fn context(&self) -> Value {
        self.context.lock().map(|v| v.clone()).unwrap_or(Value::Null)
    }

    /// The configured turn limit.
    #[must_use]
    pub const fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// The current turn number.
    #[must_use]
    pub const fn current_turn(&self) -> usize {
        self.current_turn
    }

    /// Advance the turn counter.
    pub fn increment_turn(&mut self) {
        self.current_turn += 1;
    }

    /// Whether the loop must refuse to run another turn.
    #[must_use]
    pub const fn is_max_turns_exceeded(&self) -> bool {
        self.current_turn >= self.max_turns
    }

    /// The number of recorded steps.
    #[must_use]
    pub const fn step_number(&self) -> usize {
        self.step_number
    }

    /// The recorded step history.
    #[must_use]
    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    /// Append a step and advance the step counter.
    pub fn record_step(&mut self, step: StepResult) {
        self.steps.push(step);
        self.step_number += 1;
    }

    /// Mutable access to a recorded tool call, looked up by call id from
    /// the most recent step backwards. Used when an approved call is
    /// executed on resume.
    pub(crate) fn find_record_mut(&mut self, call_id: &str) -> Option<&mut ToolCallRecord> {
        self.steps
            .iter_mut()
            .rev()
            .find_map(|step| step.tool_calls.iter_mut().find(|r| r.id == call_id))
    }

    /// Per-agent metrics, keyed by agent name.
    #[must_use]
    pub const fn agent_metrics(&self) -> &HashMap<String, AgentMetrics> {
        &self.agent_metrics
    }

    /// Accumulate one turn's usage and tool calls for an agent.
    ///
    /// The entry is created on first use.
    pub fn update_agent_metrics(&mut self, name: &str, usage_delta: Usage, tool_calls_delta: usize) {
        let entry = self
            .agent_metrics
            .entry(name.to_owned())
            .or_insert_with(AgentMetrics::started_now);
        entry.turns += 1;
        entry.usage += usage_delta;
        entry.tool_calls += tool_calls_delta;
        entry.duration_ms = now_ms().saturating_sub(entry.started_at_ms);
    }

    /// Accumulate tool calls for an agent without counting a turn.
    /// Used when approved calls execute during resumption.
    pub(crate) fn add_agent_tool_calls(&mut self, name: &str, delta: usize) {
        let entry = self
            .agent_metrics
            .entry(name.to_owned())
            .or_insert_with(AgentMetrics::started_now);
        entry.tool_calls += delta;
    }

    /// Close an agent's metrics window (run end or transfer away).
    pub fn close_agent_metrics(&mut self, name: &str) {
        if let Some(entry) = self.agent_metrics.get_mut(name) {
            let ended = now_ms();
            entry.ended_at_ms = Some(ended);
            entry.duration_ms = ended.saturating_sub(entry.started_at_ms);
        }
    }

    /// The shared run-wide usage cell.
    pub(crate) fn usage_cell(&self) -> Arc<Mutex<Usage>> {
        Arc::clone(&self.usage)
    }

    /// Run-wide usage totals.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }

    /// Accumulate usage into the run-wide totals.
    pub fn add_usage(&self, usage: Usage) {
        if let Ok(mut guard) = self.usage.lock() {
            *guard += usage;
        }
    }

    /// Insertion-ordered, de-duplicated chain of agents visited.
    #[must_use]
    pub fn handoff_chain(&self) -> &[String] {
        &self.handoff_chain
    }

    /// Append an agent to the handoff chain unless already present.
    pub fn track_handoff(&mut self, name: &str) {
        if self.handoff_seen.insert(name.to_owned()) {
            self.handoff_chain.push(name.to_owned());
        }
    }

    /// The pending interruptions, in the order they were raised.
    #[must_use]
    pub fn pending_interruptions(&self) -> &[ApprovalRequest] {
        self.approvals.pending()
    }

    /// Record a pending interruption.
    pub fn add_interruption(&mut self, request: ApprovalRequest) {
        self.approvals.add(request);
    }

    /// Whether the run is paused awaiting decisions.
    #[must_use]
    pub fn has_interruptions(&self) -> bool {
        self.approvals.has_pending()
    }

    /// Drop all pending interruptions without deciding them.
    pub fn clear_interruptions(&mut self) {
        self.approvals.clear();
    }

    /// The approval manager (pending requests and decision history).
    #[must_use]
    pub const fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    pub(crate) fn approvals_mut(&mut self) -> &mut ApprovalManager {
        &mut self.approvals
    }

    /// The last-selected next step.
    #[must_use]
    pub const fn current_step(&self) -> Option<&NextStep> {
        self.current_step.as_ref()
    }

    /// Record the step executor's decision.
    pub fn set_current_step(&mut self, step: NextStep) {
        self.current_step = Some(step);
    }

    /// Wall-clock duration of the run so far.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }

    /// Build a [`RunContext`] view over this state for the given turn.
    #[must_use]
    pub(crate) fn make_context(&self) -> RunContext {
        RunContext::from_shared(self.context_cell(), self.usage_cell())
            .with_agent_name(self.current_agent.name())
            .with_turn(self.current_turn)
            .with_messages(self.messages.clone())
    }

    /// Serializable snapshot of the run state for pause/resume inspection.
    ///
    /// Telemetry handles are omitted; they are process-local.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "current_agent": self.current_agent.name(),
            "original_input": self.original_input,
            "messages": self.messages,
            "context": self.context(),
            "max_turns": self.max_turns,
            "current_turn": self.current_turn,
            "step_number": self.step_number,
            "steps": self.steps,
            "agent_metrics": self.agent_metrics,
            "usage": self.usage(),
            "handoff_chain": self.handoff_chain,
            "pending_interruptions": self.approvals.pending(),
            "approval_history": self.approvals.history(),
            "current_step": self.current_step,
        })
    }
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("run_id", &self.run_id)
            .field("current_agent", &self.current_agent.name())
            .field("current_turn", &self.current_turn)
            .field("step_number", &self.step_number)
            .field("handoff_chain", &self.handoff_chain)
            .field("pending_interruptions", &self.approvals.pending().len())
            .field("traced", &self.trace.is_some())
            .field("open_span", &self.current_agent_span.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RunState {
        let agent = Agent::builder("Entry").build_shared().expect("agent");
        RunState::new(agent, "hello", Value::Null, 50)
    }

    #[test]
    fn construction_seeds_messages_and_chain() {
        let state = state();
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].text(), "hello");
        assert_eq!(state.handoff_chain(), ["Entry"]);
        assert_eq!(state.current_turn(), 0);
        assert_eq!(state.step_number(), 0);
    }

    #[test]
    fn turn_limit_refuses_at_max() {
        let agent = Agent::builder("Entry").build_shared().expect("agent");
        let mut state = RunState::new(agent, "x", Value::Null, 2);
        state.increment_turn();
        assert!(!state.is_max_turns_exceeded());
        state.increment_turn();
        assert!(state.is_max_turns_exceeded());
    }

    #[test]
    fn record_step_keeps_counter_in_sync() {
        let mut state = state();
        state.record_step(StepResult {
            step_number: 1,
            agent_name: "Entry".into(),
            tool_calls: Vec::new(),
            text: Some("5".into()),
            finish_reason: Some(FinishReason::Stop),
            timestamp_ms: now_ms(),
        });
        assert_eq!(state.steps().len(), state.step_number());
    }

    #[test]
    fn handoff_chain_dedups_by_first_appearance() {
        let mut state = state();
        state.track_handoff("Specialist");
        state.track_handoff("Entry");
        state.track_handoff("Specialist");
        state.track_handoff("Reviewer");
        assert_eq!(state.handoff_chain(), ["Entry", "Specialist", "Reviewer"]);
    }

    #[test]
    fn agent_metrics_accumulate_per_turn() {
        let mut state = state();
        state.update_agent_metrics("Entry", Usage::new(10, 5), 2);
        state.update_agent_metrics("Entry", Usage::new(4, 2), 0);
        let metrics = state.agent_metrics().get("Entry").expect("entry");
        assert_eq!(metrics.turns, 2);
        assert_eq!(metrics.tool_calls, 2);
        assert_eq!(metrics.usage, Usage::new(14, 7));
        assert_eq!(
            metrics.usage.total_tokens,
            metrics.usage.input_tokens + metrics.usage.output_tokens
        );
    }

    #[test]
    fn to_json_snapshot_round_trips_messages() {
        let state = state();
        let snapshot = state.to_json();
        assert_eq!(snapshot["current_agent"], "Entry");
        assert_eq!(snapshot["handoff_chain"][0], "Entry");
        let messages: Vec<Message> =
            serde_json::from_value(snapshot["messages"].clone()).expect("messages");
        assert_eq!(messages.len(), 1);
    }
}
