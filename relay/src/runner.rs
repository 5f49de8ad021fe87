//! Runner — the agent execution engine.
//!
//! The [`Runner`] drives an [`Agent`] through its turn loop:
//!
//! 1. Resolve instructions and the turn's tools (own tools plus
//!    synthesized transfer tools, filtered by enablement)
//! 2. Call the model
//! 3. Hand the response to the step executor
//! 4. Apply the [`NextStep`]: continue, transfer, interrupt, or finalize
//!
//! The loop terminates on a final output, a pending interruption, a
//! guardrail trip, the turn limit, or an abort. Agent spans open and
//! close as control moves between agents, a generation span wraps every
//! model call, and cleanup runs on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::error::{Error, Result};
use crate::guardrail::{self, Guardrail};
use crate::hooks::{HookSet, NoopHooks, RunHooks};
use crate::message::Message;
use crate::context::RunContext;
use crate::model::{
    FinishReason, ModelProvider as _, ModelRequest, ModelResponse, StreamChunk, resolve_model,
};
use crate::result::{RunMetadata, RunResult};
use crate::session::BoxedSession;
use crate::state::{NextStep, RunState, StepResult, ToolCallRecord};
use crate::step::execute_step;
use crate::telemetry::{self, GenerationOptions, SpanEnd, SpanHandle, SpanOptions};
use crate::tool::{BoxedTool, Tool as _, render_result};
use crate::transfer::{self, TransferMarker};
use crate::usage::Usage;

/// Default turn limit when neither the run config nor the agent sets one.
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Run-level configuration.
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Turn limit override; falls back to the agent's `max_steps`, then
    /// to [`DEFAULT_MAX_TURNS`].
    pub max_turns: Option<usize>,
    /// User dependency object handed to tools and policies.
    pub context: Value,
    /// Run-level lifecycle observer.
    pub hooks: Option<Arc<dyn RunHooks>>,
    /// Conversation persistence; loaded before the first turn and
    /// written back only on successful finalization.
    pub session: Option<BoxedSession>,
    /// Cooperative abort signal, checked between turns and before tool
    /// fan-outs.
    pub abort: Option<Arc<AtomicBool>>,
}

impl RunConfig {
    /// Create a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the turn limit.
    #[must_use]
    pub const fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Set the user dependency object.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Set the run-level observer.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Attach a session.
    #[must_use]
    pub fn with_session(mut self, session: BoxedSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach an abort signal.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("max_turns", &self.max_turns)
            .field("has_session", &self.session.is_some())
            .field("has_abort", &self.abort.is_some())
            .finish_non_exhaustive()
    }
}

/// Events yielded by [`Runner::run_streamed`].
#[derive(Debug)]
pub enum RunEvent {
    /// The run started.
    RunStarted {
        /// Entry agent name.
        agent_name: String,
    },
    /// A turn started.
    TurnStarted {
        /// 1-indexed turn number.
        turn: usize,
    },
    /// Incremental model text.
    TextDelta(String),
    /// The model requested a tool call.
    ToolCallStarted {
        /// The tool-call id.
        id: String,
        /// The tool name.
        name: String,
    },
    /// A tool call finished.
    ToolCallCompleted {
        /// The completed record.
        record: ToolCallRecord,
    },
    /// Control transferred between agents.
    Transfer {
        /// Source agent.
        from: String,
        /// Target agent.
        to: String,
    },
    /// A turn was recorded.
    TurnCompleted {
        /// The recorded step.
        step: Box<StepResult>,
    },
    /// Terminal event carrying the final result (also emitted for
    /// interrupted runs).
    RunCompleted {
        /// The run result.
        result: Box<RunResult>,
    },
}

/// How one applied turn left the loop.
enum TurnOutcome {
    /// Keep looping.
    Continue,
    /// Control moved to another agent; keep looping.
    Transferred {
        from: String,
        to: String,
    },
    /// The run paused for approval decisions.
    Interrupted,
    /// The run finalized.
    Finished {
        output: Value,
        warnings: Vec<String>,
    },
}

/// Tracks the open agent span so every exit path can close it.
struct SpanTracker {
    open: Option<(String, Arc<dyn SpanHandle>)>,
}

impl SpanTracker {
    const fn new() -> Self {
        Self { open: None }
    }

    /// Open a span for `agent_name` unless one is already open for it;
    /// closes the previous agent's span first.
    fn ensure(&mut self, state: &mut RunState, agent_name: &str) {
        if self
            .open
            .as_ref()
            .is_some_and(|(name, _)| name == agent_name)
        {
            return;
        }
        self.close(state, SpanEnd::default());
        let span = telemetry::contextual_span(&SpanOptions::named(format!("agent:{agent_name}")));
        telemetry::push_span(Arc::clone(&span));
        state.current_agent_span = Some(Arc::clone(&span));
        self.open = Some((agent_name.to_owned(), span));
    }

    /// Close the open span, recording the agent's accumulated metrics.
    fn close(&mut self, state: &mut RunState, mut end: SpanEnd) {
        if let Some((name, span)) = self.open.take() {
            telemetry::pop_span();
            state.close_agent_metrics(&name);
            if end.output.is_none() {
                if let Some(metrics) = state.agent_metrics().get(&name) {
                    end.output = serde_json::to_value(metrics).ok();
                }
            }
            span.end(end);
            state.current_agent_span = None;
        }
    }
}

/// Stateless execution engine.
///
/// `Runner` owns no state — everything mutable lives in [`RunState`], so
/// the same agent can drive concurrent runs.
#[derive(Debug, Clone, Copy)]
pub struct Runner;

impl Runner {
    /// Execute an agent run to completion (or interruption).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no model is resolvable,
    /// [`Error::GuardrailTripwire`] when a gate rejects,
    /// [`Error::MaxTurnsExceeded`] when the turn limit is hit, and
    /// [`Error::Aborted`] on cancellation. A run paused for approval is
    /// **not** an error: it returns `Ok` with
    /// `finish_reason = interrupted` and the state attached.
    pub async fn run(
        agent: Arc<Agent>,
        input: impl Into<String>,
        config: RunConfig,
    ) -> Result<RunResult> {
        let state = Self::init(agent, input.into(), &config).await?;
        Self::run_loop(state, &config).await
    }

    /// Validate configuration, seed state, load history, run the input gate.
    async fn init(agent: Arc<Agent>, input: String, config: &RunConfig) -> Result<RunState> {
        resolve_model(agent.model(), agent.name())?;

        let max_turns = config
            .max_turns
            .or(agent.max_steps())
            .unwrap_or(DEFAULT_MAX_TURNS);
        let mut state = RunState::new(Arc::clone(&agent), input, config.context.clone(), max_turns);
        state.trace = telemetry::current_trace();

        info!(run_id = %state.run_id(), agent = %agent.name(), max_turns, "agent run started");

        if let Some(ref session) = config.session {
            let history = session.get_history().await?;
            state.prepend_history(history);
        }

        // Input gate runs before the first model call; a trip means no
        // model call is ever issued and no session write happens.
        let noop = NoopHooks;
        let run_hooks: &dyn RunHooks = config.hooks.as_deref().unwrap_or(&noop);
        let hooks = HookSet::new(run_hooks, agent.hooks().map(|h| h.as_ref()));
        let (input_guards, _) = guardrail::partition(agent.guardrails());
        let ctx = state.make_context();
        if let Err(e) = guardrail::run_input_gate(&input_guards, state.messages(), &ctx).await {
            error!(agent = %agent.name(), error = %e, "input guardrail tripped");
            hooks.error(&ctx, &e).await;
            return Err(e);
        }
        hooks.agent_start(&ctx, agent.name()).await;
        Ok(state)
    }

    /// Resume an interrupted run with approval decisions.
    ///
    /// Decisions apply positionally to the pending interruptions:
    /// approved calls execute exactly once (with their possibly modified
    /// arguments), rejected calls record a synthetic
    /// `{"rejected": true, "reason"}` tool result. The loop then
    /// continues until the run finalizes or pauses again.
    pub async fn resume_after_approval(
        mut state: RunState,
        decisions: &[ApprovalDecision],
        config: RunConfig,
    ) -> Result<RunResult> {
        let decided = state.approvals_mut().decide(decisions)?;
        let agent = Arc::clone(state.current_agent());
        let noop = NoopHooks;
        let run_hooks: &dyn RunHooks = config.hooks.as_deref().unwrap_or(&noop);
        let hooks = HookSet::new(run_hooks, agent.hooks().map(|h| h.as_ref()));
        let ctx = state.make_context();

        let mut appended: Vec<Message> = Vec::new();
        let mut executed = 0usize;
        for (request, decision) in decided {
            if decision.approve {
                let content =
                    Self::execute_approved(&mut state, &agent, &request, decision, &hooks, &ctx)
                        .await;
                executed += 1;
                appended.push(Message::tool(&request.call_id, content));
            } else {
                let reason = decision.reason.unwrap_or_else(|| "rejected".to_owned());
                appended.push(Message::tool(
                    &request.call_id,
                    json!({"rejected": true, "reason": reason}).to_string(),
                ));
            }
        }
        state.messages_mut().extend(appended);
        if executed > 0 {
            state.add_agent_tool_calls(agent.name(), executed);
        }

        info!(agent = %agent.name(), decided = decisions.len(), "resuming after approval");
        Self::run_loop(state, &config).await
    }

    /// Execute one approved call, updating its step record.
    async fn execute_approved(
        state: &mut RunState,
        agent: &Arc<Agent>,
        request: &ApprovalRequest,
        decision: ApprovalDecision,
        hooks: &HookSet<'_>,
        ctx: &RunContext,
    ) -> String {
        let args = decision
            .modified_args
            .unwrap_or_else(|| request.arguments.clone());

        let Some(tool) = agent.find_tool(&request.tool_name) else {
            warn!(tool = %request.tool_name, "approved tool no longer present");
            return json!({"error": format!("tool '{}' not found", request.tool_name)}).to_string();
        };

        hooks.tool_start(ctx, &request.tool_name).await;
        let started = std::time::Instant::now();
        let outcome = tool.call(args, ctx.clone()).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(result) => {
                let rendered =
                    render_result(&result, agent.result_encoder().map(|enc| enc.as_ref()));
                hooks.tool_end(ctx, &request.tool_name, &rendered).await;
                if let Some(record) = state.find_record_mut(&request.call_id) {
                    record.approved = true;
                    record.result = Some(result);
                    record.duration_ms = duration_ms;
                }
                rendered
            }
            Err(e) => {
                let message = e.to_string();
                warn!(tool = %request.tool_name, error = %message, "approved tool failed");
                hooks.tool_end(ctx, &request.tool_name, &message).await;
                if let Some(record) = state.find_record_mut(&request.call_id) {
                    record.approved = true;
                    record.error = Some(message.clone());
                    record.duration_ms = duration_ms;
                }
                json!({"error": message}).to_string()
            }
        }
    }

    /// Run an agent, resolving interruptions through a callback until
    /// the run completes.
    pub async fn run_with_approval_callback<F, Fut>(
        agent: Arc<Agent>,
        input: impl Into<String>,
        callback: F,
        config: RunConfig,
    ) -> Result<RunResult>
    where
        F: Fn(Vec<ApprovalRequest>) -> Fut,
        Fut: std::future::Future<Output = Vec<ApprovalDecision>>,
    {
        let mut result = Self::run(agent, input, config.clone()).await?;
        while crate::result::needs_approval(&result) {
            let pending = result.pending_approvals().to_vec();
            let decisions = callback(pending).await;
            let Some(state) = result.take_state() else {
                return Err(Error::config("interrupted result carries no state"));
            };
            result = Self::resume_after_approval(state, &decisions, config.clone()).await?;
        }
        Ok(result)
    }

    /// The shared turn loop for fresh and resumed runs.
    async fn run_loop(mut state: RunState, config: &RunConfig) -> Result<RunResult> {
        let noop = NoopHooks;
        let run_hooks: &dyn RunHooks = config.hooks.as_deref().unwrap_or(&noop);
        let mut spans = SpanTracker::new();

        loop {
            let agent = Arc::clone(state.current_agent());
            let hooks = HookSet::new(run_hooks, agent.hooks().map(|h| h.as_ref()));

            match Self::turn(&mut state, &agent, &hooks, config, &mut spans).await {
                Ok(TurnOutcome::Continue | TurnOutcome::Transferred { .. }) => {}
                Ok(TurnOutcome::Interrupted) => {
                    return Ok(Self::build_result(
                        state,
                        Value::Null,
                        FinishReason::Interrupted,
                        Vec::new(),
                    ));
                }
                Ok(TurnOutcome::Finished { output, warnings }) => {
                    return Ok(Self::build_result(
                        state,
                        output,
                        FinishReason::Stop,
                        warnings,
                    ));
                }
                Err(e) => {
                    spans.close(&mut state, SpanEnd::error(e.to_string()));
                    hooks.error(&state.make_context(), &e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Drive one turn: limits, spans, model call, step execution,
    /// next-step application.
    async fn turn(
        state: &mut RunState,
        agent: &Arc<Agent>,
        hooks: &HookSet<'_>,
        config: &RunConfig,
        spans: &mut SpanTracker,
    ) -> Result<TurnOutcome> {
        // Cancellation is checked between turns.
        if config
            .abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Err(Error::Aborted);
        }

        state.increment_turn();
        if state.is_max_turns_exceeded() {
            error!(agent = %agent.name(), max_turns = state.max_turns(), "max turns exceeded");
            return Err(Error::max_turns(agent.name(), state.max_turns()));
        }

        spans.ensure(state, agent.name());
        debug!(agent = %agent.name(), turn = state.current_turn(), "starting turn");

        let turn_tools = Self::resolve_turn_tools(state, agent);
        let request = Self::build_request(state, agent, &turn_tools);
        let response = Self::model_turn(state, agent, &request, hooks).await?;

        let step = execute_step(state, &response, &turn_tools, hooks, config.abort.as_ref()).await?;

        Self::apply_next_step(state, agent, step.next_step, step.resolved_target, hooks, config, spans)
            .await
    }

    /// Issue the model call, wrapped in a generation span.
    async fn model_turn(
        state: &mut RunState,
        agent: &Arc<Agent>,
        request: &ModelRequest,
        hooks: &HookSet<'_>,
    ) -> Result<ModelResponse> {
        let model = resolve_model(agent.model(), agent.name())?;
        let ctx = state.make_context();

        let generation = telemetry::contextual_generation(&GenerationOptions {
            name: "generation".to_owned(),
            model: Some(model.model_id().to_owned()),
            input: serde_json::to_value(&request.messages).ok(),
            metadata: None,
        });

        hooks.model_start(&ctx, agent.name(), &request.messages).await;
        match model.generate(request).await {
            Ok(response) => {
                generation.end(response.text.clone().map(Value::String), response.usage);
                hooks.model_end(&ctx, agent.name(), &response).await;
                Ok(response)
            }
            Err(e) => {
                error!(agent = %agent.name(), error = %e, "model call failed");
                generation.end(None, Usage::zero());
                Err(e)
            }
        }
    }

    /// Build the model request for the current turn.
    fn build_request(state: &RunState, agent: &Arc<Agent>, turn_tools: &[BoxedTool]) -> ModelRequest {
        let ctx = state.make_context();
        ModelRequest {
            system: agent.instructions().resolve(&ctx),
            messages: state.messages().to_vec(),
            tools: turn_tools.iter().map(|t| t.definition()).collect(),
            settings: *agent.model_settings(),
        }
    }

    /// Resolve the turn's tools: the agent's own tools plus synthesized
    /// transfer tools, filtered by the enablement predicate.
    ///
    /// Re-resolved every turn because enablement can depend on context
    /// that changes mid-run.
    fn resolve_turn_tools(state: &RunState, agent: &Arc<Agent>) -> Vec<BoxedTool> {
        let ctx = state.make_context();
        let mut tools: Vec<BoxedTool> = agent
            .tools()
            .iter()
            .filter(|tool| tool.is_enabled(&ctx))
            .cloned()
            .collect();
        for sub in agent.subagents() {
            tools.push(Arc::new(transfer::transfer_tool(sub)));
        }
        tools
    }

    /// Apply the step executor's decision.
    async fn apply_next_step(
        state: &mut RunState,
        agent: &Arc<Agent>,
        next_step: NextStep,
        resolved_target: Option<Arc<Agent>>,
        hooks: &HookSet<'_>,
        config: &RunConfig,
        spans: &mut SpanTracker,
    ) -> Result<TurnOutcome> {
        match next_step {
            NextStep::RunAgain => Ok(TurnOutcome::Continue),

            NextStep::Interruption { interruptions } => {
                info!(
                    agent = %agent.name(),
                    pending = interruptions.len(),
                    "run interrupted for approval"
                );
                spans.close(state, SpanEnd::output(json!({"interrupted": true})));
                Ok(TurnOutcome::Interrupted)
            }

            NextStep::Handoff {
                agent_name,
                reason,
                query,
            } => {
                let Some(target) = resolved_target else {
                    // The step executor only selects resolvable targets;
                    // reaching this means the subagent set changed mid-turn.
                    warn!(target = %agent_name, "handoff target vanished; continuing");
                    return Ok(TurnOutcome::Continue);
                };
                info!(from = %agent.name(), to = %target.name(), "transferring control");
                hooks
                    .transfer(&state.make_context(), agent.name(), target.name())
                    .await;

                spans.close(state, SpanEnd::default());
                state.track_handoff(target.name());

                let marker = TransferMarker {
                    transfer: true,
                    agent_name: agent_name.clone(),
                    reason: reason.unwrap_or_default(),
                    query,
                };
                let window = transfer::isolation_messages(
                    agent.name(),
                    target.name(),
                    &marker,
                    state.messages(),
                    state.original_input(),
                );
                let from = agent.name().to_owned();
                let to = target.name().to_owned();
                state.set_current_agent(target);
                state.reset_messages(window);
                hooks.agent_start(&state.make_context(), &to).await;
                Ok(TurnOutcome::Transferred { from, to })
            }

            NextStep::FinalOutput { output } => {
                let (value, warnings) =
                    Self::finalize(state, agent, &output, hooks, config, spans).await?;
                Ok(TurnOutcome::Finished {
                    output: value,
                    warnings,
                })
            }
        }
    }

    /// Output gate, schema parse, session write-back, span close.
    async fn finalize(
        state: &mut RunState,
        agent: &Arc<Agent>,
        output: &str,
        hooks: &HookSet<'_>,
        config: &RunConfig,
        spans: &mut SpanTracker,
    ) -> Result<(Value, Vec<String>)> {
        let ctx = state.make_context();
        let (_, output_guards): (Vec<&Guardrail>, Vec<&Guardrail>) =
            guardrail::partition(agent.guardrails());
        if let Err(e) = guardrail::run_output_gate(&output_guards, output, &ctx).await {
            error!(agent = %agent.name(), error = %e, "output guardrail tripped");
            return Err(e);
        }

        let mut warnings = Vec::new();
        let final_output = match agent.output_schema() {
            Some(schema) => {
                let (value, warning) = schema.parse(output);
                if let Some(warning) = warning {
                    warn!(agent = %agent.name(), %warning, "output schema fallback");
                    warnings.push(warning);
                }
                value
            }
            None => Value::String(output.to_owned()),
        };

        // Session write-back happens only on successful finalization.
        if let Some(ref session) = config.session {
            let to_save = vec![
                Message::user(state.original_input().to_owned()),
                Message::assistant(output.to_owned()),
            ];
            if let Err(e) = session.add_messages(&to_save).await {
                warn!(error = %e, "session write-back failed");
                warnings.push(format!("session write-back failed: {e}"));
            }
        }

        hooks.agent_end(&ctx, agent.name(), &final_output).await;
        spans.close(state, SpanEnd::output(final_output.clone()));

        info!(
            agent = %agent.name(),
            turns = state.current_turn(),
            total_tokens = state.usage().total_tokens,
            "agent run completed"
        );

        Ok((final_output, warnings))
    }

    /// Assemble the run result, attaching the state.
    fn build_result(
        state: RunState,
        final_output: Value,
        finish_reason: FinishReason,
        warnings: Vec<String>,
    ) -> RunResult {
        let usage = state.usage();
        let total_tool_calls = state.steps().iter().map(|step| step.tool_calls.len()).sum();
        let metadata = RunMetadata {
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            finish_reason,
            total_tool_calls,
            handoff_chain: state.handoff_chain().to_vec(),
            agent_metrics: state.agent_metrics().clone(),
            duration_ms: state.duration_ms(),
            warnings,
        };
        RunResult {
            final_output,
            messages: state.messages().to_vec(),
            steps: state.steps().to_vec(),
            metadata,
            state: Some(state),
        }
    }

    /// Execute a run, yielding [`RunEvent`]s as it progresses.
    ///
    /// The model is driven through its streaming interface so text
    /// arrives as deltas; every other turn phase matches
    /// [`Runner::run`]. The terminal event is always `RunCompleted`
    /// (including interrupted runs); fatal errors end the stream with
    /// `Err`.
    pub fn run_streamed(
        agent: Arc<Agent>,
        input: impl Into<String>,
        config: RunConfig,
    ) -> impl Stream<Item = Result<RunEvent>> + Send {
        let input = input.into();
        async_stream::try_stream! {
            let mut state = Self::init(Arc::clone(&agent), input, &config).await?;
            let noop = NoopHooks;
            let run_hooks: &dyn RunHooks = config.hooks.as_deref().unwrap_or(&noop);
            let mut spans = SpanTracker::new();

            yield RunEvent::RunStarted { agent_name: agent.name().to_owned() };

            loop {
                let agent = Arc::clone(state.current_agent());
                let hooks = HookSet::new(run_hooks, agent.hooks().map(|h| h.as_ref()));

                if config
                    .abort
                    .as_ref()
                    .is_some_and(|flag| flag.load(Ordering::SeqCst))
                {
                    spans.close(&mut state, SpanEnd::error("aborted"));
                    Err(Error::Aborted)?;
                }

                state.increment_turn();
                if state.is_max_turns_exceeded() {
                    spans.close(&mut state, SpanEnd::error("max turns exceeded"));
                    Err(Error::max_turns(agent.name(), state.max_turns()))?;
                }
                spans.ensure(&mut state, agent.name());

                yield RunEvent::TurnStarted { turn: state.current_turn() };

                // Stream the model call, forwarding displayable chunks.
                let model = resolve_model(agent.model(), agent.name())?;
                let ctx = state.make_context();
                let turn_tools = Self::resolve_turn_tools(&state, &agent);
                let request = Self::build_request(&state, &agent, &turn_tools);
                hooks.model_start(&ctx, agent.name(), &request.messages).await;

                let mut chunks = model.stream(&request).await?;
                let mut response: Option<ModelResponse> = None;
                {
                    use futures::StreamExt as _;
                    while let Some(chunk) = chunks.next().await {
                        match chunk? {
                            StreamChunk::TextDelta(delta) => {
                                yield RunEvent::TextDelta(delta);
                            }
                            StreamChunk::ToolCall(call) => {
                                yield RunEvent::ToolCallStarted {
                                    id: call.id,
                                    name: call.name,
                                };
                            }
                            StreamChunk::Finish(full) => {
                                response = Some(*full);
                            }
                        }
                    }
                }
                let response = match response {
                    Some(response) => response,
                    None => {
                        spans.close(&mut state, SpanEnd::error("stream ended without finish"));
                        Err(Error::model("stream ended without a terminal chunk"))?;
                        return;
                    }
                };
                hooks.model_end(&ctx, agent.name(), &response).await;

                let step = execute_step(
                    &mut state,
                    &response,
                    &turn_tools,
                    &hooks,
                    config.abort.as_ref(),
                )
                .await?;

                for record in &step.step_result.tool_calls {
                    yield RunEvent::ToolCallCompleted { record: record.clone() };
                }
                yield RunEvent::TurnCompleted {
                    step: Box::new(step.step_result.clone()),
                };

                let outcome = Self::apply_next_step(
                    &mut state,
                    &agent,
                    step.next_step,
                    step.resolved_target,
                    &hooks,
                    &config,
                    &mut spans,
                )
                .await;
                match outcome {
                    Ok(TurnOutcome::Continue) => {}
                    Ok(TurnOutcome::Transferred { from, to }) => {
                        yield RunEvent::Transfer { from, to };
                    }
                    Ok(TurnOutcome::Interrupted) => {
                        let result = Self::build_result(
                            state,
                            Value::Null,
                            FinishReason::Interrupted,
                            Vec::new(),
                        );
                        yield RunEvent::RunCompleted { result: Box::new(result) };
                        return;
                    }
                    Ok(TurnOutcome::Finished { output, warnings }) => {
                        let result =
                            Self::build_result(state, output, FinishReason::Stop, warnings);
                        yield RunEvent::RunCompleted { result: Box::new(result) };
                        return;
                    }
                    Err(e) => {
                        spans.close(&mut state, SpanEnd::error(e.to_string()));
                        hooks.error(&state.make_context(), &e).await;
                        Err(e)?;
                    }
                }
            }
        }
    }
}

/// Run an agent to completion. See [`Runner::run`].
pub async fn run(
    agent: Arc<Agent>,
    input: impl Into<String>,
    config: RunConfig,
) -> Result<RunResult> {
    Runner::run(agent, input, config).await
}

/// Run an agent with streaming events. See [`Runner::run_streamed`].
pub fn run_streamed(
    agent: Arc<Agent>,
    input: impl Into<String>,
    config: RunConfig,
) -> impl Stream<Item = Result<RunEvent>> + Send {
    Runner::run_streamed(agent, input, config)
}

/// Resume an interrupted run. See [`Runner::resume_after_approval`].
pub async fn resume_after_approval(
    state: RunState,
    decisions: &[ApprovalDecision],
    config: RunConfig,
) -> Result<RunResult> {
    Runner::resume_after_approval(state, decisions, config).await
}

/// Run an agent, resolving interruptions through a callback. See
/// [`Runner::run_with_approval_callback`].
pub async fn run_with_approval_callback<F, Fut>(
    agent: Arc<Agent>,
    input: impl Into<String>,
    callback: F,
    config: RunConfig,
) -> Result<RunResult>
where
    F: Fn(Vec<ApprovalRequest>) -> Fut,
    Fut: std::future::Future<Output = Vec<ApprovalDecision>>,
{
    Runner::run_with_approval_callback(agent, input, callback, config).await
}
