//! Step executor — processes one model response into a next-step decision.
//!
//! For each turn the executor classifies the response, sets transfer
//! calls aside as handoff requests, filters disabled tools, evaluates
//! approval policies, executes the remaining tools concurrently, appends
//! messages in tool-call order, records the step, and selects the
//! [`NextStep`].
//!
//! Decision precedence is fixed: interruption, then handoff, then
//! finish, then continue. Ranking interruption above handoff prevents an
//! agent from bypassing human approval by emitting a transfer in the
//! same turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::approval::{ApprovalRequest, ApprovalRequestMetadata};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::hooks::HookSet;
use crate::message::{Message, ToolCall};
use crate::model::ModelResponse;
use crate::state::{NextStep, RunState, StepResult, ToolCallRecord, now_ms};
use crate::telemetry::{self, SpanEnd, SpanOptions};
use crate::tool::{BoxedTool, Tool as _, render_result};
use crate::transfer::{TransferMarker, is_transfer_tool, transfer_tool_name};

/// Outcome of processing one model response.
#[derive(Debug)]
pub struct SingleStepResult {
    /// The conversation before this step's appends.
    pub pre_step_messages: Vec<Message>,
    /// Messages appended by this step (assistant + tool messages).
    pub new_messages: Vec<Message>,
    /// The conversation after this step.
    pub messages: Vec<Message>,
    /// The selected next step.
    pub next_step: NextStep,
    /// The recorded step.
    pub step_result: StepResult,
    /// Resolved transfer target, when `next_step` is a handoff.
    pub resolved_target: Option<Arc<Agent>>,
}

/// A handoff candidate found while processing the step.
struct HandoffRequest {
    call_index: usize,
    marker: TransferMarker,
}

/// Process one model response for the current agent.
pub(crate) async fn execute_step(
    state: &mut RunState,
    response: &ModelResponse,
    tools: &[BoxedTool],
    hooks: &HookSet<'_>,
    abort: Option<&Arc<AtomicBool>>,
) -> Result<SingleStepResult> {
    let agent = Arc::clone(state.current_agent());
    let ctx = state.make_context();
    let pre_step_messages = state.messages().to_vec();

    // 1. Classify: transfer calls become handoff requests, the rest execute.
    let mut transfer_map: HashMap<String, Arc<Agent>> = HashMap::new();
    let mut target_map: HashMap<String, Arc<Agent>> = HashMap::new();
    for sub in agent.subagents() {
        transfer_map.insert(transfer_tool_name(sub.name()), Arc::clone(sub));
        target_map.insert(sub.name().to_owned(), Arc::clone(sub));
    }

    let mut handoffs: Vec<HandoffRequest> = Vec::new();
    let mut indexed: Vec<(usize, ToolCallRecord)> = Vec::new();
    let mut pending: Vec<ApprovalRequest> = Vec::new();
    let mut executable: Vec<(usize, ToolCall, BoxedTool)> = Vec::new();

    for (index, call) in response.tool_calls.iter().enumerate() {
        if is_transfer_tool(&call.name) {
            indexed.push((
                index,
                process_transfer_call(index, call, &transfer_map, &mut handoffs),
            ));
            continue;
        }

        let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
            warn!(tool = %call.name, "tool not found");
            indexed.push((
                index,
                synthetic_record(call, json!({"error": format!("tool '{}' not found", call.name)})),
            ));
            continue;
        };

        // 2. Enabled filter: disabled tools yield a synthetic result
        //    without invocation.
        if !tool.is_enabled(&ctx) {
            debug!(tool = %call.name, "tool disabled this turn");
            indexed.push((index, synthetic_record(call, json!({"error": "tool disabled"}))));
            continue;
        }

        // 3. Approval check.
        if let Some(policy) = tool.approval_policy() {
            if policy.evaluate(&ctx, &call.arguments, &call.id).await {
                let metadata = tool.approval_metadata();
                pending.push(ApprovalRequest::pending(
                    &call.id,
                    &call.name,
                    call.arguments.clone(),
                    ctx.context(),
                    ApprovalRequestMetadata {
                        severity: metadata.map(|m| m.severity).unwrap_or_default(),
                        required_role: metadata.and_then(|m| m.required_role.clone()),
                        reason: metadata.and_then(|m| m.reason.clone()),
                        timestamp_ms: now_ms(),
                    },
                ));
                indexed.push((
                    index,
                    ToolCallRecord {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        result: None,
                        error: None,
                        needs_approval: true,
                        approved: false,
                        duration_ms: 0,
                    },
                ));
                continue;
            }
        }

        executable.push((index, call.clone(), Arc::clone(tool)));
    }

    // 4. Parallel execution of the remaining calls. Completion order does
    //    not matter: results are gathered, then merged back by call index.
    if !executable.is_empty() {
        if abort.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(Error::Aborted);
        }
        let futures: Vec<_> = executable
            .iter()
            .map(|(_, call, tool)| run_tool(Arc::clone(tool), call.clone(), ctx.clone(), hooks))
            .collect();
        let executed = futures::future::join_all(futures).await;
        for ((index, _, _), record) in executable.iter().zip(executed) {
            // Markers may also arrive from regular tools that delegate.
            if let Some(marker) = record.result.as_ref().and_then(TransferMarker::detect) {
                handoffs.push(HandoffRequest {
                    call_index: *index,
                    marker,
                });
            }
            indexed.push((*index, record));
        }
    }

    indexed.sort_by_key(|(index, _)| *index);
    let records: Vec<ToolCallRecord> = indexed.into_iter().map(|(_, record)| record).collect();

    // 5. Append messages: assistant first, then tool results in call order.
    let mut new_messages: Vec<Message> = Vec::new();
    new_messages.extend(response.messages.iter().cloned());
    for record in &records {
        if record.needs_approval {
            continue;
        }
        let content = record.error.as_ref().map_or_else(
            || {
                record.result.as_ref().map_or_else(String::new, |value| {
                    render_result(value, agent.result_encoder().map(|enc| enc.as_ref()))
                })
            },
            |error| json!({"error": error}).to_string(),
        );
        new_messages.push(Message::tool(&record.id, content));
    }
    state.messages_mut().extend(new_messages.iter().cloned());

    // 6. Record the step and accumulate usage into run and agent totals.
    let step_result = StepResult {
        step_number: state.step_number() + 1,
        agent_name: agent.name().to_owned(),
        tool_calls: records.clone(),
        text: response.text.clone(),
        finish_reason: Some(response.finish_reason),
        timestamp_ms: now_ms(),
    };
    state.record_step(step_result.clone());
    state.add_usage(response.usage);
    state.update_agent_metrics(agent.name(), response.usage, records.len());

    // 7. Select the next step, in prescribed precedence order.
    let next_step = if pending.is_empty() {
        select_continuation(state, &agent, response, &records, &handoffs, &target_map)
    } else {
        for request in &pending {
            state.add_interruption(request.clone());
        }
        NextStep::Interruption {
            interruptions: pending,
        }
    };

    let resolved_target = match &next_step {
        NextStep::Handoff { agent_name, .. } => target_map.get(agent_name).cloned(),
        _ => None,
    };

    state.set_current_step(next_step.clone());

    Ok(SingleStepResult {
        pre_step_messages,
        new_messages,
        messages: state.messages().to_vec(),
        next_step,
        step_result,
        resolved_target,
    })
}

/// Select handoff / finish / continue once no approval is pending.
fn select_continuation(
    state: &RunState,
    agent: &Arc<Agent>,
    response: &ModelResponse,
    records: &[ToolCallRecord],
    handoffs: &[HandoffRequest],
    target_map: &HashMap<String, Arc<Agent>>,
) -> NextStep {
    // Handoff: earliest resolvable request by tool-call index wins.
    let mut candidates: Vec<&HandoffRequest> = handoffs.iter().collect();
    candidates.sort_by_key(|request| request.call_index);
    for request in candidates {
        if target_map.contains_key(&request.marker.agent_name) {
            return NextStep::Handoff {
                agent_name: request.marker.agent_name.clone(),
                reason: Some(request.marker.reason.clone()),
                query: request.marker.query.clone(),
            };
        }
        warn!(
            target = %request.marker.agent_name,
            "transfer target not found; ignoring"
        );
    }

    let text = response.text.clone().unwrap_or_default();

    if let Some(should_finish) = agent.should_finish() {
        if !text.is_empty() && should_finish(&state.make_context(), records) {
            return NextStep::FinalOutput { output: text };
        }
    }

    let any_executable = response
        .tool_calls
        .iter()
        .any(|call| !is_transfer_tool(&call.name));
    if !any_executable && !text.is_empty() && response.finish_reason.finalizes() {
        return NextStep::FinalOutput { output: text };
    }

    NextStep::RunAgain
}

/// A record for a call that was answered without invoking anything.
fn synthetic_record(call: &ToolCall, result: Value) -> ToolCallRecord {
    ToolCallRecord {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
        result: Some(result),
        error: None,
        needs_approval: false,
        approved: false,
        duration_ms: 0,
    }
}

/// Handle a `transfer_to_*` call: resolve the target from the synthesized
/// tool map and record the marker without executing anything.
fn process_transfer_call(
    index: usize,
    call: &ToolCall,
    transfer_map: &HashMap<String, Arc<Agent>>,
    handoffs: &mut Vec<HandoffRequest>,
) -> ToolCallRecord {
    let reason = call.arguments["reason"].as_str().unwrap_or("").to_owned();
    let query = call.arguments["query"].as_str().map(str::to_owned);

    if let Some(target) = transfer_map.get(&call.name) {
        let marker = TransferMarker {
            transfer: true,
            agent_name: target.name().to_owned(),
            reason,
            query,
        };
        let result = serde_json::to_value(&marker).unwrap_or(Value::Null);
        handoffs.push(HandoffRequest {
            call_index: index,
            marker,
        });
        ToolCallRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: Some(result),
            error: None,
            needs_approval: false,
            approved: false,
            duration_ms: 0,
        }
    } else {
        warn!(tool = %call.name, "transfer target not found; ignoring");
        ToolCallRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: Some(json!({"error": format!("transfer target for '{}' not found", call.name)})),
            error: None,
            needs_approval: false,
            approved: false,
            duration_ms: 0,
        }
    }
}

/// Execute a single tool inside a contextual span, catching failures.
async fn run_tool(
    tool: BoxedTool,
    call: ToolCall,
    ctx: RunContext,
    hooks: &HookSet<'_>,
) -> ToolCallRecord {
    let span = telemetry::contextual_span(
        &SpanOptions::named(format!("tool:{}", call.name)).with_input(call.arguments.clone()),
    );
    let span_handle = Arc::clone(&span);

    telemetry::scoped_under(span_handle, async move {
        hooks.tool_start(&ctx, &call.name).await;
        let started = Instant::now();

        let outcome = tool.call(call.arguments.clone(), ctx.clone()).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(result) => {
                span.end(SpanEnd::output(result.clone()));
                hooks
                    .tool_end(&ctx, &call.name, &render_result(&result, None))
                    .await;
                ToolCallRecord {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                    result: Some(result),
                    error: None,
                    needs_approval: false,
                    approved: false,
                    duration_ms,
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(tool = %call.name, error = %message, "tool execution failed");
                span.end(SpanEnd::error(message.clone()));
                hooks.tool_end(&ctx, &call.name, &message).await;
                ToolCallRecord {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                    result: None,
                    error: Some(message),
                    needs_approval: false,
                    approved: false,
                    duration_ms,
                }
            }
        }
    })
    .await
}
