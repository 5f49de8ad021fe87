//! End-to-end tests for the relay runtime.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::{Value, json};

use relay::prelude::*;
use relay::telemetry::{
    self, GenerationHandle, GenerationOptions, SpanEnd, SpanHandle, SpanOptions, TraceBackend,
    TraceHandle, TraceOptions,
};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

fn add_tool() -> FunctionTool {
    FunctionTool::new(
        "add",
        "Add two numbers.",
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        }),
        |args, _ctx| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!(a + b))
        },
    )
}

fn sleepy_tool(name: &'static str, millis: u64) -> FunctionTool {
    FunctionTool::new(
        name,
        "Waits, then returns its own name.",
        json!({"type": "object", "properties": {}}),
        move |_args, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!(name))
        },
    )
}

fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall::new(id, name, args)
}

/// A provider that counts its calls, for "no model call was issued" checks.
struct CountingModel {
    inner: MockModel,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ModelProvider for CountingModel {
    fn model_id(&self) -> &str {
        "counting-mock"
    }

    async fn generate(&self, request: &ModelRequest) -> relay::Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(request).await
    }
}

/// Captures the message window of every model call.
#[derive(Default)]
struct WindowCapture {
    windows: Mutex<Vec<Vec<Message>>>,
}

#[async_trait]
impl RunHooks for WindowCapture {
    async fn on_model_start(&self, _ctx: &RunContext, _agent: &str, messages: &[Message]) {
        self.windows.lock().unwrap().push(messages.to_vec());
    }
}

// ---------------------------------------------------------------------------
// S1 — single agent, single tool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_agent_single_tool() {
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call("call_1", "add", json!({"a": 2, "b": 3}))])
            .with_usage(Usage::new(10, 5)),
        ModelResponse::text("5").with_usage(Usage::new(8, 2)),
    ]));
    let agent = Agent::builder("Calc")
        .instructions("You are a calculator.")
        .model(model)
        .tool(add_tool())
        .build_shared()
        .unwrap();

    let result = Runner::run(agent, "What is 2+3?", RunConfig::new())
        .await
        .unwrap();

    assert_eq!(result.final_output_text(), "5");
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.metadata.handoff_chain, ["Calc"]);
    assert_eq!(result.metadata.total_tool_calls, 1);
    assert_eq!(result.metadata.total_tokens, 25);
    assert_eq!(
        result.metadata.total_tokens,
        result.metadata.prompt_tokens + result.metadata.completion_tokens
    );

    // The tool result landed in the message log before the final text.
    let tool_messages: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 1);
    assert_eq!(tool_messages[0].text(), "5.0");
}

// ---------------------------------------------------------------------------
// S2 — parallel tool execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_tools_run_concurrently_and_append_in_call_order() {
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![
            call("call_1", "t1", json!({})),
            call("call_2", "t2", json!({})),
            call("call_3", "t3", json!({})),
        ]),
        ModelResponse::text("done"),
    ]));
    let agent = Agent::builder("Fanout")
        .model(model)
        // t1 finishes last, t2 first; message order must not care.
        .tool(sleepy_tool("t1", 1000))
        .tool(sleepy_tool("t2", 300))
        .tool(sleepy_tool("t3", 600))
        .build_shared()
        .unwrap();

    let started = Instant::now();
    let result = Runner::run(agent, "run all three", RunConfig::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(1000), "tools must really run");
    assert!(
        elapsed < Duration::from_millis(1500),
        "tools must run concurrently, elapsed {elapsed:?}"
    );

    let tool_messages: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    let ids: Vec<_> = tool_messages
        .iter()
        .map(|m| m.tool_call_id.as_deref().unwrap())
        .collect();
    assert_eq!(ids, ["call_1", "call_2", "call_3"]);
    let contents: Vec<_> = tool_messages.iter().map(|m| m.text()).collect();
    assert_eq!(contents, ["t1", "t2", "t3"]);
}

// ---------------------------------------------------------------------------
// S3 — transfer with context isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transfer_isolates_context() {
    let specialist = Agent::builder("Specialist")
        .instructions("You are a research specialist.")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text(
            "Quantum research summary",
        )])))
        .build_shared()
        .unwrap();

    let capture = Arc::new(WindowCapture::default());
    let coordinator = Agent::builder("Coordinator")
        .instructions("Route tasks to specialists.")
        .model(Arc::new(MockModel::new(vec![ModelResponse::tool_calls(
            vec![call(
                "call_1",
                "transfer_to_specialist",
                json!({"reason": "domain-specific", "query": "Research quantum computing"}),
            )],
        )])))
        .subagent(Arc::clone(&specialist))
        .build_shared()
        .unwrap();

    let config = RunConfig::new().with_hooks(Arc::clone(&capture) as Arc<dyn RunHooks>);
    let result = Runner::run(coordinator, "Research quantum computing", config)
        .await
        .unwrap();

    assert_eq!(result.final_output_text(), "Quantum research summary");
    assert_eq!(result.metadata.handoff_chain, ["Coordinator", "Specialist"]);

    // The specialist's first turn sees exactly the isolated window: one
    // synthesized system line, one user message, nothing of the
    // coordinator's tool traffic.
    let windows = capture.windows.lock().unwrap();
    assert_eq!(windows.len(), 2);
    let specialist_window = &windows[1];
    assert_eq!(specialist_window.len(), 2);
    assert_eq!(specialist_window[0].role, Role::System);
    assert_eq!(
        specialist_window[0].text(),
        "[Transfer from Coordinator] You are now Specialist. Reason: domain-specific"
    );
    assert_eq!(specialist_window[1].role, Role::User);
    assert_eq!(specialist_window[1].text(), "Research quantum computing");
}

#[tokio::test]
async fn unknown_transfer_target_is_ignored() {
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call(
            "call_1",
            "transfer_to_ghost",
            json!({"reason": "hallucinated"}),
        )]),
        ModelResponse::text("carried on"),
    ]));
    let agent = Agent::builder("Solo").model(model).build_shared().unwrap();

    let result = Runner::run(agent, "hello", RunConfig::new()).await.unwrap();
    assert_eq!(result.final_output_text(), "carried on");
    assert_eq!(result.metadata.handoff_chain, ["Solo"]);
}

// ---------------------------------------------------------------------------
// S4 — dynamic approval: interrupt, resume, confirm
// ---------------------------------------------------------------------------

fn delete_tool(invocations: Arc<AtomicUsize>) -> FunctionTool {
    FunctionTool::new(
        "deleteFile",
        "Delete a file at a path.",
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        }),
        move |args, _ctx| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"deleted": args["path"]}))
            }
        },
    )
    .with_approval(ApprovalPolicy::new(|ctx, args, _| {
        let is_admin = ctx
            .context_get("isAdmin")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let sensitive = args["path"]
            .as_str()
            .is_some_and(|p| p.contains("important"));
        !is_admin && sensitive
    }))
    .with_approval_metadata(ApprovalMetadata {
        severity: Severity::High,
        category: Some("filesystem".into()),
        required_role: None,
        reason: Some("deletes data".into()),
    })
}

#[tokio::test]
async fn approval_interrupts_and_resumes() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call(
            "call_1",
            "deleteFile",
            json!({"path": "important.txt"}),
        )]),
        ModelResponse::text("Deleted important.txt"),
    ]));
    let agent = Agent::builder("Janitor")
        .model(model)
        .tool(delete_tool(Arc::clone(&invocations)))
        .build_shared()
        .unwrap();

    let config = RunConfig::new().with_context(json!({"isAdmin": false}));
    let mut result = Runner::run(agent, "Delete important.txt", config.clone())
        .await
        .unwrap();

    assert!(result.is_interrupted());
    assert!(needs_approval(&result));
    let pending = get_pending_approvals(&result);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tool_name, "deleteFile");
    assert_eq!(pending[0].arguments["path"], "important.txt");
    assert_eq!(pending[0].status, ApprovalStatus::Pending);
    // The tool was not executed while pending.
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    let state = result.take_state().unwrap();
    let resumed = resume_after_approval(state, &[ApprovalDecision::approve()], config)
        .await
        .unwrap();

    assert_eq!(resumed.final_output_text(), "Deleted important.txt");
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "no duplicate execution");
    let state = resumed.state.as_ref().unwrap();
    assert!(state.pending_interruptions().is_empty());
    let history = state.approvals().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn rejection_leaves_synthetic_result() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call(
            "call_1",
            "deleteFile",
            json!({"path": "important.txt"}),
        )]),
        ModelResponse::text("Understood, leaving it alone."),
    ]));
    let agent = Agent::builder("Janitor")
        .model(model)
        .tool(delete_tool(Arc::clone(&invocations)))
        .build_shared()
        .unwrap();

    let config = RunConfig::new().with_context(json!({"isAdmin": false}));
    let mut result = Runner::run(agent, "Delete important.txt", config.clone())
        .await
        .unwrap();
    let state = result.take_state().unwrap();

    let resumed = resume_after_approval(
        state,
        &[ApprovalDecision::reject("too risky")],
        config,
    )
    .await
    .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    let rejected = resumed
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("call_1"))
        .expect("synthetic rejection message");
    let body: Value = serde_json::from_str(&rejected.text()).unwrap();
    assert_eq!(body["rejected"], json!(true));
    assert_eq!(body["reason"], json!("too risky"));
    let history = resumed.state.as_ref().unwrap().approvals().history();
    assert_eq!(history[0].status, ApprovalStatus::Rejected);
}

#[tokio::test]
async fn approval_callback_drives_run_to_completion() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call(
            "call_1",
            "deleteFile",
            json!({"path": "important.txt"}),
        )]),
        ModelResponse::text("All clean."),
    ]));
    let agent = Agent::builder("Janitor")
        .model(model)
        .tool(delete_tool(Arc::clone(&invocations)))
        .build_shared()
        .unwrap();

    let result = run_with_approval_callback(
        agent,
        "Delete important.txt",
        |pending| async move { pending.iter().map(|_| ApprovalDecision::approve()).collect() },
        RunConfig::new().with_context(json!({"isAdmin": false})),
    )
    .await
    .unwrap();

    assert_eq!(result.final_output_text(), "All clean.");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// S5 — guardrail rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn input_guardrail_trips_before_any_model_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(CountingModel {
        inner: MockModel::new(vec![ModelResponse::text("should never run")]),
        calls: Arc::clone(&calls),
    });
    let session = Arc::new(InMemorySession::new());
    let agent = Agent::builder("Polite")
        .model(model)
        .guardrail(Guardrail::input_fn("blockProfanity", |content| {
            content.contains("badword").then(|| "profanity".to_owned())
        }))
        .build_shared()
        .unwrap();

    let config = RunConfig::new().with_session(Arc::clone(&session) as Arc<dyn Session>);
    let err = Runner::run(agent, "please include badword", config)
        .await
        .expect_err("gate must trip");

    match err {
        Error::GuardrailTripwire {
            guardrail_name,
            phase,
            ..
        } => {
            assert_eq!(guardrail_name, "blockProfanity");
            assert_eq!(phase, GuardrailKind::Input);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no model call was issued");
    assert!(
        session.get_history().await.unwrap().is_empty(),
        "no session append occurred"
    );
}

#[tokio::test]
async fn output_guardrail_vetoes_final_output() {
    let model = Arc::new(MockModel::new(vec![ModelResponse::text("ssn: 123-45-6789")]));
    let agent = Agent::builder("Leaky")
        .model(model)
        .guardrail(Guardrail::output_fn("noPii", |content| {
            content.contains("ssn:").then(|| "PII in output".to_owned())
        }))
        .build_shared()
        .unwrap();

    let err = Runner::run(agent, "tell me", RunConfig::new())
        .await
        .expect_err("output gate must trip");
    assert!(matches!(
        err,
        Error::GuardrailTripwire {
            phase: GuardrailKind::Output,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// S6 — race
// ---------------------------------------------------------------------------

#[tokio::test]
async fn race_returns_fastest_agent() {
    let fast = Agent::builder("Fast")
        .model(Arc::new(
            MockModel::new(vec![ModelResponse::text("fast")])
                .with_latency(Duration::from_millis(50)),
        ))
        .build_shared()
        .unwrap();
    let slow = Agent::builder("Slow")
        .model(Arc::new(
            MockModel::new(vec![ModelResponse::text("slow")])
                .with_latency(Duration::from_millis(500)),
        ))
        .build_shared()
        .unwrap();

    let started = Instant::now();
    let outcome = race([fast, slow].to_vec(), "hello", RaceOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.result.final_output_text(), "fast");
    assert_eq!(outcome.winning_agent, "Fast");
    assert_eq!(outcome.participant_agents, ["Fast", "Slow"]);
    assert!(elapsed <= Duration::from_millis(250), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn race_timeout_rejects() {
    let slow = Agent::builder("Slow")
        .model(Arc::new(
            MockModel::new(vec![ModelResponse::text("slow")])
                .with_latency(Duration::from_millis(400)),
        ))
        .build_shared()
        .unwrap();

    let err = race(
        vec![slow],
        "hello",
        RaceOptions {
            timeout_ms: Some(50),
            config: RunConfig::new(),
        },
    )
    .await
    .expect_err("timeout");
    assert!(matches!(err, Error::Timeout { ms: 50 }));
}

// ---------------------------------------------------------------------------
// parallel / judge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_mismatched_inputs_fail_before_any_run() {
    let a = Agent::builder("A")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("a")])))
        .build_shared()
        .unwrap();
    let b = Agent::builder("B")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("b")])))
        .build_shared()
        .unwrap();

    let err = parallel(
        vec![a, b],
        vec!["only one".to_owned()],
        ParallelOptions::default(),
    )
    .await
    .expect_err("length mismatch");
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn parallel_aggregates_results() {
    let a = Agent::builder("A")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("alpha")])))
        .build_shared()
        .unwrap();
    let b = Agent::builder("B")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("beta")])))
        .build_shared()
        .unwrap();

    let outcome = parallel(
        vec![a, b],
        "same prompt",
        ParallelOptions {
            fail_fast: false,
            aggregator: Some(Arc::new(|results| {
                json!(results
                    .iter()
                    .map(RunResult::final_output_text)
                    .collect::<Vec<_>>()
                    .join("+"))
            })),
            config: RunConfig::new(),
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.failed_agents.is_empty());
    assert_eq!(outcome.aggregated, Some(json!("alpha+beta")));
}

#[tokio::test]
async fn judge_sees_labeled_worker_outputs() {
    let workers = vec![
        Agent::builder("Optimist")
            .model(Arc::new(MockModel::new(vec![ModelResponse::text("glass half full")])))
            .build_shared()
            .unwrap(),
        Agent::builder("Pessimist")
            .model(Arc::new(MockModel::new(vec![ModelResponse::text("glass half empty")])))
            .build_shared()
            .unwrap(),
    ];
    let arbiter = Agent::builder("Arbiter")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text(
            "the optimist wins",
        )])))
        .build_shared()
        .unwrap();

    let outcome = judge(workers, arbiter, "describe the glass", RunConfig::new())
        .await
        .unwrap();

    assert_eq!(outcome.result.final_output_text(), "the optimist wins");
    assert_eq!(outcome.worker_results.len(), 2);
    assert!(outcome.failed_workers.is_empty());

    // The judge prompt embeds each worker's labeled output.
    let judge_input = outcome
        .result
        .state
        .as_ref()
        .unwrap()
        .original_input()
        .to_owned();
    assert!(judge_input.contains("[1]"));
    assert!(judge_input.contains("glass half full"));
    assert!(judge_input.contains("[2]"));
    assert!(judge_input.contains("glass half empty"));
}

#[tokio::test]
async fn judge_proceeds_with_surviving_workers() {
    // An empty script makes the mock error on its first call.
    let workers = vec![
        Agent::builder("Broken")
            .model(Arc::new(MockModel::new(vec![])))
            .build_shared()
            .unwrap(),
        Agent::builder("Steady")
            .model(Arc::new(MockModel::new(vec![ModelResponse::text("solid answer")])))
            .build_shared()
            .unwrap(),
    ];
    let arbiter = Agent::builder("Arbiter")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text(
            "the steady one wins",
        )])))
        .build_shared()
        .unwrap();

    let outcome = judge(workers, arbiter, "answer the question", RunConfig::new())
        .await
        .unwrap();

    assert_eq!(outcome.result.final_output_text(), "the steady one wins");
    assert_eq!(outcome.worker_results.len(), 1);
    assert_eq!(outcome.failed_workers.len(), 1);
    assert_eq!(outcome.failed_workers[0].0, "Broken");

    // Only the surviving output is offered to the judge.
    let judge_input = outcome
        .result
        .state
        .as_ref()
        .unwrap()
        .original_input()
        .to_owned();
    assert!(judge_input.contains("solid answer"));
    assert!(!judge_input.contains("[2]"));
}

#[tokio::test]
async fn judge_rejects_when_every_worker_fails() {
    let workers = vec![
        Agent::builder("BrokenA")
            .model(Arc::new(MockModel::new(vec![])))
            .build_shared()
            .unwrap(),
        Agent::builder("BrokenB")
            .model(Arc::new(MockModel::new(vec![])))
            .build_shared()
            .unwrap(),
    ];
    let arbiter = Agent::builder("Arbiter")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("unused")])))
        .build_shared()
        .unwrap();

    let err = judge(workers, arbiter, "answer", RunConfig::new())
        .await
        .expect_err("nothing to judge");
    match err {
        Error::AgentsFailed { failures } => {
            assert_eq!(failures.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Limits, aborts, enablement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn max_turns_exceeded_is_fatal() {
    // The model keeps calling tools and never produces a final answer.
    let model = Arc::new(MockModel::new(vec![ModelResponse::tool_calls(vec![call(
        "call_1",
        "add",
        json!({"a": 1, "b": 1}),
    )])]));
    let agent = Agent::builder("Loop")
        .model(model)
        .tool(add_tool())
        .build_shared()
        .unwrap();

    let err = Runner::run(agent, "never stop", RunConfig::new().with_max_turns(3))
        .await
        .expect_err("must hit the limit");
    match err {
        Error::MaxTurnsExceeded {
            agent_name,
            max_turns,
        } => {
            assert_eq!(agent_name, "Loop");
            assert_eq!(max_turns, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn abort_signal_stops_the_run() {
    let abort = Arc::new(AtomicBool::new(true));
    let agent = Agent::builder("Doomed")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("nope")])))
        .build_shared()
        .unwrap();

    let err = Runner::run(agent, "hi", RunConfig::new().with_abort(abort))
        .await
        .expect_err("aborted");
    assert!(matches!(err, Error::Aborted));
}

#[tokio::test]
async fn disabled_tool_yields_synthetic_error_without_invocation() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let gated = FunctionTool::new(
        "gated",
        "Only when allowed.",
        json!({"type": "object", "properties": {}}),
        move |_args, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("ran"))
            }
        },
    )
    .enabled_when(|ctx| {
        ctx.context_get("allowed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    });

    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call("call_1", "gated", json!({}))]),
        ModelResponse::text("ok"),
    ]));
    let agent = Agent::builder("Gatekeeper")
        .model(model)
        .tool(gated)
        .build_shared()
        .unwrap();

    let result = Runner::run(
        agent,
        "try it",
        RunConfig::new().with_context(json!({"allowed": false})),
    )
    .await
    .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    let tool_message = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("synthetic result message");
    let body: Value = serde_json::from_str(&tool_message.text()).unwrap();
    assert_eq!(body["error"], json!("tool disabled"));
}

#[tokio::test]
async fn tool_errors_recover_locally() {
    let flaky = FunctionTool::new(
        "flaky",
        "Always fails.",
        json!({"type": "object", "properties": {}}),
        |_args, _ctx| async move {
            Err::<Value, _>(ToolError::execution("flaky", "backend down"))
        },
    );
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call("call_1", "flaky", json!({}))]),
        ModelResponse::text("recovered"),
    ]));
    let agent = Agent::builder("Resilient")
        .model(model)
        .tool(flaky)
        .build_shared()
        .unwrap();

    let result = Runner::run(agent, "go", RunConfig::new()).await.unwrap();

    // The failure is not fatal; the agent observes it and recovers.
    assert_eq!(result.final_output_text(), "recovered");
    let record = &result.steps[0].tool_calls[0];
    assert!(record.result.is_none());
    assert!(record.error.as_deref().unwrap().contains("backend down"));
    let tool_message = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_message.text().contains("backend down"));
}

// ---------------------------------------------------------------------------
// Sessions, schemas, nesting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_history_loads_and_appends() {
    let session = Arc::new(InMemorySession::new());
    session
        .add_messages(&[Message::user("earlier question"), Message::assistant("earlier answer")])
        .await
        .unwrap();

    let capture = Arc::new(WindowCapture::default());
    let agent = Agent::builder("Historian")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("with history")])))
        .build_shared()
        .unwrap();

    let config = RunConfig::new()
        .with_session(Arc::clone(&session) as Arc<dyn Session>)
        .with_hooks(Arc::clone(&capture) as Arc<dyn RunHooks>);
    let result = Runner::run(agent, "new question", config).await.unwrap();
    assert_eq!(result.final_output_text(), "with history");

    // History precedes the fresh input in the model window.
    let windows = capture.windows.lock().unwrap();
    let texts: Vec<_> = windows[0].iter().map(Message::text).collect();
    assert_eq!(texts, ["earlier question", "earlier answer", "new question"]);

    // Successful finalization wrote the exchange back.
    let stored = session.get_history().await.unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[2].text(), "new question");
    assert_eq!(stored[3].text(), "with history");
}

#[tokio::test]
async fn output_schema_parses_fenced_json() {
    let model = Arc::new(MockModel::new(vec![ModelResponse::text(
        "Sure!\n```json\n{\"answer\": 5}\n```",
    )]));
    let agent = Agent::builder("Structured")
        .model(model)
        .output_schema(OutputSchema::new(
            "answer",
            json!({"type": "object", "properties": {"answer": {"type": "number"}}}),
        ))
        .build_shared()
        .unwrap();

    let result = Runner::run(agent, "compute", RunConfig::new()).await.unwrap();
    assert_eq!(result.final_output["answer"], json!(5));
    assert!(result.metadata.warnings.is_empty());
}

#[tokio::test]
async fn output_schema_falls_back_to_raw_text_with_warning() {
    let model = Arc::new(MockModel::new(vec![ModelResponse::text("just prose")]));
    let agent = Agent::builder("Structured")
        .model(model)
        .output_schema(OutputSchema::new("answer", json!({"type": "object"})))
        .build_shared()
        .unwrap();

    let result = Runner::run(agent, "compute", RunConfig::new()).await.unwrap();
    assert_eq!(result.final_output, json!("just prose"));
    assert_eq!(result.metadata.warnings.len(), 1);
}

#[tokio::test]
async fn agent_as_tool_returns_child_output() {
    let child = Agent::builder("Summarizer")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("a summary")])))
        .build_shared()
        .unwrap();

    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call(
            "call_1",
            "run_summarizer",
            json!({"input": "summarize the report"}),
        )]),
        ModelResponse::text("parent done"),
    ]));
    let parent = Agent::builder("Parent")
        .model(model)
        .tool(child.as_tool(AsToolOptions::default()))
        .build_shared()
        .unwrap();

    let result = Runner::run(parent, "go", RunConfig::new()).await.unwrap();
    assert_eq!(result.final_output_text(), "parent done");

    // The child's final output was observed as the tool result.
    let tool_message = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert_eq!(tool_message.text(), "a summary");
    // asTool keeps the parent in control: no handoff happened.
    assert_eq!(result.metadata.handoff_chain, ["Parent"]);
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streamed_run_yields_lifecycle_events() {
    let model = Arc::new(MockModel::new(vec![
        ModelResponse::tool_calls(vec![call("call_1", "add", json!({"a": 2, "b": 3}))]),
        ModelResponse::text("5"),
    ]));
    let agent = Agent::builder("Calc")
        .model(model)
        .tool(add_tool())
        .build_shared()
        .unwrap();

    let stream = run_streamed(agent, "What is 2+3?", RunConfig::new());
    futures::pin_mut!(stream);

    let mut saw_start = false;
    let mut deltas = String::new();
    let mut tool_completed = 0;
    let mut final_output = None;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            RunEvent::RunStarted { agent_name } => {
                saw_start = true;
                assert_eq!(agent_name, "Calc");
            }
            RunEvent::TextDelta(delta) => deltas.push_str(&delta),
            RunEvent::ToolCallCompleted { record } => {
                tool_completed += 1;
                assert_eq!(record.name, "add");
            }
            RunEvent::RunCompleted { result } => {
                final_output = Some(result.final_output_text());
            }
            _ => {}
        }
    }

    assert!(saw_start);
    assert_eq!(deltas, "5");
    assert_eq!(tool_completed, 1);
    assert_eq!(final_output.as_deref(), Some("5"));
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deterministic_runs_are_idempotent() {
    let build = || {
        Agent::builder("Calc")
            .model(Arc::new(MockModel::new(vec![
                ModelResponse::tool_calls(vec![call("call_1", "add", json!({"a": 2, "b": 3}))])
                    .with_usage(Usage::new(10, 5)),
                ModelResponse::text("5").with_usage(Usage::new(8, 2)),
            ])))
            .tool(add_tool())
            .build_shared()
            .unwrap()
    };

    let first = Runner::run(build(), "What is 2+3?", RunConfig::new())
        .await
        .unwrap();
    let second = Runner::run(build(), "What is 2+3?", RunConfig::new())
        .await
        .unwrap();

    assert_eq!(first.final_output, second.final_output);
    assert_eq!(first.steps.len(), second.steps.len());
    assert_eq!(
        serde_json::to_value(&first.messages).unwrap(),
        serde_json::to_value(&second.messages).unwrap()
    );
}

// ---------------------------------------------------------------------------
// Span accounting
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SpanLedger {
    spans_opened: AtomicUsize,
    spans_closed: AtomicUsize,
    generations_opened: AtomicUsize,
    generations_closed: AtomicUsize,
}

struct LedgerBackend(Arc<SpanLedger>);
struct LedgerTrace(Arc<SpanLedger>);
struct LedgerSpan(Arc<SpanLedger>);
struct LedgerGeneration(Arc<SpanLedger>);

impl TraceBackend for LedgerBackend {
    fn create_trace(&self, _options: &TraceOptions) -> Arc<dyn TraceHandle> {
        Arc::new(LedgerTrace(Arc::clone(&self.0)))
    }
}

impl TraceHandle for LedgerTrace {
    fn span(&self, _options: &SpanOptions) -> Arc<dyn SpanHandle> {
        self.0.spans_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(LedgerSpan(Arc::clone(&self.0)))
    }

    fn generation(&self, _options: &GenerationOptions) -> Arc<dyn GenerationHandle> {
        self.0.generations_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(LedgerGeneration(Arc::clone(&self.0)))
    }

    fn end(&self, _output: Option<Value>) {}
}

impl SpanHandle for LedgerSpan {
    fn child(&self, _options: &SpanOptions) -> Arc<dyn SpanHandle> {
        self.0.spans_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(LedgerSpan(Arc::clone(&self.0)))
    }

    fn generation(&self, _options: &GenerationOptions) -> Arc<dyn GenerationHandle> {
        self.0.generations_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(LedgerGeneration(Arc::clone(&self.0)))
    }

    fn end(&self, _end: SpanEnd) {
        self.0.spans_closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl GenerationHandle for LedgerGeneration {
    fn end(&self, _output: Option<Value>, _usage: Usage) {
        self.0.generations_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn spans_close_on_every_exit_path() {
    let ledger = Arc::new(SpanLedger::default());
    telemetry::set_trace_backend(Arc::new(LedgerBackend(Arc::clone(&ledger))));

    // Success path with a transfer and a tool call.
    let specialist = Agent::builder("Specialist")
        .model(Arc::new(MockModel::new(vec![ModelResponse::text("done")])))
        .build_shared()
        .unwrap();
    let coordinator = Agent::builder("Coordinator")
        .model(Arc::new(MockModel::new(vec![ModelResponse::tool_calls(
            vec![call("call_1", "transfer_to_specialist", json!({"reason": "go"}))],
        )])))
        .subagent(specialist)
        .build_shared()
        .unwrap();
    telemetry::with_trace(TraceOptions::named("success"), async {
        Runner::run(coordinator, "task", RunConfig::new()).await.unwrap();
    })
    .await;

    // Failure path: max turns exceeded.
    let looping = Agent::builder("Loop")
        .model(Arc::new(MockModel::new(vec![ModelResponse::tool_calls(
            vec![call("call_1", "add", json!({"a": 1, "b": 1}))],
        )])))
        .tool(add_tool())
        .build_shared()
        .unwrap();
    telemetry::with_trace(TraceOptions::named("failure"), async {
        let _ = Runner::run(looping, "loop", RunConfig::new().with_max_turns(2)).await;
    })
    .await;

    telemetry::set_trace_backend(Arc::new(telemetry::NoopBackend));

    assert_eq!(
        ledger.spans_opened.load(Ordering::SeqCst),
        ledger.spans_closed.load(Ordering::SeqCst),
        "every span must close"
    );
    assert_eq!(
        ledger.generations_opened.load(Ordering::SeqCst),
        ledger.generations_closed.load(Ordering::SeqCst),
        "every generation must close"
    );
    assert!(ledger.spans_opened.load(Ordering::SeqCst) > 0);
}
