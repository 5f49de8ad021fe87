#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(tail_expr_drop_order)]
//! Relay is an autonomous multi-agent execution runtime: a scheduler
//! that drives model-backed agents through turns of tool invocation,
//! control transfer to peer agents, and termination with a final output
//! — under guardrail validation, human-in-the-loop approval, and
//! turn/token budgets.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay::prelude::*;
//!
//! let agent = Agent::builder("Calc")
//!     .instructions("You are a calculator.")
//!     .model(model)
//!     .tool(add_tool)
//!     .build_shared()?;
//!
//! let result = Runner::run(agent, "What is 2+3?", RunConfig::new()).await?;
//! println!("{}", result.final_output_text());
//! ```

// Core data model
pub mod context;
pub mod error;
pub mod message;
pub mod usage;

// Extension points
pub mod guardrail;
pub mod hooks;
pub mod model;
pub mod session;
pub mod telemetry;
pub mod tool;

// Agents and the execution engine
pub mod agent;
pub mod approval;
pub mod coordination;
pub mod result;
pub mod runner;
pub mod state;
pub mod step;
pub mod transfer;

pub mod prelude;

// Re-export the types that make up the everyday API surface.
pub use agent::{Agent, AgentBuilder, AsToolOptions, Instructions, OutputSchema};
pub use approval::{
    ApprovalDecision, ApprovalManager, ApprovalPolicy, ApprovalRequest, ApprovalRequestMetadata,
    ApprovalStatus,
};
pub use context::RunContext;
pub use coordination::{judge, parallel, race};
pub use error::{Error, Result, ToolError, ToolResult};
pub use guardrail::{Guardrail, GuardrailCheck, GuardrailKind, GuardrailVerdict};
pub use hooks::RunHooks;
pub use message::{Content, ContentPart, Message, Role, ToolCall};
pub use model::{
    FinishReason, MockModel, ModelProvider, ModelRequest, ModelResponse, ModelSettings,
    StreamChunk, default_model, set_default_model,
};
pub use result::{RunMetadata, RunResult, get_pending_approvals, needs_approval};
pub use runner::{
    DEFAULT_MAX_TURNS, RunConfig, RunEvent, Runner, resume_after_approval, run, run_streamed,
    run_with_approval_callback,
};
pub use session::{InMemorySession, Session};
pub use state::{AgentMetrics, NextStep, RunState, StepResult, ToolCallRecord};
pub use tool::{
    ApprovalMetadata, Enabled, FunctionTool, ResultEncoder, Severity, Tool, ToolDefinition,
};
pub use usage::Usage;
