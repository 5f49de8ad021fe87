//! Convenience re-exports for the common API surface.
//!
//! ```rust,ignore
//! use relay::prelude::*;
//! ```

pub use crate::agent::{Agent, AgentBuilder, AsToolOptions, Instructions, OutputSchema};
pub use crate::approval::{
    self, ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalStatus,
};
pub use crate::context::RunContext;
pub use crate::coordination::{
    JudgeOutcome, ParallelOptions, ParallelOutcome, RaceOptions, RaceOutcome, judge, parallel,
    race,
};
pub use crate::error::{Error, Result, ToolError, ToolResult};
pub use crate::guardrail::{Guardrail, GuardrailCheck, GuardrailKind, GuardrailVerdict};
pub use crate::hooks::RunHooks;
pub use crate::message::{Content, Message, Role, ToolCall};
pub use crate::model::{
    FinishReason, MockModel, ModelProvider, ModelRequest, ModelResponse, ModelSettings,
    set_default_model,
};
pub use crate::result::{RunResult, get_pending_approvals, needs_approval};
pub use crate::runner::{
    RunConfig, RunEvent, Runner, resume_after_approval, run, run_streamed,
    run_with_approval_callback,
};
pub use crate::session::{InMemorySession, Session};
pub use crate::state::{NextStep, RunState, ToolCallRecord};
pub use crate::tool::{ApprovalMetadata, Enabled, FunctionTool, Severity, Tool, ToolDefinition};
pub use crate::usage::Usage;
