//! Error types for the relay runtime.
//!
//! Two error enums cover the crate: [`Error`] for run-fatal conditions
//! surfaced to the caller, and [`ToolError`] for failures inside a single
//! tool invocation. Tool failures are recorded on the step's tool record
//! and shown to the model as tool output — they never abort the run.

use thiserror::Error;

use crate::guardrail::GuardrailKind;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// A type alias for `Result<T, ToolError>`.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Run-fatal errors surfaced to the caller of [`Runner::run`](crate::runner::Runner::run).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The turn loop hit its configured limit without producing output.
    #[error("agent '{agent_name}' exceeded maximum turns ({max_turns})")]
    MaxTurnsExceeded {
        /// Agent that was active when the limit was hit.
        agent_name: String,
        /// The configured turn limit.
        max_turns: usize,
    },

    /// An input or output guardrail rejected the run.
    #[error("guardrail '{guardrail_name}' tripped during {phase}: {message}")]
    GuardrailTripwire {
        /// Name of the guardrail that rejected.
        guardrail_name: String,
        /// Whether the input or output gate tripped.
        phase: GuardrailKind,
        /// The guardrail's rejection message.
        message: String,
    },

    /// Invalid configuration detected before any model invocation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled through its abort signal.
    #[error("run aborted")]
    Aborted,

    /// The language model returned an error.
    #[error("model error: {0}")]
    Model(String),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// One or more coordinated agent runs failed.
    ///
    /// Raised when every participant of a
    /// [`race`](crate::coordination::race) fails, or when a fail-fast
    /// [`parallel`](crate::coordination::parallel) sees any failure.
    #[error("{} agent(s) failed: {}", .failures.len(), format_failures(.failures))]
    AgentsFailed {
        /// `(agent_name, error message)` per failed participant.
        failures: Vec<(String, String)>,
    },

    /// A coordinated run exceeded its time budget.
    #[error("timed out after {ms}ms")]
    Timeout {
        /// The configured budget.
        ms: u64,
    },

    /// A session backend failed to load or persist history.
    #[error("session error: {0}")]
    Session(String),
}

impl Error {
    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    /// Create a session error.
    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a guardrail tripwire error.
    #[must_use]
    pub fn guardrail(
        guardrail_name: impl Into<String>,
        phase: GuardrailKind,
        message: impl Into<String>,
    ) -> Self {
        Self::GuardrailTripwire {
            guardrail_name: guardrail_name.into(),
            phase,
            message: message.into(),
        }
    }

    /// Create a max-turns error.
    #[must_use]
    pub fn max_turns(agent_name: impl Into<String>, max_turns: usize) -> Self {
        Self::MaxTurnsExceeded {
            agent_name: agent_name.into(),
            max_turns,
        }
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, msg)| format!("{name}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced inside a single tool invocation.
///
/// These are recorded on the [`ToolCallRecord`](crate::state::ToolCallRecord)
/// and fed back to the model as tool output; the agent decides recovery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The arguments did not match the tool's input schema.
    #[error("invalid arguments for tool '{tool_name}': {message}")]
    InvalidArgs {
        /// The tool that rejected its arguments.
        tool_name: String,
        /// Description of the mismatch.
        message: String,
    },

    /// The tool body failed.
    #[error("tool '{tool_name}' failed: {message}")]
    Execution {
        /// The tool that failed.
        tool_name: String,
        /// The failure message.
        message: String,
    },

    /// No tool with the requested name is registered on the agent.
    #[error("tool '{0}' not found")]
    NotFound(String),
}

impl ToolError {
    /// Create an invalid-arguments error.
    #[must_use]
    pub fn invalid_args(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create an execution error.
    #[must_use]
    pub fn execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }
}
