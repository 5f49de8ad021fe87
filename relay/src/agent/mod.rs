//! Agent templates.
//!
//! An [`Agent`] is a reusable, immutable template: instructions, tools,
//! subagents, guardrails, and model settings. It holds no per-run state —
//! the same agent can drive many concurrent runs. Ownership of templates
//! belongs to the application; the runtime only traverses `subagents`
//! during a run, so agent graphs may share nodes freely via [`Arc`].

mod as_tool;
mod builder;

pub use as_tool::AsToolOptions;
pub use builder::AgentBuilder;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::RunContext;
use crate::guardrail::Guardrail;
use crate::hooks::RunHooks;
use crate::model::{ModelProvider, ModelSettings};
use crate::state::ToolCallRecord;
use crate::tool::{BoxedTool, ResultEncoder, Tool as _};

/// Default per-agent turn limit applied by the builder.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Predicate consulted after each step to force early finalization.
pub type ShouldFinishFn = Arc<dyn Fn(&RunContext, &[ToolCallRecord]) -> bool + Send + Sync>;

/// System instructions: a fixed string, or a function of the run context
/// re-evaluated every turn.
#[derive(Clone)]
pub enum Instructions {
    /// Fixed instructions, resolved once.
    Static(String),
    /// Instructions computed from the run context each turn.
    Dynamic(Arc<dyn Fn(&RunContext) -> String + Send + Sync>),
}

impl Instructions {
    /// Resolve the instructions for the current turn.
    #[must_use]
    pub fn resolve(&self, ctx: &RunContext) -> String {
        match self {
            Self::Static(text) => text.clone(),
            Self::Dynamic(f) => f(ctx),
        }
    }

    /// Whether the instructions are a fixed string.
    #[must_use]
    pub const fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for Instructions {
    fn from(text: &str) -> Self {
        Self::Static(text.to_owned())
    }
}

impl From<String> for Instructions {
    fn from(text: String) -> Self {
        Self::Static(text)
    }
}

/// Validation schema applied to the final output.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    /// Schema name, surfaced to the model.
    pub name: String,
    /// The JSON schema.
    pub schema: Value,
}

impl OutputSchema {
    /// Create a schema from a name and JSON schema value.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Derive the schema from a Rust type.
    #[must_use]
    pub fn from_type<T: schemars::JsonSchema>() -> Self {
        let name = <T as schemars::JsonSchema>::schema_name().into_owned();
        Self::new(name, crate::tool::schema_for::<T>())
    }

    /// Parse the model's final text against this schema.
    ///
    /// Attempts a naive JSON parse first, then extraction of the first
    /// fenced code block, and finally falls back to the raw text with a
    /// warning — schema errors degrade, they never fail the run.
    #[must_use]
    pub fn parse(&self, text: &str) -> (Value, Option<String>) {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return (value, None);
        }
        if let Some(block) = extract_fenced_block(text) {
            if let Ok(value) = serde_json::from_str::<Value>(&block) {
                return (value, None);
            }
        }
        (
            Value::String(text.to_owned()),
            Some(format!(
                "output did not parse against schema '{}'; returning raw text",
                self.name
            )),
        )
    }
}

/// Extract the body of the first fenced code block, tolerating an
/// optional language tag after the opening fence.
fn extract_fenced_block(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n').map_or(0, |i| i + 1);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_owned())
}

/// A reusable template of instructions, tools, subagents, and settings.
pub struct Agent {
    pub(crate) name: String,
    pub(crate) instructions: Instructions,
    pub(crate) model: Option<Arc<dyn ModelProvider>>,
    pub(crate) tools: Vec<BoxedTool>,
    pub(crate) subagents: Vec<Arc<Agent>>,
    pub(crate) transfer_description: Option<String>,
    pub(crate) guardrails: Vec<Guardrail>,
    pub(crate) output_schema: Option<OutputSchema>,
    pub(crate) model_settings: ModelSettings,
    pub(crate) max_steps: Option<usize>,
    pub(crate) should_finish: Option<ShouldFinishFn>,
    pub(crate) result_encoder: Option<Arc<dyn ResultEncoder>>,
    pub(crate) hooks: Option<Arc<dyn RunHooks>>,
}

impl Agent {
    /// Start building an agent with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// The agent's name, unique within a run.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's instructions.
    #[must_use]
    pub const fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    /// The agent's explicit model, if any.
    #[must_use]
    pub const fn model(&self) -> Option<&Arc<dyn ModelProvider>> {
        self.model.as_ref()
    }

    /// The agent's tools.
    #[must_use]
    pub fn tools(&self) -> &[BoxedTool] {
        &self.tools
    }

    /// The agent's transfer targets.
    #[must_use]
    pub fn subagents(&self) -> &[Arc<Agent>] {
        &self.subagents
    }

    /// Legacy alias for [`subagents`](Self::subagents).
    #[must_use]
    pub fn handoffs(&self) -> &[Arc<Agent>] {
        &self.subagents
    }

    /// Description used when this agent is offered as a transfer target.
    #[must_use]
    pub fn transfer_description(&self) -> Option<&str> {
        self.transfer_description.as_deref()
    }

    /// The agent's guardrails.
    #[must_use]
    pub fn guardrails(&self) -> &[Guardrail] {
        &self.guardrails
    }

    /// The agent's output schema, if configured.
    #[must_use]
    pub const fn output_schema(&self) -> Option<&OutputSchema> {
        self.output_schema.as_ref()
    }

    /// Sampling settings for the agent's model calls.
    #[must_use]
    pub const fn model_settings(&self) -> &ModelSettings {
        &self.model_settings
    }

    /// Per-agent turn limit, if configured.
    #[must_use]
    pub const fn max_steps(&self) -> Option<usize> {
        self.max_steps
    }

    /// Per-agent lifecycle observer, if configured.
    #[must_use]
    pub const fn hooks(&self) -> Option<&Arc<dyn RunHooks>> {
        self.hooks.as_ref()
    }

    /// Compact-result encoder, if configured.
    #[must_use]
    pub const fn result_encoder(&self) -> Option<&Arc<dyn ResultEncoder>> {
        self.result_encoder.as_ref()
    }

    /// Early-finish predicate, if configured.
    #[must_use]
    pub const fn should_finish(&self) -> Option<&ShouldFinishFn> {
        self.should_finish.as_ref()
    }

    /// Look up one of the agent's own tools by name.
    #[must_use]
    pub fn find_tool(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Look up a subagent by name.
    #[must_use]
    pub fn find_subagent(&self, name: &str) -> Option<&Arc<Agent>> {
        self.subagents.iter().find(|a| a.name == name)
    }

    /// A builder pre-populated with this agent's configuration, for
    /// producing modified copies.
    #[must_use]
    pub fn to_builder(&self) -> AgentBuilder {
        AgentBuilder::from_agent(self)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field(
                "subagents",
                &self.subagents.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}
