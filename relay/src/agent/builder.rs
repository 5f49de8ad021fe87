//! Builder for [`Agent`] templates.

use std::sync::Arc;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::guardrail::Guardrail;
use crate::hooks::RunHooks;
use crate::model::{ModelProvider, ModelSettings};
use crate::state::ToolCallRecord;
use crate::tool::{BoxedTool, ResultEncoder, Tool};

use super::{Agent, DEFAULT_MAX_STEPS, Instructions, OutputSchema, ShouldFinishFn};

/// Builder for [`Agent`].
///
/// ```rust,ignore
/// let agent = Agent::builder("Calc")
///     .instructions("You are a calculator.")
///     .model(model)
///     .tool(add_tool)
///     .build()?;
/// ```
pub struct AgentBuilder {
    name: String,
    instructions: Instructions,
    model: Option<Arc<dyn ModelProvider>>,
    tools: Vec<BoxedTool>,
    subagents: Vec<Arc<Agent>>,
    transfer_description: Option<String>,
    guardrails: Vec<Guardrail>,
    output_schema: Option<OutputSchema>,
    model_settings: ModelSettings,
    max_steps: Option<usize>,
    should_finish: Option<ShouldFinishFn>,
    result_encoder: Option<Arc<dyn ResultEncoder>>,
    hooks: Option<Arc<dyn RunHooks>>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Create a builder for an agent with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Instructions::Static(String::new()),
            model: None,
            tools: Vec::new(),
            subagents: Vec::new(),
            transfer_description: None,
            guardrails: Vec::new(),
            output_schema: None,
            model_settings: ModelSettings::default(),
            max_steps: Some(DEFAULT_MAX_STEPS),
            should_finish: None,
            result_encoder: None,
            hooks: None,
        }
    }

    /// Pre-populate a builder from an existing agent (clone-with-overrides).
    #[must_use]
    pub(super) fn from_agent(agent: &Agent) -> Self {
        Self {
            name: agent.name.clone(),
            instructions: agent.instructions.clone(),
            model: agent.model.clone(),
            tools: agent.tools.clone(),
            subagents: agent.subagents.clone(),
            transfer_description: agent.transfer_description.clone(),
            guardrails: agent.guardrails.clone(),
            output_schema: agent.output_schema.clone(),
            model_settings: agent.model_settings,
            max_steps: agent.max_steps,
            should_finish: agent.should_finish.clone(),
            result_encoder: agent.result_encoder.clone(),
            hooks: agent.hooks.clone(),
        }
    }

    /// Override the agent name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set static or dynamic instructions.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<Instructions>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Set instructions computed from the run context every turn.
    #[must_use]
    pub fn instructions_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunContext) -> String + Send + Sync + 'static,
    {
        self.instructions = Instructions::Dynamic(Arc::new(f));
        self
    }

    /// Set the agent's model.
    #[must_use]
    pub fn model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.model = Some(model);
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Add an already-shared tool.
    #[must_use]
    pub fn boxed_tool(mut self, tool: BoxedTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add a transfer target.
    #[must_use]
    pub fn subagent(mut self, agent: Arc<Agent>) -> Self {
        self.subagents.push(agent);
        self
    }

    /// Replace the transfer targets.
    #[must_use]
    pub fn subagents(mut self, agents: Vec<Arc<Agent>>) -> Self {
        self.subagents = agents;
        self
    }

    /// Set the description shown on this agent's transfer tool.
    #[must_use]
    pub fn transfer_description(mut self, description: impl Into<String>) -> Self {
        self.transfer_description = Some(description.into());
        self
    }

    /// Add a guardrail.
    #[must_use]
    pub fn guardrail(mut self, guardrail: Guardrail) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    /// Set the output schema.
    #[must_use]
    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Set sampling settings.
    #[must_use]
    pub const fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    /// Set the per-agent turn limit.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Set the early-finish predicate.
    #[must_use]
    pub fn should_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunContext, &[ToolCallRecord]) -> bool + Send + Sync + 'static,
    {
        self.should_finish = Some(Arc::new(f));
        self
    }

    /// Set the compact-result encoder.
    #[must_use]
    pub fn result_encoder(mut self, encoder: Arc<dyn ResultEncoder>) -> Self {
        self.result_encoder = Some(encoder);
        self
    }

    /// Set the per-agent lifecycle observer.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Validate and build the agent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty name, duplicate tool names,
    /// or duplicate subagent names.
    pub fn build(self) -> Result<Agent> {
        if self.name.trim().is_empty() {
            return Err(Error::config("agent name must not be empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name().to_owned()) {
                return Err(Error::config(format!(
                    "duplicate tool name '{}' on agent '{}'",
                    tool.name(),
                    self.name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for subagent in &self.subagents {
            if !seen.insert(subagent.name().to_owned()) {
                return Err(Error::config(format!(
                    "duplicate subagent name '{}' on agent '{}'",
                    subagent.name(),
                    self.name
                )));
            }
        }

        Ok(Agent {
            name: self.name,
            instructions: self.instructions,
            model: self.model,
            tools: self.tools,
            subagents: self.subagents,
            transfer_description: self.transfer_description,
            guardrails: self.guardrails,
            output_schema: self.output_schema,
            model_settings: self.model_settings,
            max_steps: self.max_steps,
            should_finish: self.should_finish,
            result_encoder: self.result_encoder,
            hooks: self.hooks,
        })
    }

    /// Build and wrap in an [`Arc`], the shape runs and subagent lists want.
    pub fn build_shared(self) -> Result<Arc<Agent>> {
        self.build().map(Arc::new)
    }
}
