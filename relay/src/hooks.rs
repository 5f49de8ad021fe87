//! Lifecycle hooks for observing a run.
//!
//! Hooks observe but never steer: they receive the run context and the
//! event payload, and their return values are ignored. Configure a
//! run-level observer on [`RunConfig`](crate::runner::RunConfig) and a
//! per-agent observer on the agent; both layers fire concurrently at each
//! event point.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::RunContext;
use crate::error::Error;
use crate::message::Message;
use crate::model::ModelResponse;

/// Observer for run lifecycle events. All methods default to no-ops.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// An agent became active (run start or transfer target).
    async fn on_agent_start(&self, _ctx: &RunContext, _agent_name: &str) {}

    /// An agent produced the run's final output.
    async fn on_agent_end(&self, _ctx: &RunContext, _agent_name: &str, _output: &Value) {}

    /// A model call is about to be issued.
    async fn on_model_start(&self, _ctx: &RunContext, _agent_name: &str, _messages: &[Message]) {}

    /// A model call completed.
    async fn on_model_end(&self, _ctx: &RunContext, _agent_name: &str, _response: &ModelResponse) {}

    /// A tool is about to execute.
    async fn on_tool_start(&self, _ctx: &RunContext, _tool_name: &str) {}

    /// A tool finished (the rendered result, or the recorded error).
    async fn on_tool_end(&self, _ctx: &RunContext, _tool_name: &str, _result: &str) {}

    /// Control transferred between agents.
    async fn on_transfer(&self, _ctx: &RunContext, _from: &str, _to: &str) {}

    /// The run failed with a fatal error.
    async fn on_error(&self, _ctx: &RunContext, _error: &Error) {}
}

/// The do-nothing observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {}

/// Dispatches each event to the run-level and agent-level observers,
/// firing both layers concurrently.
pub(crate) struct HookSet<'a> {
    run: &'a dyn RunHooks,
    agent: Option<&'a dyn RunHooks>,
}

impl<'a> HookSet<'a> {
    pub fn new(run: &'a dyn RunHooks, agent: Option<&'a dyn RunHooks>) -> Self {
        Self { run, agent }
    }

    pub async fn agent_start(&self, ctx: &RunContext, agent_name: &str) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_agent_start(ctx, agent_name),
                agent.on_agent_start(ctx, agent_name),
            );
        } else {
            self.run.on_agent_start(ctx, agent_name).await;
        }
    }

    pub async fn agent_end(&self, ctx: &RunContext, agent_name: &str, output: &Value) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_agent_end(ctx, agent_name, output),
                agent.on_agent_end(ctx, agent_name, output),
            );
        } else {
            self.run.on_agent_end(ctx, agent_name, output).await;
        }
    }

    pub async fn model_start(&self, ctx: &RunContext, agent_name: &str, messages: &[Message]) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_model_start(ctx, agent_name, messages),
                agent.on_model_start(ctx, agent_name, messages),
            );
        } else {
            self.run.on_model_start(ctx, agent_name, messages).await;
        }
    }

    pub async fn model_end(&self, ctx: &RunContext, agent_name: &str, response: &ModelResponse) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_model_end(ctx, agent_name, response),
                agent.on_model_end(ctx, agent_name, response),
            );
        } else {
            self.run.on_model_end(ctx, agent_name, response).await;
        }
    }

    pub async fn tool_start(&self, ctx: &RunContext, tool_name: &str) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_tool_start(ctx, tool_name),
                agent.on_tool_start(ctx, tool_name),
            );
        } else {
            self.run.on_tool_start(ctx, tool_name).await;
        }
    }

    pub async fn tool_end(&self, ctx: &RunContext, tool_name: &str, result: &str) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_tool_end(ctx, tool_name, result),
                agent.on_tool_end(ctx, tool_name, result),
            );
        } else {
            self.run.on_tool_end(ctx, tool_name, result).await;
        }
    }

    pub async fn transfer(&self, ctx: &RunContext, from: &str, to: &str) {
        if let Some(agent) = self.agent {
            tokio::join!(
                self.run.on_transfer(ctx, from, to),
                agent.on_transfer(ctx, from, to),
            );
        } else {
            self.run.on_transfer(ctx, from, to).await;
        }
    }

    pub async fn error(&self, ctx: &RunContext, error: &Error) {
        if let Some(agent) = self.agent {
            tokio::join!(self.run.on_error(ctx, error), agent.on_error(ctx, error));
        } else {
            self.run.on_error(ctx, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl RunHooks for Recorder {
        async fn on_agent_start(&self, _ctx: &RunContext, agent_name: &str) {
            if let Ok(mut log) = self.0.lock() {
                log.push(format!("start:{agent_name}"));
            }
        }

        async fn on_tool_end(&self, _ctx: &RunContext, tool_name: &str, result: &str) {
            if let Ok(mut log) = self.0.lock() {
                log.push(format!("tool:{tool_name}={result}"));
            }
        }
    }

    #[tokio::test]
    async fn both_layers_fire() {
        let run_level = Recorder::default();
        let agent_level = Recorder::default();
        let hooks = HookSet::new(&run_level, Some(&agent_level));
        let ctx = RunContext::default();

        hooks.agent_start(&ctx, "planner").await;
        hooks.tool_end(&ctx, "add", "5").await;

        for recorder in [&run_level, &agent_level] {
            let log = recorder.0.lock().expect("log");
            assert_eq!(*log, vec!["start:planner", "tool:add=5"]);
        }
    }
}
