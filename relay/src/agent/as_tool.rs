//! Exposing an agent as a tool of another agent.
//!
//! This is the dual of a transfer: the parent's turn continues, the
//! child runs to completion inside the tool call, and the child's final
//! output is observed as the tool result. To keep the two modes apart,
//! the tool is named `run_<slug>` — never `transfer_to_<slug>`.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::ToolError;
use crate::runner::{RunConfig, Runner};
use crate::tool::FunctionTool;
use crate::transfer::slug;

use super::Agent;

/// Options for [`Agent::as_tool`].
#[derive(Debug, Clone, Default)]
pub struct AsToolOptions {
    /// Tool name; defaults to `run_<slug(agent name)>`.
    pub tool_name: Option<String>,
    /// Tool description; defaults to the agent's transfer description.
    pub tool_description: Option<String>,
}

impl Agent {
    /// Wrap this agent as a tool that runs it to completion.
    ///
    /// The nested run uses a default configuration and opens child spans
    /// under the calling tool's span automatically.
    #[must_use]
    pub fn as_tool(self: &Arc<Self>, options: AsToolOptions) -> FunctionTool {
        let name = options
            .tool_name
            .unwrap_or_else(|| format!("run_{}", slug(&self.name)));
        let description = options.tool_description.unwrap_or_else(|| {
            self.transfer_description.clone().unwrap_or_else(|| {
                format!("Run the '{}' agent on a task and return its output.", self.name)
            })
        });

        let agent = Arc::clone(self);
        FunctionTool::new(
            name,
            description,
            json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The task to hand to the agent."
                    }
                },
                "required": ["input"]
            }),
            move |args: Value, _ctx| {
                let agent = Arc::clone(&agent);
                async move {
                    let input = args
                        .get("input")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ToolError::invalid_args(agent.name(), "missing 'input' string")
                        })?
                        .to_owned();

                    let result = Runner::run(Arc::clone(&agent), input, RunConfig::default())
                        .await
                        .map_err(|e| ToolError::execution(agent.name(), e.to_string()))?;
                    Ok(result.final_output)
                }
            },
        )
    }
}
