//! Tool trait and utilities for defining agent tools.
//!
//! Tools are the primary way agents act on the world. Each tool carries a
//! JSON schema for its arguments, an async body, an enablement predicate
//! re-evaluated every turn, and an optional approval policy that can pause
//! the run for a human decision.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalPolicy;
use crate::context::RunContext;
use crate::error::{ToolError, ToolResult};

/// A shared, dynamically dispatched tool.
pub type BoxedTool = Arc<dyn Tool>;

/// Definition of a tool for model function calling.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool (snake_case).
    pub name: String,
    /// Description of what the tool does.
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Serializes to the function-calling wire format:
/// `{"type": "function", "function": {"name", "description", "parameters"}}`.
impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), self.parameters.clone());

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// Severity attached to a tool's approval requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine action.
    #[default]
    Low,
    /// Noticeable side effects.
    Medium,
    /// Destructive or costly action.
    High,
    /// Irreversible action requiring privileged review.
    Critical,
}

/// Static metadata describing why and how a tool's calls get approved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalMetadata {
    /// How severe an unreviewed execution would be.
    pub severity: Severity,
    /// Free-form category (e.g. "filesystem", "billing").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Role required to approve requests from this tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    /// Human-readable reason shown to the approver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Whether a tool is offered to the model this turn.
///
/// The `When` predicate is re-evaluated every turn because context can
/// change mid-run; only the literal variants may be cached.
#[derive(Clone)]
pub enum Enabled {
    /// Tool is always available.
    Always,
    /// Tool is never available.
    Never,
    /// Availability decided per turn from the run context.
    When(Arc<dyn Fn(&RunContext) -> bool + Send + Sync>),
}

impl Enabled {
    /// Evaluate the predicate against the current context.
    #[must_use]
    pub fn evaluate(&self, ctx: &RunContext) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::When(predicate) => predicate(ctx),
        }
    }
}

impl fmt::Debug for Enabled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Enabled::Always"),
            Self::Never => f.write_str("Enabled::Never"),
            Self::When(_) => f.write_str("Enabled::When(..)"),
        }
    }
}

impl From<bool> for Enabled {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Always } else { Self::Never }
    }
}

/// Encodes non-trivial tool results into a compact textual form before
/// the model sees them.
///
/// Concrete encoders live outside the runtime; an agent configured with
/// one has its object/array tool results passed through
/// [`ResultEncoder::encode`] instead of plain JSON stringification.
pub trait ResultEncoder: Send + Sync {
    /// Encode a structured result for model consumption.
    fn encode(&self, value: &Value) -> String;
}

/// Render a tool result for the message log, honoring an optional encoder.
///
/// Strings pass through unquoted; objects and arrays go through the
/// encoder when one is configured, else compact JSON.
#[must_use]
pub fn render_result(value: &Value, encoder: Option<&dyn ResultEncoder>) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => encoder.map_or_else(
            || value.to_string(),
            |enc| enc.encode(value),
        ),
        other => other.to_string(),
    }
}

/// An invokable capability offered to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name of the tool, unique within an agent.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> String;

    /// The function-calling definition sent to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with JSON arguments.
    async fn call(&self, args: Value, ctx: RunContext) -> ToolResult<Value>;

    /// Whether the tool is offered to the model this turn.
    fn is_enabled(&self, _ctx: &RunContext) -> bool {
        true
    }

    /// Policy deciding whether a call needs human approval.
    fn approval_policy(&self) -> Option<&ApprovalPolicy> {
        None
    }

    /// Static approval metadata for this tool.
    fn approval_metadata(&self) -> Option<&ApprovalMetadata> {
        None
    }
}

type ExecuteFn = dyn Fn(Value, RunContext) -> BoxFuture<'static, ToolResult<Value>> + Send + Sync;

/// A closure-backed [`Tool`].
///
/// This is the everyday way to define tools:
///
/// ```rust,ignore
/// let add = FunctionTool::new(
///     "add",
///     "Add two numbers.",
///     serde_json::json!({
///         "type": "object",
///         "properties": {
///             "a": {"type": "number"},
///             "b": {"type": "number"}
///         },
///         "required": ["a", "b"]
///     }),
///     |args, _ctx| async move {
///         let a = args["a"].as_f64().unwrap_or(0.0);
///         let b = args["b"].as_f64().unwrap_or(0.0);
///         Ok(serde_json::json!(a + b))
///     },
/// );
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    execute: Arc<ExecuteFn>,
    enabled: Enabled,
    needs_approval: Option<ApprovalPolicy>,
    approval_metadata: Option<ApprovalMetadata>,
}

impl FunctionTool {
    /// Create a new tool from a name, description, argument schema, and body.
    #[must_use]
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        execute: F,
    ) -> Self
    where
        F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ToolResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            execute: Arc::new(move |args, ctx| Box::pin(execute(args, ctx))),
            enabled: Enabled::Always,
            needs_approval: None,
            approval_metadata: None,
        }
    }

    /// Create a tool whose argument schema is derived from a Rust type.
    #[must_use]
    pub fn from_type<T, F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        execute: F,
    ) -> Self
    where
        T: schemars::JsonSchema,
        F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ToolResult<Value>> + Send + 'static,
    {
        Self::new(name, description, schema_for::<T>(), execute)
    }

    /// Set the enablement predicate.
    #[must_use]
    pub fn with_enabled(mut self, enabled: impl Into<Enabled>) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Set a dynamic enablement predicate.
    #[must_use]
    pub fn enabled_when(
        mut self,
        predicate: impl Fn(&RunContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.enabled = Enabled::When(Arc::new(predicate));
        self
    }

    /// Require approval according to the given policy.
    #[must_use]
    pub fn with_approval(mut self, policy: ApprovalPolicy) -> Self {
        self.needs_approval = Some(policy);
        self
    }

    /// Attach static approval metadata.
    #[must_use]
    pub fn with_approval_metadata(mut self, metadata: ApprovalMetadata) -> Self {
        self.approval_metadata = Some(metadata);
        self
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("needs_approval", &self.needs_approval.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description, self.parameters.clone())
    }

    async fn call(&self, args: Value, ctx: RunContext) -> ToolResult<Value> {
        (self.execute)(args, ctx).await
    }

    fn is_enabled(&self, ctx: &RunContext) -> bool {
        self.enabled.evaluate(ctx)
    }

    fn approval_policy(&self) -> Option<&ApprovalPolicy> {
        self.needs_approval.as_ref()
    }

    fn approval_metadata(&self) -> Option<&ApprovalMetadata> {
        self.approval_metadata.as_ref()
    }
}

/// Generate a JSON schema for a Rust type, stripped of the `$schema` field.
#[must_use]
pub fn schema_for<T: schemars::JsonSchema>() -> Value {
    let root = schemars::schema_for!(T);
    let mut schema = serde_json::to_value(&root).unwrap_or_default();
    if let Value::Object(ref mut map) = schema {
        map.remove("$schema");
    }
    schema
}

/// Parse tool arguments into a typed value, tolerating stringified JSON.
pub fn parse_args<T: for<'de> Deserialize<'de>>(
    tool_name: &str,
    args: &Value,
) -> ToolResult<T> {
    let parsed = match args {
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| ToolError::invalid_args(tool_name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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

    #[tokio::test]
    async fn function_tool_executes_body() {
        let tool = add_tool();
        let result = tool
            .call(json!({"a": 2, "b": 3}), RunContext::default())
            .await
            .expect("tool should succeed");
        assert_eq!(result, json!(5.0));
    }

    #[test]
    fn definition_serializes_to_function_format() {
        let def = add_tool().definition();
        let wire = serde_json::to_value(&def).expect("serialize");
        assert_eq!(wire["type"], json!("function"));
        assert_eq!(wire["function"]["name"], json!("add"));
        assert!(wire["function"]["parameters"].is_object());
    }

    #[test]
    fn enabled_predicate_reads_context() {
        let tool = add_tool().enabled_when(|ctx| {
            ctx.context_get("math_allowed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        });

        let off = RunContext::new(json!({}));
        assert!(!tool.is_enabled(&off));

        let on = RunContext::new(json!({"math_allowed": true}));
        assert!(tool.is_enabled(&on));
    }

    #[test]
    fn render_result_passes_strings_through() {
        assert_eq!(render_result(&json!("plain"), None), "plain");
        assert_eq!(render_result(&json!({"k": 1}), None), r#"{"k":1}"#);
        assert_eq!(render_result(&json!(7), None), "7");
    }

    #[test]
    fn render_result_uses_encoder_for_structures() {
        struct Upper;
        impl ResultEncoder for Upper {
            fn encode(&self, value: &Value) -> String {
                value.to_string().to_uppercase()
            }
        }
        assert_eq!(
            render_result(&json!({"k": "v"}), Some(&Upper)),
            r#"{"K":"V"}"#
        );
        // Strings bypass the encoder.
        assert_eq!(render_result(&json!("s"), Some(&Upper)), "s");
    }

    #[test]
    fn parse_args_accepts_stringified_json() {
        #[derive(Deserialize)]
        struct Args {
            a: i64,
        }
        let typed: Args = parse_args("add", &json!(r#"{"a": 4}"#)).expect("parse");
        assert_eq!(typed.a, 4);
    }
}
