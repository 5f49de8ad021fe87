//! Language-model contract.
//!
//! The runtime never talks to a provider wire format; it drives any
//! implementation of [`ModelProvider`]. Concrete HTTP providers live in
//! separate crates — this module carries the request/response types, the
//! streaming chunk type, the process-wide default-model slot, and a
//! scripted [`MockModel`] for tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Message, ToolCall};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// Sampling settings forwarded to the model on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Presence penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Frequency penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

/// One model invocation as issued by the runner.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// Resolved system instructions.
    pub system: String,
    /// Conversation messages for this turn.
    pub messages: Vec<Message>,
    /// Tool definitions offered to the model (schemas only).
    pub tools: Vec<ToolDefinition>,
    /// Sampling settings.
    pub settings: ModelSettings,
}

/// Why the model (or the runner) stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    #[default]
    Stop,
    /// Token limit reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// Content was filtered.
    ContentFilter,
    /// The run paused for approval decisions (runner-assigned).
    Interrupted,
}

impl FinishReason {
    /// String representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether a text response with this reason finalizes the run.
    #[must_use]
    pub const fn finalizes(&self) -> bool {
        matches!(self, Self::Stop | Self::Length | Self::ContentFilter)
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete model response for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Text content, if any.
    pub text: Option<String>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCall>,
    /// New messages produced by the model (normally one assistant message).
    pub messages: Vec<Message>,
    /// Token usage for this call.
    pub usage: Usage,
}

impl ModelResponse {
    /// A plain text response (`finish_reason = stop`).
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            text: Some(content.clone()),
            finish_reason: FinishReason::Stop,
            tool_calls: Vec::new(),
            messages: vec![Message::assistant(content)],
            usage: Usage::zero(),
        }
    }

    /// A tool-call response (`finish_reason = tool_calls`).
    #[must_use]
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            finish_reason: FinishReason::ToolCalls,
            tool_calls: calls.clone(),
            messages: vec![Message::assistant_with_tool_calls("", calls)],
            usage: Usage::zero(),
        }
    }

    /// Override the finish reason.
    #[must_use]
    pub const fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    /// Attach token usage.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Incremental output from a streaming model call.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A text fragment.
    TextDelta(String),
    /// A complete tool call.
    ToolCall(ToolCall),
    /// Terminal chunk carrying the aggregated response.
    Finish(Box<ModelResponse>),
}

/// A boxed stream of model chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// The contract every language model backend implements.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Identifier of the underlying model, for spans and metrics.
    fn model_id(&self) -> &str {
        "unknown"
    }

    /// Produce a complete response for the request.
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Produce a streaming response.
    ///
    /// The default implementation degrades to [`generate`](Self::generate)
    /// and yields the text as a single delta followed by the terminal
    /// chunk, so every provider is streamable.
    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream> {
        let response = self.generate(request).await?;
        let mut chunks: Vec<Result<StreamChunk>> = Vec::new();
        if let Some(ref text) = response.text {
            if !text.is_empty() {
                chunks.push(Ok(StreamChunk::TextDelta(text.clone())));
            }
        }
        for call in &response.tool_calls {
            chunks.push(Ok(StreamChunk::ToolCall(call.clone())));
        }
        chunks.push(Ok(StreamChunk::Finish(Box::new(response))));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

static DEFAULT_MODEL: OnceLock<RwLock<Option<Arc<dyn ModelProvider>>>> = OnceLock::new();

fn default_slot() -> &'static RwLock<Option<Arc<dyn ModelProvider>>> {
    DEFAULT_MODEL.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide default model (write-last-wins).
///
/// Agents without an explicit model fall back to this slot.
pub fn set_default_model(model: Arc<dyn ModelProvider>) {
    if let Ok(mut slot) = default_slot().write() {
        *slot = Some(model);
    }
}

/// The current default model, if one is installed.
#[must_use]
pub fn default_model() -> Option<Arc<dyn ModelProvider>> {
    default_slot().read().ok().and_then(|slot| slot.clone())
}

/// Resolve an agent's model or fall back to the default slot.
pub(crate) fn resolve_model(
    explicit: Option<&Arc<dyn ModelProvider>>,
    agent_name: &str,
) -> Result<Arc<dyn ModelProvider>> {
    explicit
        .cloned()
        .or_else(default_model)
        .ok_or_else(|| {
            Error::config(format!(
                "agent '{agent_name}' has no model and no default model is set"
            ))
        })
}

/// A scripted model for tests.
///
/// Returns its responses in sequence, cycling once exhausted. An optional
/// latency is awaited before each response to exercise timing-sensitive
/// paths.
#[derive(Debug)]
pub struct MockModel {
    model_id: String,
    responses: Vec<ModelResponse>,
    latency: Option<Duration>,
    index: AtomicUsize,
}

impl MockModel {
    /// Create a mock model from a response script.
    #[must_use]
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            model_id: "mock-model".to_owned(),
            responses,
            latency: None,
            index: AtomicUsize::new(0),
        }
    }

    /// Set a custom model id.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Await this latency before producing each response.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl ModelProvider for MockModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, _request: &ModelRequest) -> Result<ModelResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.responses.is_empty() {
            return Err(Error::model("mock model has no scripted responses"));
        }
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        Ok(self.responses[index % self.responses.len()].clone())
    }
}
