//! Per-run context handed to tools, guardrails, and approval policies.
//!
//! [`RunContext`] is the runtime's view into a run that extension points
//! are allowed to see: the user-supplied dependency object, the current
//! agent, a snapshot of the conversation, and the live run-wide usage
//! accumulator. Clones share the context object and the usage counter;
//! the message snapshot is taken when the context is handed out.
//!
//! Receivers must not retain the context (or clones of it) beyond the
//! call they received it for.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::message::Message;
use crate::usage::Usage;

/// Context wrapper passed to tools, guardrails, instruction functions,
/// and approval policies during a run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// User-supplied dependency object. Shared and mutable: tools own it.
    context: Arc<Mutex<Value>>,
    /// Live run-wide usage accumulator.
    usage: Arc<Mutex<Usage>>,
    /// Name of the currently active agent.
    agent_name: String,
    /// Current turn number (1-indexed during execution, 0 before start).
    turn: usize,
    /// Snapshot of the conversation at hand-out time.
    messages: Vec<Message>,
}

impl RunContext {
    /// Create a new context around a user dependency object.
    #[must_use]
    pub fn new(context: Value) -> Self {
        Self {
            context: Arc::new(Mutex::new(context)),
            ..Self::default()
        }
    }

    /// Construct a context sharing existing state cells.
    pub(crate) fn from_shared(context: Arc<Mutex<Value>>, usage: Arc<Mutex<Usage>>) -> Self {
        Self {
            context,
            usage,
            ..Self::default()
        }
    }

    /// Set the active agent name.
    #[must_use]
    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    /// Set the current turn number.
    #[must_use]
    pub const fn with_turn(mut self, turn: usize) -> Self {
        self.turn = turn;
        self
    }

    /// Set the conversation snapshot.
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Name of the currently active agent.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Current turn number.
    #[must_use]
    pub const fn turn(&self) -> usize {
        self.turn
    }

    /// Conversation snapshot taken when this context was handed out.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// A clone of the user dependency object.
    #[must_use]
    pub fn context(&self) -> Value {
        self.context.lock().map(|v| v.clone()).unwrap_or(Value::Null)
    }

    /// Read a top-level key from the dependency object.
    #[must_use]
    pub fn context_get(&self, key: &str) -> Option<Value> {
        self.context
            .lock()
            .ok()
            .and_then(|v| v.get(key).cloned())
    }

    /// Resolve a JSON pointer (`/user/roles`) into the dependency object.
    #[must_use]
    pub fn context_pointer(&self, pointer: &str) -> Option<Value> {
        self.context
            .lock()
            .ok()
            .and_then(|v| v.pointer(pointer).cloned())
    }

    /// Set a top-level key on the dependency object.
    ///
    /// If the object is not a JSON object it is replaced by one first.
    pub fn context_set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut guard) = self.context.lock() {
            if !guard.is_object() {
                *guard = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = guard.as_object_mut() {
                map.insert(key.into(), value);
            }
        }
    }

    /// Current run-wide usage totals.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }

    /// Charge token usage into the run-wide accumulator.
    ///
    /// Guardrails and tools that spend model tokens must route the cost
    /// through here so the run totals stay authoritative.
    pub fn add_usage(&self, usage: Usage) {
        if let Ok(mut guard) = self.usage.lock() {
            *guard += usage;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_context_mutations() {
        let ctx = RunContext::new(json!({"count": 1}));
        let clone = ctx.clone();
        clone.context_set("count", json!(2));
        assert_eq!(ctx.context_get("count"), Some(json!(2)));
    }

    #[test]
    fn context_set_replaces_non_objects() {
        let ctx = RunContext::new(Value::Null);
        ctx.context_set("k", json!("v"));
        assert_eq!(ctx.context_get("k"), Some(json!("v")));
    }

    #[test]
    fn usage_accumulates_across_clones() {
        let ctx = RunContext::new(Value::Null);
        let clone = ctx.clone();
        ctx.add_usage(Usage::new(10, 5));
        clone.add_usage(Usage::new(1, 1));
        assert_eq!(ctx.usage(), Usage::new(11, 6));
    }

    #[test]
    fn pointer_reads_nested_values() {
        let ctx = RunContext::new(json!({"user": {"roles": ["admin"]}}));
        assert_eq!(
            ctx.context_pointer("/user/roles"),
            Some(json!(["admin"]))
        );
    }
}
