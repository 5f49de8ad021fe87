//! Session persistence contract.
//!
//! A session stores conversation history across runs. The runner loads
//! history before the first turn (inserting it ahead of the caller's new
//! input) and writes back only on successful finalization — interrupted
//! and failed runs leave the session untouched.
//!
//! Durable backends (Redis, document stores) live outside the runtime;
//! [`InMemorySession`] covers tests and single-process use.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;

/// Conversation persistence across runs.
#[async_trait]
pub trait Session: Send + Sync {
    /// Load the stored conversation history.
    async fn get_history(&self) -> Result<Vec<Message>>;

    /// Append messages to the stored history.
    async fn add_messages(&self, messages: &[Message]) -> Result<()>;

    /// Drop all stored history.
    async fn clear(&self) -> Result<()>;

    /// Read the session metadata object.
    async fn get_metadata(&self) -> Result<Value>;

    /// Merge a partial object into the session metadata.
    async fn update_metadata(&self, partial: Value) -> Result<()>;
}

/// A shared, dynamically dispatched session.
pub type BoxedSession = Arc<dyn Session>;

#[derive(Debug, Default)]
struct SessionData {
    messages: Vec<Message>,
    metadata: Value,
}

/// Process-local session backed by a mutex-guarded message list.
#[derive(Debug, Default)]
pub struct InMemorySession {
    data: Mutex<SessionData>,
}

impl InMemorySession {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SessionData>> {
        self.data
            .lock()
            .map_err(|_| crate::error::Error::session("session lock poisoned"))
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn get_history(&self) -> Result<Vec<Message>> {
        Ok(self.lock()?.messages.clone())
    }

    async fn add_messages(&self, messages: &[Message]) -> Result<()> {
        self.lock()?.messages.extend_from_slice(messages);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut data = self.lock()?;
        data.messages.clear();
        data.metadata = Value::Null;
        Ok(())
    }

    async fn get_metadata(&self) -> Result<Value> {
        Ok(self.lock()?.metadata.clone())
    }

    async fn update_metadata(&self, partial: Value) -> Result<()> {
        let mut data = self.lock()?;
        match (&mut data.metadata, partial) {
            (Value::Object(existing), Value::Object(updates)) => {
                for (key, value) in updates {
                    existing.insert(key, value);
                }
            }
            (slot, value) => *slot = value,
        }
        Ok(())
    }
}
