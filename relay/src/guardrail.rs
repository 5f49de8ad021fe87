//! Guardrail gate — input/output validators that can veto a run.
//!
//! Input guardrails validate the most recent user message before the
//! first model call; output guardrails validate the finalized output
//! string. Each gate fans its guardrails out concurrently, lets every
//! check complete so its metadata can be recorded, and then raises
//! [`Error::GuardrailTripwire`](crate::error::Error) for the first
//! rejection in guardrail position order.
//!
//! Guardrails may consult the run context and may themselves call a
//! model (e.g. an LM-backed safety check); token costs they incur must
//! be charged through [`RunContext::add_usage`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::message::{Message, Role};

/// Which gate a guardrail belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailKind {
    /// Validates the user input before the first model call.
    Input,
    /// Validates the finalized output string.
    Output,
}

impl fmt::Display for GuardrailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// The verdict returned by a guardrail check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    /// Whether the content passed.
    pub passed: bool,
    /// Rejection message, surfaced in the tripwire error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured diagnostics recorded for observability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl GuardrailVerdict {
    /// A passing verdict.
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            message: None,
            metadata: None,
        }
    }

    /// A rejecting verdict with a message.
    #[must_use]
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            metadata: None,
        }
    }

    /// Attach diagnostic metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Validation logic for a guardrail.
#[async_trait]
pub trait GuardrailCheck: Send + Sync {
    /// Check the content and return a verdict.
    ///
    /// For input guardrails `content` is the most recent user message's
    /// text; for output guardrails it is the finalized output string.
    async fn check(&self, content: &str, ctx: &RunContext) -> Result<GuardrailVerdict>;
}

/// A named input or output validator attached to an agent.
#[derive(Clone)]
pub struct Guardrail {
    name: String,
    kind: GuardrailKind,
    check: Arc<dyn GuardrailCheck>,
}

impl Guardrail {
    /// Create an input guardrail.
    #[must_use]
    pub fn input(name: impl Into<String>, check: impl GuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            kind: GuardrailKind::Input,
            check: Arc::new(check),
        }
    }

    /// Create an output guardrail.
    #[must_use]
    pub fn output(name: impl Into<String>, check: impl GuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            kind: GuardrailKind::Output,
            check: Arc::new(check),
        }
    }

    /// Create an input guardrail from a synchronous predicate.
    ///
    /// The predicate returns `None` to pass or `Some(message)` to reject.
    #[must_use]
    pub fn input_fn<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::input(name, FnCheck(predicate))
    }

    /// Create an output guardrail from a synchronous predicate.
    #[must_use]
    pub fn output_fn<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::output(name, FnCheck(predicate))
    }

    /// The guardrail's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which gate this guardrail belongs to.
    #[must_use]
    pub const fn kind(&self) -> GuardrailKind {
        self.kind
    }

    /// Run the check against content.
    pub async fn run(&self, content: &str, ctx: &RunContext) -> Result<GuardrailVerdict> {
        self.check.check(content, ctx).await
    }
}

impl fmt::Debug for Guardrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guardrail")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct FnCheck<F>(F);

#[async_trait]
impl<F> GuardrailCheck for FnCheck<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    async fn check(&self, content: &str, _ctx: &RunContext) -> Result<GuardrailVerdict> {
        Ok((self.0)(content).map_or_else(GuardrailVerdict::pass, GuardrailVerdict::reject))
    }
}

/// Split an agent's guardrails into input and output groups.
#[must_use]
pub fn partition(guardrails: &[Guardrail]) -> (Vec<&Guardrail>, Vec<&Guardrail>) {
    guardrails
        .iter()
        .partition(|g| g.kind == GuardrailKind::Input)
}

/// Run the input gate over the most recent user message.
///
/// All input guardrails are evaluated concurrently; every evaluation
/// completes before verdicts are inspected so diagnostics are not lost.
/// The first rejection or check error, by guardrail position, raises a
/// tripwire. Input with non-string content skips the gate.
pub async fn run_input_gate(
    guardrails: &[&Guardrail],
    messages: &[Message],
    ctx: &RunContext,
) -> Result<()> {
    if guardrails.is_empty() {
        return Ok(());
    }
    let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) else {
        return Ok(());
    };
    if !last_user.content.is_text() {
        debug!("input gate skipped: user content is structured");
        return Ok(());
    }
    let content = last_user.text();
    run_gate(guardrails, &content, ctx, GuardrailKind::Input).await
}

/// Run the output gate over the finalized output string.
pub async fn run_output_gate(
    guardrails: &[&Guardrail],
    output: &str,
    ctx: &RunContext,
) -> Result<()> {
    if guardrails.is_empty() {
        return Ok(());
    }
    run_gate(guardrails, output, ctx, GuardrailKind::Output).await
}

async fn run_gate(
    guardrails: &[&Guardrail],
    content: &str,
    ctx: &RunContext,
    phase: GuardrailKind,
) -> Result<()> {
    let futures: Vec<_> = guardrails.iter().map(|g| g.run(content, ctx)).collect();
    let verdicts = futures::future::join_all(futures).await;

    for (guardrail, verdict) in guardrails.iter().zip(verdicts) {
        match verdict {
            Ok(v) if v.passed => {}
            Ok(v) => {
                return Err(Error::guardrail(
                    guardrail.name(),
                    phase,
                    v.message.unwrap_or_else(|| "content rejected".to_owned()),
                ));
            }
            Err(e) => {
                return Err(Error::guardrail(guardrail.name(), phase, e.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_word(name: &str, word: &'static str) -> Guardrail {
        Guardrail::input_fn(name, move |content| {
            content
                .contains(word)
                .then(|| format!("blocked term: {word}"))
        })
    }

    #[tokio::test]
    async fn passing_gate_returns_ok() {
        let guard = block_word("profanity", "badword");
        let guards = vec![&guard];
        let messages = vec![Message::user("all clean")];
        let ctx = RunContext::default();
        assert!(run_input_gate(&guards, &messages, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn rejection_names_the_guardrail_and_phase() {
        let guard = block_word("profanity", "badword");
        let guards = vec![&guard];
        let messages = vec![Message::user("please include badword")];
        let ctx = RunContext::default();

        let err = run_input_gate(&guards, &messages, &ctx)
            .await
            .expect_err("gate should trip");
        match err {
            Error::GuardrailTripwire {
                guardrail_name,
                phase,
                ..
            } => {
                assert_eq!(guardrail_name, "profanity");
                assert_eq!(phase, GuardrailKind::Input);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn first_failure_by_position_wins() {
        let early = block_word("early", "x");
        let late = block_word("late", "x");
        let guards = vec![&early, &late];
        let messages = vec![Message::user("x marks the spot")];
        let ctx = RunContext::default();

        let err = run_input_gate(&guards, &messages, &ctx)
            .await
            .expect_err("gate should trip");
        assert!(err.to_string().contains("'early'"));
    }

    #[tokio::test]
    async fn output_gate_checks_final_string() {
        let guard = Guardrail::output_fn("no-pii", |content| {
            content.contains("ssn:").then(|| "PII detected".to_owned())
        });
        let guards = vec![&guard];
        let ctx = RunContext::default();
        assert!(run_output_gate(&guards, "the answer is 5", &ctx).await.is_ok());
        assert!(run_output_gate(&guards, "ssn: 123", &ctx).await.is_err());
    }

    #[test]
    fn partition_splits_by_kind() {
        let guards = vec![
            Guardrail::input_fn("a", |_| None),
            Guardrail::output_fn("b", |_| None),
            Guardrail::input_fn("c", |_| None),
        ];
        let (input, output) = partition(&guards);
        assert_eq!(input.len(), 2);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].name(), "b");
    }
}
