//! Token usage accounting.
//!
//! [`Usage`] is a plain additive counter carried through every layer of a
//! run: the model reports per-call usage, the run state accumulates
//! run-wide totals, and per-agent metrics accumulate each agent's share.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token usage statistics for one model call or an accumulated total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input/prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,

    /// Number of tokens in the output/completion.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,

    /// Total tokens used (input + output).
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Create a new usage record. The total is derived.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Create an empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        }
    }

    /// Merge another usage record into this one.
    pub const fn add(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    /// Check if no tokens have been recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        Self::add(&mut self, other);
        self
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.add(other);
    }
}
