//! Multi-agent coordination primitives: [`race`], [`parallel`], [`judge`].
//!
//! Each fan-out branch is an independent run with its own [`RunState`]
//! and its own ambient span stack, so branches never share mutable
//! state. Losers of a race are cancelled cooperatively by dropping
//! their futures.
//!
//! [`RunState`]: crate::state::RunState

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, select_all};
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::result::RunResult;
use crate::runner::{RunConfig, Runner};
use crate::telemetry;

/// Options for [`race`].
#[derive(Debug, Clone, Default)]
pub struct RaceOptions {
    /// Coarse run-level timeout for the whole race.
    pub timeout_ms: Option<u64>,
    /// Configuration applied to every participant's run.
    pub config: RunConfig,
}

/// Outcome of a [`race`].
#[derive(Debug)]
pub struct RaceOutcome {
    /// The winner's run result.
    pub result: RunResult,
    /// Name of the winning agent.
    pub winning_agent: String,
    /// Every participant, in input order.
    pub participant_agents: Vec<String>,
}

/// Run every agent on the same input; first success wins.
///
/// Losing runs are cancelled cooperatively (their futures are dropped).
/// If a `timeout_ms` is configured the race rejects with
/// [`Error::Timeout`]; if every participant fails the race rejects with
/// [`Error::AgentsFailed`] listing each failure.
pub async fn race(
    agents: Vec<Arc<Agent>>,
    input: impl Into<String>,
    options: RaceOptions,
) -> Result<RaceOutcome> {
    if agents.is_empty() {
        return Err(Error::config("race requires at least one agent"));
    }
    let input = input.into();
    let participant_agents: Vec<String> =
        agents.iter().map(|a| a.name().to_owned()).collect();

    info!(participants = ?participant_agents, "race started");

    let contest = run_race(agents, input, &options.config);
    match options.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), contest).await {
            Ok(outcome) => finish_race(outcome, participant_agents),
            Err(_) => Err(Error::Timeout { ms }),
        },
        None => finish_race(contest.await, participant_agents),
    }
}

async fn run_race(
    agents: Vec<Arc<Agent>>,
    input: String,
    config: &RunConfig,
) -> std::result::Result<(String, RunResult), Vec<(String, String)>> {
    let mut remaining: Vec<BoxFuture<'_, (String, Result<RunResult>)>> = agents
        .iter()
        .map(|agent| {
            let agent = Arc::clone(agent);
            let input = input.clone();
            let config = config.clone();
            let name = agent.name().to_owned();
            Box::pin(telemetry::scoped_fresh(async move {
                (name, Runner::run(agent, input, config).await)
            })) as BoxFuture<'_, _>
        })
        .collect();

    let mut failures: Vec<(String, String)> = Vec::new();
    while !remaining.is_empty() {
        let ((name, outcome), _, rest) = select_all(remaining).await;
        match outcome {
            Ok(result) => return Ok((name, result)),
            Err(e) => {
                warn!(agent = %name, error = %e, "race participant failed");
                failures.push((name, e.to_string()));
                remaining = rest;
            }
        }
    }
    Err(failures)
}

fn finish_race(
    outcome: std::result::Result<(String, RunResult), Vec<(String, String)>>,
    participant_agents: Vec<String>,
) -> Result<RaceOutcome> {
    match outcome {
        Ok((winning_agent, result)) => {
            info!(winner = %winning_agent, "race won");
            Ok(RaceOutcome {
                result,
                winning_agent,
                participant_agents,
            })
        }
        Err(failures) => Err(Error::AgentsFailed { failures }),
    }
}

/// Input to [`parallel`]: one shared input, or one input per agent.
#[derive(Debug, Clone)]
pub enum ParallelInput {
    /// Every agent receives the same input.
    Shared(String),
    /// `inputs[i]` goes to `agents[i]`; lengths must match.
    PerAgent(Vec<String>),
}

impl From<&str> for ParallelInput {
    fn from(input: &str) -> Self {
        Self::Shared(input.to_owned())
    }
}

impl From<String> for ParallelInput {
    fn from(input: String) -> Self {
        Self::Shared(input)
    }
}

impl From<Vec<String>> for ParallelInput {
    fn from(inputs: Vec<String>) -> Self {
        Self::PerAgent(inputs)
    }
}

/// Aggregation function applied over the successful results.
pub type Aggregator = Arc<dyn Fn(&[RunResult]) -> Value + Send + Sync>;

/// Options for [`parallel`].
#[derive(Clone, Default)]
pub struct ParallelOptions {
    /// Reject on the first failure instead of partitioning.
    pub fail_fast: bool,
    /// Optional aggregation over the successful results.
    pub aggregator: Option<Aggregator>,
    /// Configuration applied to every run.
    pub config: RunConfig,
}

impl fmt::Debug for ParallelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelOptions")
            .field("fail_fast", &self.fail_fast)
            .field("has_aggregator", &self.aggregator.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a [`parallel`] fan-out.
#[derive(Debug)]
pub struct ParallelOutcome {
    /// Successful results, in agent order.
    pub results: Vec<RunResult>,
    /// Aggregated value, when an aggregator was supplied.
    pub aggregated: Option<Value>,
    /// `(agent_name, error message)` per failed run.
    pub failed_agents: Vec<(String, String)>,
    /// Wall-clock duration of the whole fan-out.
    pub total_duration_ms: u64,
}

/// Run every agent in parallel and wait for all to settle.
///
/// A per-agent input sequence must match the agent count; the mismatch
/// is a [`Error::Config`] raised before any model invocation.
pub async fn parallel(
    agents: Vec<Arc<Agent>>,
    input: impl Into<ParallelInput>,
    options: ParallelOptions,
) -> Result<ParallelOutcome> {
    let input = input.into();
    let inputs: Vec<String> = match input {
        ParallelInput::Shared(input) => vec![input; agents.len()],
        ParallelInput::PerAgent(inputs) => {
            if inputs.len() != agents.len() {
                return Err(Error::config(format!(
                    "parallel expects {} inputs, got {}",
                    agents.len(),
                    inputs.len()
                )));
            }
            inputs
        }
    };

    let started = Instant::now();
    let futures: Vec<_> = agents
        .iter()
        .zip(inputs)
        .map(|(agent, input)| {
            let agent = Arc::clone(agent);
            let config = options.config.clone();
            let name = agent.name().to_owned();
            telemetry::scoped_fresh(async move {
                (name, Runner::run(agent, input, config).await)
            })
        })
        .collect();

    let settled = futures::future::join_all(futures).await;
    let total_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut results = Vec::new();
    let mut failed_agents = Vec::new();
    for (name, outcome) in settled {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(agent = %name, error = %e, "parallel run failed");
                failed_agents.push((name, e.to_string()));
            }
        }
    }

    if options.fail_fast && !failed_agents.is_empty() {
        return Err(Error::AgentsFailed {
            failures: failed_agents,
        });
    }

    let aggregated = options
        .aggregator
        .as_ref()
        .map(|aggregate| aggregate(&results));

    Ok(ParallelOutcome {
        results,
        aggregated,
        failed_agents,
        total_duration_ms,
    })
}

/// Outcome of a [`judge`] evaluation.
#[derive(Debug)]
pub struct JudgeOutcome {
    /// The judge's run result.
    pub result: RunResult,
    /// Every successful worker's result, in worker order.
    pub worker_results: Vec<RunResult>,
    /// `(agent_name, error message)` per failed worker.
    pub failed_workers: Vec<(String, String)>,
}

/// Fan the input out to workers, then have a judge evaluate their
/// labeled outputs.
///
/// Worker failures partition like plain [`parallel`]: the judge
/// evaluates whatever outputs survived. Only when every worker fails
/// is there nothing to judge and the call rejects with
/// [`Error::AgentsFailed`].
pub async fn judge(
    workers: Vec<Arc<Agent>>,
    judge: Arc<Agent>,
    input: impl Into<String>,
    config: RunConfig,
) -> Result<JudgeOutcome> {
    if workers.is_empty() {
        return Err(Error::config("judge requires at least one worker"));
    }
    let input = input.into();

    let outcome = parallel(
        workers,
        input.clone(),
        ParallelOptions {
            fail_fast: false,
            aggregator: None,
            config: config.clone(),
        },
    )
    .await?;

    if outcome.results.is_empty() {
        return Err(Error::AgentsFailed {
            failures: outcome.failed_agents,
        });
    }
    if !outcome.failed_agents.is_empty() {
        warn!(failed = ?outcome.failed_agents, "judging surviving worker outputs only");
    }

    let mut prompt = format!("Task: {input}\n\nCandidate outputs:\n");
    for (index, result) in outcome.results.iter().enumerate() {
        let name = result
            .metadata
            .handoff_chain
            .first()
            .map_or("worker", String::as_str);
        prompt.push_str(&format!(
            "\n[{label}] {name}:\n{output}\n",
            label = index + 1,
            output = result.final_output_text(),
        ));
    }
    prompt.push_str("\nEvaluate the candidates and produce the best final answer.");

    let result = Runner::run(judge, prompt, config).await?;
    Ok(JudgeOutcome {
        result,
        worker_results: outcome.results,
        failed_workers: outcome.failed_agents,
    })
}
