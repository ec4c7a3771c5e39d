//! Execution polling for dune-poll.
//!
//! Drives one query from submission to a materialized result set. Pending
//! and executing states are waited out; any other state abandons the
//! execution, cancels it remotely and resubmits after a cooldown, up to a
//! bounded number of attempts. Every wait can be interrupted through a
//! `CancellationToken`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dune::{ExecutionId, ExecutionState, QueryRequest, QueryService, ResultSet};
use crate::error::{DuneError, Result};

/// Timing and retry limits for the poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Wait between status checks while the execution is running.
    pub executing_interval: Duration,
    /// Wait between status checks while the execution is queued.
    pub pending_interval: Duration,
    /// Wait after abandoning an execution before resubmitting.
    pub cooldown: Duration,
    /// Growth factor applied to the cooldown after each abandoned attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on any single cooldown.
    pub max_cooldown: Duration,
    /// Maximum number of submissions per run.
    pub max_attempts: u32,
    /// Overall deadline for one run.
    pub timeout: Option<Duration>,
    /// Upper bound on a best-effort remote cancel.
    pub cancel_timeout: Duration,
}

/// Default bound on a remote cancel, including the client's own retries.
const DEFAULT_CANCEL_TIMEOUT_SECS: u64 = 10;

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            executing_interval: Duration::from_secs(15),
            pending_interval: Duration::from_secs(120),
            cooldown: Duration::from_secs(7200),
            backoff_multiplier: 1.0,
            max_cooldown: Duration::from_secs(8 * 3600),
            max_attempts: 3,
            timeout: None,
            cancel_timeout: Duration::from_secs(DEFAULT_CANCEL_TIMEOUT_SECS),
        }
    }
}

impl PollPolicy {
    /// Builds the policy from the `[poll]` and `[retry]` config sections.
    pub fn from_config(config: &Config) -> Self {
        let timeout = match config.poll.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            executing_interval: Duration::from_secs(config.poll.executing_interval_secs),
            pending_interval: Duration::from_secs(config.poll.pending_interval_secs),
            cooldown: Duration::from_secs(config.retry.cooldown_secs),
            backoff_multiplier: config.retry.backoff_multiplier,
            max_cooldown: Duration::from_secs(config.retry.max_cooldown_secs),
            max_attempts: config.retry.max_attempts,
            timeout,
            cancel_timeout: Duration::from_secs(DEFAULT_CANCEL_TIMEOUT_SECS),
        }
    }

    /// Returns the cooldown after the given number of abandoned attempts.
    ///
    /// `cooldown * multiplier^(abandoned - 1)`, capped at `max_cooldown`.
    pub fn cooldown_for(&self, abandoned: u32) -> Duration {
        let exponent = abandoned.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.cooldown.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_cooldown.as_secs_f64() {
            return self.max_cooldown.max(self.cooldown);
        }
        Duration::from_secs_f64(secs)
    }

    /// Sets both polling intervals.
    pub fn with_intervals(mut self, executing: Duration, pending: Duration) -> Self {
        self.executing_interval = executing;
        self.pending_interval = pending;
        self
    }

    /// Sets the cooldown between attempts.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self.max_cooldown = self.max_cooldown.max(cooldown);
        self
    }

    /// Sets the maximum number of submissions.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the overall deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the bound on a remote cancel.
    pub fn with_cancel_timeout(mut self, cancel_timeout: Duration) -> Self {
        self.cancel_timeout = cancel_timeout;
        self
    }
}

/// Why the poller is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The execution is running.
    Executing,
    /// The execution is queued.
    Pending,
    /// Cooling down before resubmitting.
    Cooldown,
}

/// Progress notifications emitted while polling.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A new execution was submitted.
    Submitted { attempt: u32, execution_id: ExecutionId },
    /// A state was observed for the current execution.
    State {
        execution_id: ExecutionId,
        state: ExecutionState,
    },
    /// A wait is starting.
    Waiting { reason: WaitReason, duration: Duration },
    /// The execution hit a non-progress state and was given up on.
    Abandoned {
        execution_id: ExecutionId,
        state: ExecutionState,
    },
    /// Results were fetched.
    Completed {
        execution_id: ExecutionId,
        rows: usize,
    },
}

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The execution completed and its rows were fetched.
    Completed(ResultSet),
    /// The execution reported a non-progress state.
    Abandoned(ExecutionState),
}

/// Deadline for a whole run.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Per-run interruption sources.
struct RunGuard<'a> {
    cancel: &'a CancellationToken,
    deadline: Option<Deadline>,
}

/// Submits a query and polls it to completion.
pub struct Poller {
    service: Arc<dyn QueryService>,
    request: QueryRequest,
    policy: PollPolicy,
    events: Option<mpsc::UnboundedSender<PollEvent>>,
}

impl Poller {
    /// Creates a poller for the given query.
    pub fn new(service: Arc<dyn QueryService>, request: QueryRequest, policy: PollPolicy) -> Self {
        Self {
            service,
            request,
            policy,
            events: None,
        }
    }

    /// Sends progress events to the given channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<PollEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs the query until it completes, giving up after
    /// `policy.max_attempts` abandoned executions.
    ///
    /// Returns `Cancelled` if the token fires and `Timeout` once the
    /// overall deadline passes. Whenever an error ends the run after a
    /// submission, that execution is cancelled remotely.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ResultSet> {
        let guard = RunGuard {
            cancel,
            deadline: self.policy.timeout.map(|limit| Deadline {
                at: Instant::now() + limit,
                limit,
            }),
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_state = None;

        for attempt in 1..=max_attempts {
            let execution_id = self.guarded(&guard, self.service.submit(&self.request)).await?;
            info!(
                "Submitted query {} as execution {} (attempt {} of {}, performance {})",
                self.request.query_id, execution_id, attempt, max_attempts, self.request.performance
            );
            self.emit(PollEvent::Submitted {
                attempt,
                execution_id: execution_id.clone(),
            });

            match self.drive(&execution_id, &guard).await {
                Ok(PollOutcome::Completed(result)) => return Ok(result),
                Ok(PollOutcome::Abandoned(state)) => {
                    warn!(
                        "Execution {} stopped making progress ({}); cancelling",
                        execution_id, state
                    );
                    self.cancel_remote(&execution_id).await;
                    self.emit(PollEvent::Abandoned {
                        execution_id,
                        state: state.clone(),
                    });
                    last_state = Some(state);

                    if attempt < max_attempts {
                        let cooldown = self.policy.cooldown_for(attempt);
                        info!("Query cancelled, trying again in {:?}", cooldown);
                        self.wait(&guard, WaitReason::Cooldown, cooldown).await?;
                    }
                }
                Err(e) => {
                    self.cancel_remote(&execution_id).await;
                    return Err(e);
                }
            }
        }

        Err(DuneError::RetriesExhausted {
            attempts: max_attempts,
            last_state: last_state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Polls one execution from the given state until it completes or is
    /// abandoned.
    ///
    /// Pending and executing states are waited out and the status is
    /// fetched fresh after every wait.
    pub async fn poll_until_complete(
        &self,
        initial_state: ExecutionState,
        execution_id: &ExecutionId,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome> {
        let guard = RunGuard {
            cancel,
            deadline: None,
        };
        self.poll(initial_state, execution_id, &guard).await
    }

    /// Fetches the first status of a fresh execution and polls it.
    async fn drive(&self, execution_id: &ExecutionId, guard: &RunGuard<'_>) -> Result<PollOutcome> {
        let status = self.guarded(guard, self.service.status(execution_id)).await?;
        self.poll(status.state, execution_id, guard).await
    }

    async fn poll(
        &self,
        initial_state: ExecutionState,
        execution_id: &ExecutionId,
        guard: &RunGuard<'_>,
    ) -> Result<PollOutcome> {
        let mut state = initial_state;

        loop {
            self.emit(PollEvent::State {
                execution_id: execution_id.clone(),
                state: state.clone(),
            });

            let reason = match state {
                ExecutionState::Completed => {
                    let results = self.guarded(guard, self.service.results(execution_id)).await?;
                    match (results.state, results.result) {
                        (ExecutionState::Completed, Some(result)) => {
                            info!(
                                "Execution {} completed with {} row(s)",
                                execution_id,
                                result.row_count()
                            );
                            self.emit(PollEvent::Completed {
                                execution_id: execution_id.clone(),
                                rows: result.row_count(),
                            });
                            return Ok(PollOutcome::Completed(result));
                        }
                        (ExecutionState::Completed, None) => {
                            return Err(DuneError::parse(format!(
                                "Execution {} completed without a result payload",
                                execution_id
                            )));
                        }
                        (reported, _) => {
                            debug!(
                                "Results for {} reported {} after completion",
                                execution_id, reported
                            );
                            state = reported;
                            continue;
                        }
                    }
                }
                ExecutionState::Executing => WaitReason::Executing,
                ExecutionState::Pending => WaitReason::Pending,
                ExecutionState::Other(_) => return Ok(PollOutcome::Abandoned(state)),
            };

            let duration = match reason {
                WaitReason::Pending => self.policy.pending_interval,
                _ => self.policy.executing_interval,
            };
            info!("Waiting on query completion: {}", state);
            self.wait(guard, reason, duration).await?;

            state = self
                .guarded(guard, self.service.status(execution_id))
                .await?
                .state;
        }
    }

    /// Best-effort remote cancel, bounded by `policy.cancel_timeout`;
    /// failures are only logged.
    async fn cancel_remote(&self, execution_id: &ExecutionId) {
        let cancel = self.service.cancel(execution_id);
        match tokio::time::timeout(self.policy.cancel_timeout, cancel).await {
            Ok(Ok(true)) => info!("Cancelled execution {}", execution_id),
            Ok(Ok(false)) => warn!("Cancel of execution {} was not acknowledged", execution_id),
            Ok(Err(e)) => warn!("Failed to cancel execution {}: {}", execution_id, e),
            Err(_) => warn!(
                "Cancel of execution {} did not finish within {:?}",
                execution_id, self.policy.cancel_timeout
            ),
        }
    }

    async fn wait(&self, guard: &RunGuard<'_>, reason: WaitReason, duration: Duration) -> Result<()> {
        self.emit(PollEvent::Waiting { reason, duration });
        self.guarded(guard, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Runs a future unless the run is cancelled or its deadline passes first.
    async fn guarded<T>(
        &self,
        guard: &RunGuard<'_>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = async {
            match guard.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline.at).await;
                    deadline.limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = guard.cancel.cancelled() => Err(DuneError::Cancelled),
            limit = deadline => Err(DuneError::Timeout(limit)),
            result = fut => result,
        }
    }

    fn emit(&self, event: PollEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
