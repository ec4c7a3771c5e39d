//! Scripted query service for testing.
//!
//! Each submission consumes the next scripted execution; status calls walk
//! through that execution's states and every call is recorded. Results calls
//! echo the current state unless a results response has been scripted.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::dune::types::{
    ExecutionId, ExecutionResults, ExecutionState, ExecutionStatus, QueryRequest, ResultSet, Row,
};
use crate::dune::QueryService;
use crate::error::{DuneError, Result};

/// A call made against the scripted service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    Submit(QueryRequest),
    Status(ExecutionId),
    Results(ExecutionId),
    Cancel(ExecutionId),
}

#[derive(Debug, Clone)]
enum Step {
    State(ExecutionState),
    Error { status: u16, message: String },
}

#[derive(Debug, Clone)]
struct ResultsStep {
    state: ExecutionState,
    with_rows: bool,
}

/// Script for one execution.
///
/// Status calls return the steps in order and keep repeating the last one.
#[derive(Debug, Clone)]
pub struct ScriptedExecution {
    steps: VecDeque<Step>,
    results: VecDeque<ResultsStep>,
    result: ResultSet,
}

impl ScriptedExecution {
    /// Creates an execution reporting the given states in order.
    pub fn new(states: impl IntoIterator<Item = ExecutionState>) -> Self {
        Self {
            steps: states.into_iter().map(Step::State).collect(),
            results: VecDeque::new(),
            result: ResultSet::default(),
        }
    }

    /// Creates an execution that is already completed with the given rows.
    pub fn completed(rows: Vec<Row>) -> Self {
        Self::new([ExecutionState::Completed]).with_rows(rows)
    }

    /// Creates an execution whose first status is a failure state.
    pub fn failed() -> Self {
        Self::new([ExecutionState::Other("QUERY_STATE_FAILED".to_string())])
    }

    /// Sets the rows returned once the execution has completed.
    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.result = ResultSet::new(Vec::new(), rows);
        self
    }

    /// Queues a results response reporting `state`, carrying the rows only
    /// when `with_rows` is set. Queued responses are used in order before
    /// results calls fall back to echoing the current state.
    pub fn then_results(mut self, state: ExecutionState, with_rows: bool) -> Self {
        self.results.push_back(ResultsStep { state, with_rows });
        self
    }

    /// Appends a status call that fails with an API error.
    pub fn then_error(mut self, status: u16, message: impl Into<String>) -> Self {
        self.steps.push_back(Step::Error {
            status,
            message: message.into(),
        });
        self
    }
}

#[derive(Debug)]
struct ActiveExecution {
    id: ExecutionId,
    script: ScriptedExecution,
    current: Option<ExecutionState>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<ScriptedExecution>,
    active: Vec<ActiveExecution>,
    calls: Vec<ServiceCall>,
    submitted: usize,
}

/// Query service that replays scripted executions.
#[derive(Debug)]
pub struct ScriptedQueryService {
    inner: Mutex<Inner>,
    cancel_acknowledged: bool,
    cancel_stalls: bool,
}

impl ScriptedQueryService {
    /// Creates a service with no scripted executions.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cancel_acknowledged: true,
            cancel_stalls: false,
        }
    }

    /// Queues an execution for the next submission.
    pub fn with_execution(self, execution: ScriptedExecution) -> Self {
        self.lock().pending.push_back(execution);
        self
    }

    /// Makes cancel calls report that the service did not acknowledge them.
    pub fn rejecting_cancels(mut self) -> Self {
        self.cancel_acknowledged = false;
        self
    }

    /// Makes cancel calls record themselves and then never return.
    pub fn stalling_cancels(mut self) -> Self {
        self.cancel_stalls = true;
        self
    }

    /// Returns every call made so far, in order.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.lock().calls.clone()
    }

    /// Returns the ids handed out by `submit`, in order.
    pub fn submitted_ids(&self) -> Vec<ExecutionId> {
        self.lock().active.iter().map(|a| a.id.clone()).collect()
    }

    /// Counts calls matching the predicate.
    pub fn count_calls(&self, predicate: impl Fn(&ServiceCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the calls from the others.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedQueryService {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn execution(&mut self, id: &ExecutionId) -> Result<&mut ActiveExecution> {
        self.active
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or_else(|| DuneError::api(404, format!("Unknown execution {}", id)))
    }
}

#[async_trait]
impl QueryService for ScriptedQueryService {
    async fn submit(&self, request: &QueryRequest) -> Result<ExecutionId> {
        let mut inner = self.lock();
        inner.calls.push(ServiceCall::Submit(request.clone()));

        let script = inner
            .pending
            .pop_front()
            .ok_or_else(|| DuneError::internal("No scripted execution left to submit"))?;
        inner.submitted += 1;
        let id = ExecutionId::new(format!("exec-{}", inner.submitted));

        inner.active.push(ActiveExecution {
            id: id.clone(),
            script,
            current: None,
        });
        Ok(id)
    }

    async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatus> {
        let mut inner = self.lock();
        inner.calls.push(ServiceCall::Status(id.clone()));

        let execution = inner.execution(id)?;
        let step = if execution.script.steps.len() > 1 {
            execution.script.steps.pop_front()
        } else {
            execution.script.steps.front().cloned()
        };

        match step {
            Some(Step::State(state)) => {
                execution.current = Some(state.clone());
                Ok(ExecutionStatus {
                    execution_id: id.clone(),
                    state,
                })
            }
            Some(Step::Error { status, message }) => Err(DuneError::api(status, message)),
            None => Err(DuneError::internal("Scripted execution has no states")),
        }
    }

    async fn results(&self, id: &ExecutionId) -> Result<ExecutionResults> {
        let mut inner = self.lock();
        inner.calls.push(ServiceCall::Results(id.clone()));

        let execution = inner.execution(id)?;
        let (state, result) = match execution.script.results.pop_front() {
            Some(step) => {
                let result = step.with_rows.then(|| execution.script.result.clone());
                (step.state, result)
            }
            None => {
                let state = execution
                    .current
                    .clone()
                    .unwrap_or(ExecutionState::Pending);
                let result = state
                    .is_completed()
                    .then(|| execution.script.result.clone());
                (state, result)
            }
        };

        Ok(ExecutionResults {
            execution_id: id.clone(),
            state,
            result,
        })
    }

    async fn cancel(&self, id: &ExecutionId) -> Result<bool> {
        {
            let mut inner = self.lock();
            inner.calls.push(ServiceCall::Cancel(id.clone()));

            let execution = inner.execution(id)?;
            if self.cancel_acknowledged && !self.cancel_stalls {
                execution.current =
                    Some(ExecutionState::Other("QUERY_STATE_CANCELLED".to_string()));
            }
        }

        if self.cancel_stalls {
            std::future::pending::<()>().await;
        }
        Ok(self.cancel_acknowledged)
    }
}
