//! Query service integration for dune-poll.
//!
//! Provides the capability trait the poller drives, an HTTP implementation
//! for the Dune API and a scripted implementation for tests.

pub mod client;
pub mod mock;
pub mod types;

pub use client::{DuneClient, DuneClientConfig};
pub use mock::{ScriptedExecution, ScriptedQueryService, ServiceCall};
pub use types::{
    ExecutionId, ExecutionResults, ExecutionState, ExecutionStatus, PerformanceTier, QueryRequest,
    ResultSet, Row,
};

use async_trait::async_trait;

use crate::error::Result;

/// Remote service that executes saved queries asynchronously.
///
/// Status and result retrieval are separate capabilities even where the
/// backing API reports the state from both endpoints.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Starts a new execution of the query and returns its handle.
    async fn submit(&self, request: &QueryRequest) -> Result<ExecutionId>;

    /// Fetches the current state of an execution.
    async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatus>;

    /// Fetches the results of an execution, if it has completed.
    async fn results(&self, id: &ExecutionId) -> Result<ExecutionResults>;

    /// Asks the service to stop an execution.
    ///
    /// Returns whether the service acknowledged the cancellation.
    async fn cancel(&self, id: &ExecutionId) -> Result<bool>;
}
