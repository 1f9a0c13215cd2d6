use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// External task scheduler that actually runs tasks.
///
/// Progress is reported back asynchronously as [`TaskProgress`] messages,
/// not through these calls.
pub trait TaskScheduler: Send + Sync + 'static {
    /// Submit one task for execution.
    ///
    /// `GraphflowError::SchedulerRejected` is final; any other error is
    /// treated as transient and retried.
    fn submit(&self, task: TaskSubmission) -> BoxFuture<'_, Result<()>>;

    /// Ask the scheduler to stop a task. Best effort.
    fn stop(&self, graph_id: &str, task_id: &str, reason: &str) -> BoxFuture<'_, Result<()>>;
}

/// Durable store for graph execution state.
pub trait GraphStore: Send + Sync + 'static {
    /// Persist a freshly created graph record.
    fn insert(&self, state: &GraphExecutionState) -> BoxFuture<'_, Result<()>>;

    /// Write `state` back if the stored version still equals `state.version`.
    ///
    /// Returns the new version. Fails with `StateConflict` when another
    /// writer got there first.
    fn update(&self, state: &GraphExecutionState) -> BoxFuture<'_, Result<u64>>;

    fn get(&self, workflow_id: &str, graph_id: &str)
        -> BoxFuture<'_, Result<Option<GraphExecutionState>>>;

    fn list(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<GraphExecutionState>>>;

    /// Every graph that has not reached a terminal status.
    fn list_active(&self) -> BoxFuture<'_, Result<Vec<GraphExecutionState>>>;
}

/// Outcome of registering a submission with the [`OperationLedger`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStart {
    /// A new operation was recorded.
    Created(OperationRecord),
    /// The idempotency key was already used; this is the original operation.
    Existing(OperationRecord),
}

impl OperationStart {
    pub fn record(&self) -> &OperationRecord {
        match self {
            OperationStart::Created(r) | OperationStart::Existing(r) => r,
        }
    }
}

/// Long-running-operation bookkeeping, one record per graph submission.
pub trait OperationLedger: Send + Sync + 'static {
    fn begin(
        &self,
        graph_id: &str,
        workflow_id: &str,
        idempotency_key: Option<&str>,
    ) -> BoxFuture<'_, Result<OperationStart>>;

    fn complete(&self, operation_id: &str) -> BoxFuture<'_, Result<()>>;

    fn fail(&self, operation_id: &str, error: &str) -> BoxFuture<'_, Result<()>>;

    fn operation(&self, operation_id: &str) -> BoxFuture<'_, Result<Option<OperationRecord>>>;
}
