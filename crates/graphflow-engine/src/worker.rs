use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use graphflow_core::config::RetryConfig;
use graphflow_core::error::{GraphflowError, Result};
use graphflow_core::event::EventBus;
use graphflow_core::traits::{GraphStore, OperationLedger, TaskScheduler};
use graphflow_core::types::{
    GraphEvent, GraphExecutionState, GraphStatus, TaskProgress, TaskStatus,
};
use graphflow_graph::VertexId;

use crate::plan::ExecutionPlan;
use crate::retry::with_retry;

/// Collaborators shared by every graph worker.
pub(crate) struct EngineContext {
    pub scheduler: Arc<dyn TaskScheduler>,
    pub store: Arc<dyn GraphStore>,
    pub ledger: Arc<dyn OperationLedger>,
    pub events: Arc<EventBus>,
    pub retry: RetryConfig,
}

/// Command lane of the live workers, keyed by graph id.
pub(crate) type WorkerRegistry = Arc<Mutex<HashMap<String, mpsc::Sender<GraphCommand>>>>;

pub(crate) enum GraphCommand {
    /// Persist the new graph and dispatch its first frontier.
    Start {
        respond: oneshot::Sender<Result<GraphExecutionState>>,
    },
    /// Pick up a graph loaded from the store after a restart.
    Resume {
        respond: oneshot::Sender<Result<GraphExecutionState>>,
    },
    Progress {
        progress: TaskProgress,
        ack: Option<oneshot::Sender<()>>,
    },
    Stop {
        reason: String,
        respond: oneshot::Sender<Result<GraphExecutionState>>,
    },
}

enum Reply {
    State(oneshot::Sender<Result<GraphExecutionState>>, Result<GraphExecutionState>),
    Ack(Option<oneshot::Sender<()>>),
}

impl Reply {
    fn send(self) {
        match self {
            Reply::State(respond, result) => {
                let _ = respond.send(result);
            }
            Reply::Ack(Some(ack)) => {
                let _ = ack.send(());
            }
            Reply::Ack(None) => {}
        }
    }
}

/// Owns one graph's state. Every mutation of that state happens here, one
/// command at a time, so progress events for a graph are totally ordered.
pub(crate) struct GraphWorker {
    state: GraphExecutionState,
    plan: ExecutionPlan,
    ctx: Arc<EngineContext>,
    registry: WorkerRegistry,
    /// This worker's own registry entry, to tell it apart from a successor.
    lane: mpsc::WeakSender<GraphCommand>,
    rx: mpsc::Receiver<GraphCommand>,
    /// Set when another writer took over the stored record.
    relinquished: bool,
    /// Task status changes not yet persisted.
    unpublished: Vec<GraphEvent>,
}

impl GraphWorker {
    pub fn new(
        state: GraphExecutionState,
        plan: ExecutionPlan,
        ctx: Arc<EngineContext>,
        registry: WorkerRegistry,
        lane: mpsc::WeakSender<GraphCommand>,
        rx: mpsc::Receiver<GraphCommand>,
    ) -> Self {
        Self {
            state,
            plan,
            ctx,
            registry,
            lane,
            rx,
            relinquished: false,
            unpublished: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let graph_id = self.state.id.clone();
        debug!(graph_id = %graph_id, "Graph worker started");

        while let Some(command) = self.rx.recv().await {
            let reply = self.handle(command).await;
            let done = self.finished();
            if done {
                // Leave the registry before anyone observes the final state.
                self.detach();
            }
            reply.send();
            if done {
                break;
            }
        }

        self.detach();
        self.rx.close();
        // Commands that raced with shutdown see the final state.
        while let Ok(command) = self.rx.try_recv() {
            match command {
                GraphCommand::Start { respond }
                | GraphCommand::Resume { respond }
                | GraphCommand::Stop { respond, .. } => {
                    let _ = respond.send(Ok(self.state.clone()));
                }
                GraphCommand::Progress { progress, ack } => {
                    debug!(graph_id = %graph_id, task_id = %progress.task_id, "Dropping progress for finished graph");
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
            }
        }
        debug!(graph_id = %graph_id, status = %self.state.status, "Graph worker stopped");
    }

    async fn handle(&mut self, command: GraphCommand) -> Reply {
        match command {
            GraphCommand::Start { respond } => Reply::State(respond, self.start().await),
            GraphCommand::Resume { respond } => Reply::State(respond, self.resume().await),
            GraphCommand::Progress { progress, ack } => {
                self.on_progress(progress).await;
                Reply::Ack(ack)
            }
            GraphCommand::Stop { reason, respond } => Reply::State(respond, self.stop(reason).await),
        }
    }

    fn detach(&self) {
        let Some(own) = self.lane.upgrade() else {
            return;
        };
        if let Ok(mut workers) = self.registry.lock() {
            if workers
                .get(&self.state.id)
                .is_some_and(|tx| tx.same_channel(&own))
            {
                workers.remove(&self.state.id);
            }
        }
    }

    fn finished(&self) -> bool {
        self.relinquished || self.state.status.is_terminal()
    }

    async fn start(&mut self) -> Result<GraphExecutionState> {
        let roots = self.plan.root_units();
        let tasks = self.plan.tasks_of(&roots);
        for task in &tasks {
            self.set_status(task, TaskStatus::Queue, None);
        }
        self.state.current_frontier = tasks.iter().cloned().collect();
        self.state.status = GraphStatus::Executing;
        self.state.updated_at = Utc::now();

        let ctx = self.ctx.clone();
        let inserted = with_retry("insert graph", &ctx.retry, || ctx.store.insert(&self.state)).await;
        if let Err(e) = inserted {
            error!(graph_id = %self.state.id, error = %e, "Could not persist new graph");
            self.state.status = GraphStatus::Failed;
            self.state.error_description = Some(e.to_string());
            self.unpublished.clear();
            self.fail_operation(&e.to_string()).await;
            return Err(e);
        }

        info!(
            graph_id = %self.state.id,
            workflow_id = %self.state.workflow_id,
            tasks = self.plan.task_count(),
            units = self.plan.unit_count(),
            "Graph started"
        );
        self.ctx.events.publish(GraphEvent::GraphStarted {
            graph_id: self.state.id.clone(),
            workflow_id: self.state.workflow_id.clone(),
        });
        self.publish_unpublished();

        self.dispatch(tasks).await;
        Ok(self.state.clone())
    }

    async fn resume(&mut self) -> Result<GraphExecutionState> {
        if let Ok(Some(op)) = self.ctx.ledger.operation(&self.state.operation_id).await {
            if op.done {
                if let Some(error) = op.error {
                    warn!(graph_id = %self.state.id, error = %error, "Operation already failed, closing graph");
                    self.fail(error, None).await;
                    return Ok(self.state.clone());
                }
            }
        }

        let in_flight = self.state.in_flight_tasks();
        self.state.current_frontier.extend(in_flight);
        info!(
            graph_id = %self.state.id,
            frontier = self.state.current_frontier.len(),
            "Resuming graph"
        );
        if self.state.status == GraphStatus::Waiting {
            self.state.status = GraphStatus::Executing;
        }
        // Crashed between the last success of a level and the next dispatch.
        if self.frontier_settled() {
            self.advance().await;
        }
        Ok(self.state.clone())
    }

    async fn stop(&mut self, reason: String) -> Result<GraphExecutionState> {
        if !self.state.status.is_terminal() {
            info!(graph_id = %self.state.id, reason = %reason, "Stopping graph");
            self.fail(reason, None).await;
        }
        Ok(self.state.clone())
    }

    async fn on_progress(&mut self, progress: TaskProgress) {
        let graph_id = self.state.id.clone();
        if self.state.status.is_terminal() {
            debug!(graph_id = %graph_id, task_id = %progress.task_id, "Progress for finished graph ignored");
            return;
        }
        let Some(current) = self.state.task_status(&progress.task_id) else {
            warn!(graph_id = %graph_id, task_id = %progress.task_id, "Progress for unknown task ignored");
            return;
        };

        let next = progress.status;
        match (current, next) {
            (c, n) if c == n => {
                debug!(graph_id = %graph_id, task_id = %progress.task_id, status = %n, "Duplicate progress ignored");
            }
            (c, _) if c.is_terminal() => {
                warn!(
                    graph_id = %graph_id,
                    task_id = %progress.task_id,
                    current = %c,
                    reported = %next,
                    "Progress for finished task ignored"
                );
            }
            (TaskStatus::Waiting, _) | (_, TaskStatus::Waiting) => {
                warn!(
                    graph_id = %graph_id,
                    task_id = %progress.task_id,
                    current = %current,
                    reported = %next,
                    "Out-of-order progress ignored"
                );
            }
            (_, TaskStatus::Executing) => {
                self.set_status(&progress.task_id, TaskStatus::Executing, progress.description);
                self.persist_or_fail().await;
            }
            (_, TaskStatus::Success) => {
                self.set_status(&progress.task_id, TaskStatus::Success, progress.description);
                self.advance().await;
            }
            (_, TaskStatus::Error) => {
                let reason = progress
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("task {} failed", progress.task_id));
                self.set_status(&progress.task_id, TaskStatus::Error, progress.description);
                self.fail(reason, Some(progress.task_id)).await;
            }
            (_, TaskStatus::Queue) => {
                debug!(graph_id = %graph_id, task_id = %progress.task_id, "Stale queue report ignored");
            }
        }
    }

    fn frontier_settled(&self) -> bool {
        self.state
            .current_frontier
            .iter()
            .all(|t| self.state.task_status(t) == Some(TaskStatus::Success))
    }

    /// Move past the current frontier once every task in it succeeded.
    async fn advance(&mut self) {
        if !self.frontier_settled() {
            self.persist_or_fail().await;
            return;
        }

        let status = |t: &str| self.state.task_status(t);
        let frontier: Vec<VertexId> = self.plan.units_of(&self.state.current_frontier);
        let mut next = self.plan.next_frontier(&frontier, status);
        if next.is_empty() && !self.state.all_succeeded() {
            next = self.plan.ready_units(status);
        }

        if next.is_empty() {
            if self.state.all_succeeded() {
                self.complete().await;
            } else {
                let waiting: Vec<String> = self.state.non_terminal_tasks();
                error!(graph_id = %self.state.id, waiting = ?waiting, "No schedulable tasks remain");
                self.fail("graph stalled with unschedulable tasks".into(), None).await;
            }
            return;
        }

        let tasks = self.plan.tasks_of(&next);
        for task in &tasks {
            self.set_status(task, TaskStatus::Queue, None);
        }
        self.state.current_frontier = tasks.iter().cloned().collect();
        debug!(graph_id = %self.state.id, frontier = ?tasks, "Advancing frontier");
        if self.persist_or_fail().await {
            self.dispatch(tasks).await;
        }
    }

    async fn complete(&mut self) {
        self.state.status = GraphStatus::Completed;
        self.state.current_frontier.clear();
        if !self.persist_or_fail().await {
            return;
        }
        info!(graph_id = %self.state.id, "Graph completed");

        let ctx = self.ctx.clone();
        let op_id = self.state.operation_id.clone();
        if let Err(e) = with_retry("complete operation", &ctx.retry, || ctx.ledger.complete(&op_id)).await {
            error!(graph_id = %self.state.id, error = %e, "Failed to complete operation");
        }
        self.ctx.events.publish(GraphEvent::GraphCompleted {
            graph_id: self.state.id.clone(),
        });
    }

    /// Submit `tasks`, already persisted as QUEUE. The first rejected or
    /// undeliverable task fails the graph.
    async fn dispatch(&mut self, tasks: Vec<String>) {
        for task_id in tasks {
            let Some(submission) = self.plan.submission(&self.state, &task_id) else {
                self.fail(format!("task {} missing from plan", task_id), Some(task_id)).await;
                return;
            };
            let ctx = self.ctx.clone();
            let submitted = with_retry("dispatch task", &ctx.retry, || {
                ctx.scheduler.submit(submission.clone())
            })
            .await;

            match submitted {
                Ok(()) => {
                    debug!(graph_id = %self.state.id, task_id = %task_id, "Task dispatched");
                    self.ctx.events.publish(GraphEvent::TaskDispatched {
                        graph_id: self.state.id.clone(),
                        task_id,
                    });
                }
                Err(e) => {
                    error!(graph_id = %self.state.id, task_id = %task_id, error = %e, "Dispatch failed");
                    let reason = format!("dispatch of task {} failed: {}", task_id, e);
                    self.set_status(&task_id, TaskStatus::Error, Some(e.to_string()));
                    self.fail(reason, Some(task_id)).await;
                    return;
                }
            }
        }
    }

    /// Fail the graph, force every unfinished task to ERROR, and ask the
    /// scheduler to stop them.
    async fn fail(&mut self, reason: String, failed_task: Option<String>) {
        let to_stop = self.state.non_terminal_tasks();
        for task in &to_stop {
            self.set_status(task, TaskStatus::Error, Some(format!("stopped: {}", reason)));
        }
        self.state.status = GraphStatus::Failed;
        self.state.error_description = Some(reason.clone());
        if let Some(task_id) = &failed_task {
            self.state.failed_task_name = self.state.tasks.get(task_id).map(|t| t.name.clone());
        }
        self.state.failed_task_id = failed_task.clone();

        warn!(
            graph_id = %self.state.id,
            failed_task = ?failed_task,
            stopping = to_stop.len(),
            reason = %reason,
            "Graph failed"
        );

        if let Err(e) = self.persist().await {
            if self.relinquished {
                return;
            }
            error!(graph_id = %self.state.id, error = %e, "Could not persist failed graph");
            // Failed in memory either way.
            self.publish_unpublished();
        }

        for task_id in &to_stop {
            let ctx = self.ctx.clone();
            let graph_id = self.state.id.clone();
            let stopped = with_retry("stop task", &ctx.retry, || {
                ctx.scheduler.stop(&graph_id, task_id, &reason)
            })
            .await;
            if let Err(e) = stopped {
                warn!(graph_id = %graph_id, task_id = %task_id, error = %e, "Failed to stop task");
            }
        }

        self.fail_operation(&reason).await;
        self.ctx.events.publish(GraphEvent::GraphFailed {
            graph_id: self.state.id.clone(),
            reason,
            failed_task_id: failed_task,
        });
    }

    async fn fail_operation(&self, reason: &str) {
        let ctx = self.ctx.clone();
        let op_id = self.state.operation_id.clone();
        if let Err(e) = with_retry("fail operation", &ctx.retry, || ctx.ledger.fail(&op_id, reason)).await {
            error!(graph_id = %self.state.id, error = %e, "Failed to record operation failure");
        }
    }

    fn set_status(&mut self, task_id: &str, status: TaskStatus, description: Option<String>) {
        let Some(task) = self.state.tasks.get_mut(task_id) else {
            return;
        };
        if task.status == status {
            return;
        }
        task.status = status;
        if description.is_some() {
            task.description = description;
        }
        self.unpublished.push(GraphEvent::TaskStatusChanged {
            graph_id: self.state.id.clone(),
            task_id: task_id.to_string(),
            status,
        });
    }

    fn publish_unpublished(&mut self) {
        for event in self.unpublished.drain(..) {
            self.ctx.events.publish(event);
        }
    }

    /// Write the state back, bumping its version. Buffered task events go
    /// out only once the write landed.
    async fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        let ctx = self.ctx.clone();
        let result = with_retry("persist graph", &ctx.retry, || ctx.store.update(&self.state)).await;
        match result {
            Ok(version) => {
                self.state.version = version;
                self.publish_unpublished();
                Ok(())
            }
            Err(e @ GraphflowError::StateConflict { .. }) => {
                warn!(graph_id = %self.state.id, error = %e, "Graph record taken over elsewhere, relinquishing");
                self.relinquished = true;
                self.unpublished.clear();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist, failing the graph if the store stays unavailable. Returns
    /// whether the caller may go on to act on the new state.
    async fn persist_or_fail(&mut self) -> bool {
        match self.persist().await {
            Ok(()) => true,
            Err(_) if self.relinquished => false,
            Err(e) => {
                error!(graph_id = %self.state.id, error = %e, "Persistence retries exhausted");
                self.fail(format!("failed to persist graph state: {}", e), None).await;
                false
            }
        }
    }
}
