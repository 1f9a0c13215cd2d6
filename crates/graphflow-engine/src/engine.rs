use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use graphflow_core::config::AppConfig;
use graphflow_core::error::{GraphflowError, Result, ValidationError};
use graphflow_core::event::EventBus;
use graphflow_core::traits::{GraphStore, OperationLedger, OperationStart, TaskScheduler};
use graphflow_core::types::{
    ExecuteRequest, ExecuteResponse, GraphEvent, GraphExecutionState, GraphStatus, TaskProgress,
    TaskStatus,
};
use graphflow_graph::GraphBuilder;

use crate::plan::ExecutionPlan;
use crate::retry::with_retry;
use crate::worker::{EngineContext, GraphCommand, GraphWorker, WorkerRegistry};

/// Accepts graph submissions, drives each graph through its frontiers, and
/// answers status queries.
///
/// Every live graph is owned by one worker task; the engine only routes
/// commands to it. Graphs that outlive the process are picked up again by
/// [`GraphEngine::resume`].
pub struct GraphEngine {
    ctx: Arc<EngineContext>,
    builder: GraphBuilder,
    workers: WorkerRegistry,
    worker_queue: usize,
}

impl GraphEngine {
    pub fn new(
        config: &AppConfig,
        scheduler: Arc<dyn TaskScheduler>,
        store: Arc<dyn GraphStore>,
        ledger: Arc<dyn OperationLedger>,
    ) -> Self {
        Self {
            ctx: Arc::new(EngineContext {
                scheduler,
                store,
                ledger,
                events: Arc::new(EventBus::new(config.engine.event_capacity)),
                retry: config.retry.clone(),
            }),
            builder: GraphBuilder::new(config.engine.max_tasks),
            workers: Arc::new(Mutex::new(HashMap::new())),
            worker_queue: config.engine.worker_queue.max(1),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.ctx.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.ctx.events.subscribe()
    }

    /// Ids of graphs with a live worker in this process.
    pub fn active_graphs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate, persist, and start a graph.
    ///
    /// Requests carrying an idempotency key that was seen before return the
    /// original graph without dispatching anything, or the original failure
    /// when that graph was never stored.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        validate_request(&request)?;
        let description = request.description();
        let plan = ExecutionPlan::build(&description, &self.builder)?;
        let tasks = plan.initial_task_states()?;

        let graph_id = Uuid::new_v4().to_string();
        let key = request
            .idempotency_key
            .as_deref()
            .filter(|k| !k.trim().is_empty());
        let ctx = &self.ctx;
        let started = with_retry("begin operation", &ctx.retry, || {
            ctx.ledger.begin(&graph_id, &request.workflow_id, key)
        })
        .await?;

        let record = match started {
            OperationStart::Existing(record) => {
                info!(
                    graph_id = %record.graph_id,
                    idempotency_key = ?key,
                    "Duplicate submission, returning existing graph"
                );
                let stored = ctx.store.get(&record.workflow_id, &record.graph_id).await?;
                let status = match (stored, record.error) {
                    (Some(state), _) => state.status,
                    // The first submission never got its graph stored.
                    (None, Some(reason)) => {
                        return Err(GraphflowError::StartFailed {
                            graph_id: record.graph_id,
                            reason,
                        })
                    }
                    (None, None) if record.done => {
                        return Err(GraphflowError::NotFound(record.graph_id))
                    }
                    (None, None) => GraphStatus::Waiting,
                };
                return Ok(ExecuteResponse {
                    graph_id: record.graph_id,
                    status,
                });
            }
            OperationStart::Created(record) => record,
        };

        let now = Utc::now();
        let state = GraphExecutionState {
            id: graph_id,
            operation_id: record.id,
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: request.workflow_id,
            workflow_name: request.workflow_name,
            user_id: request.user_id,
            status: GraphStatus::Waiting,
            tasks,
            current_frontier: Default::default(),
            description,
            error_description: None,
            failed_task_id: None,
            failed_task_name: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let (tx, _) = self.spawn_worker(state, plan);
        let state = request_state(&tx, |respond| GraphCommand::Start { respond }).await?;
        Ok(ExecuteResponse {
            graph_id: state.id,
            status: state.status,
        })
    }

    pub async fn status(&self, workflow_id: &str, graph_id: &str) -> Result<GraphExecutionState> {
        self.ctx
            .store
            .get(workflow_id, graph_id)
            .await?
            .ok_or_else(|| GraphflowError::NotFound(graph_id.to_string()))
    }

    pub async fn list(&self, workflow_id: &str) -> Result<Vec<GraphExecutionState>> {
        self.ctx.store.list(workflow_id).await
    }

    /// Fail a running graph and stop its unfinished tasks. Stopping a
    /// finished graph returns it unchanged.
    pub async fn stop(
        &self,
        workflow_id: &str,
        graph_id: &str,
        reason: &str,
    ) -> Result<GraphExecutionState> {
        let stored = self.status(workflow_id, graph_id).await?;
        if stored.status.is_terminal() {
            return Ok(stored);
        }

        let tx = match self.sender(graph_id) {
            Some(tx) => tx,
            // Adopt without resuming, so nothing new is dispatched only to be stopped.
            None => self.attach(stored, false).await?,
        };
        let reason = reason.to_string();
        match request_state(&tx, |respond| GraphCommand::Stop { reason, respond }).await {
            // The worker finished between lookup and delivery.
            Err(GraphflowError::EngineShutdown) => self.status(workflow_id, graph_id).await,
            other => other,
        }
    }

    /// Apply a progress report and wait until the owning worker handled it.
    pub async fn report(&self, progress: TaskProgress) {
        let Some(tx) = self.route(&progress) else {
            return;
        };
        let (ack, handled) = oneshot::channel();
        if tx
            .send(GraphCommand::Progress {
                progress,
                ack: Some(ack),
            })
            .await
            .is_ok()
        {
            let _ = handled.await;
        }
    }

    /// Queue a progress report without waiting for it to be applied.
    pub async fn notify(&self, progress: TaskProgress) {
        let Some(tx) = self.route(&progress) else {
            return;
        };
        if tx
            .send(GraphCommand::Progress {
                progress,
                ack: None,
            })
            .await
            .is_err()
        {
            debug!("Graph finished before progress was delivered");
        }
    }

    /// Consume scheduler progress until `cancel` fires or the channel closes.
    ///
    /// Each graph gets its own forwarder, so a worker with a full lane only
    /// holds up its own graph's reports.
    pub async fn listen(&self, mut progress: mpsc::Receiver<TaskProgress>, cancel: CancellationToken) {
        info!("Progress listener started");
        let mut forwarders: HashMap<String, ProgressForwarder> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Progress listener shutting down");
                    break;
                }
                next = progress.recv() => match next {
                    Some(p) => self.forward(&mut forwarders, p),
                    None => {
                        info!("Progress channel closed");
                        break;
                    }
                },
            }
        }
    }

    fn forward(&self, forwarders: &mut HashMap<String, ProgressForwarder>, progress: TaskProgress) {
        let Some(lane) = self.route(&progress) else {
            return;
        };
        let progress = match forwarders.get(&progress.graph_id) {
            Some(f) if f.feeds(&lane) => match f.tx.send(progress) {
                Ok(()) => return,
                Err(mpsc::error::SendError(p)) => p,
            },
            _ => progress,
        };

        // Drop forwarders whose worker is gone.
        forwarders.retain(|_, f| f.lane.upgrade().is_some());
        let graph_id = progress.graph_id.clone();
        let forwarder = ProgressForwarder::spawn(&lane);
        let _ = forwarder.tx.send(progress);
        forwarders.insert(graph_id, forwarder);
    }

    /// Pick up every non-terminal graph in the store. Tasks already in
    /// flight are not dispatched again; the frontier advances as their
    /// progress arrives. Returns how many graphs were resumed.
    pub async fn resume(&self) -> Result<usize> {
        let ctx = &self.ctx;
        let active = with_retry("list active graphs", &ctx.retry, || ctx.store.list_active()).await?;

        let mut resumed = 0;
        for state in active {
            if self.sender(&state.id).is_some() {
                continue;
            }
            let graph_id = state.id.clone();
            match self.attach(state, true).await {
                Ok(_) => resumed += 1,
                Err(e) => error!(graph_id = %graph_id, error = %e, "Failed to resume graph"),
            }
        }
        info!(resumed, "Resumed active graphs");
        Ok(resumed)
    }

    /// Detach every live worker. Each one finishes the command it is
    /// handling and exits; stored state is left as is for a later
    /// [`resume`](Self::resume).
    pub fn shutdown(&self) {
        let detached: Vec<String> = self.workers().drain().map(|(id, _)| id).collect();
        info!(graphs = detached.len(), "Engine shut down");
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<GraphCommand>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self, graph_id: &str) -> Option<mpsc::Sender<GraphCommand>> {
        self.workers().get(graph_id).cloned()
    }

    fn route(&self, progress: &TaskProgress) -> Option<mpsc::Sender<GraphCommand>> {
        let tx = self.sender(&progress.graph_id);
        if tx.is_none() {
            debug!(
                graph_id = %progress.graph_id,
                task_id = %progress.task_id,
                "Progress for inactive graph dropped"
            );
        }
        tx
    }

    /// Register and spawn a worker for `state`, unless one is already live.
    /// Returns the command lane and whether a new worker was spawned.
    fn spawn_worker(
        &self,
        state: GraphExecutionState,
        plan: ExecutionPlan,
    ) -> (mpsc::Sender<GraphCommand>, bool) {
        let (tx, rx) = mpsc::channel(self.worker_queue);
        {
            let mut workers = self.workers();
            if let Some(existing) = workers.get(&state.id) {
                return (existing.clone(), false);
            }
            workers.insert(state.id.clone(), tx.clone());
        }

        let worker = GraphWorker::new(
            state,
            plan,
            self.ctx.clone(),
            self.workers.clone(),
            tx.downgrade(),
            rx,
        );
        tokio::spawn(worker.run());
        (tx, true)
    }

    /// Spawn a worker for a graph loaded from the store. With `resume` the
    /// worker also picks the graph up where it left off.
    async fn attach(
        &self,
        state: GraphExecutionState,
        resume: bool,
    ) -> Result<mpsc::Sender<GraphCommand>> {
        let plan = match ExecutionPlan::restore(&state) {
            Ok(plan) => plan,
            Err(e) => {
                self.abandon(state, &e).await;
                return Err(e);
            }
        };
        let (tx, spawned) = self.spawn_worker(state, plan);
        if spawned && resume {
            request_state(&tx, |respond| GraphCommand::Resume { respond }).await?;
        }
        Ok(tx)
    }

    /// Fail a stored graph that can no longer be scheduled.
    async fn abandon(&self, mut state: GraphExecutionState, cause: &GraphflowError) {
        let reason = format!("cannot resume graph: {}", cause);
        error!(graph_id = %state.id, reason = %reason, "Abandoning graph");

        for task in state.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Error;
                task.description = Some(format!("stopped: {}", reason));
            }
        }
        state.status = GraphStatus::Failed;
        state.error_description = Some(reason.clone());
        state.updated_at = Utc::now();

        let ctx = &self.ctx;
        if let Err(e) = with_retry("persist graph", &ctx.retry, || ctx.store.update(&state)).await {
            warn!(graph_id = %state.id, error = %e, "Could not persist abandoned graph");
        }
        if let Err(e) = with_retry("fail operation", &ctx.retry, || {
            ctx.ledger.fail(&state.operation_id, &reason)
        })
        .await
        {
            warn!(graph_id = %state.id, error = %e, "Could not record operation failure");
        }
        ctx.events.publish(GraphEvent::GraphFailed {
            graph_id: state.id.clone(),
            reason,
            failed_task_id: None,
        });
    }
}

/// Feeds one worker's lane in arrival order from an unbounded buffer.
struct ProgressForwarder {
    lane: mpsc::WeakSender<GraphCommand>,
    tx: mpsc::UnboundedSender<TaskProgress>,
}

impl ProgressForwarder {
    fn spawn(lane: &mpsc::Sender<GraphCommand>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskProgress>();
        let weak = lane.downgrade();
        let target = weak.clone();
        tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let Some(lane) = target.upgrade() else {
                    debug!(graph_id = %progress.graph_id, "Graph finished before progress was delivered");
                    break;
                };
                if lane
                    .send(GraphCommand::Progress {
                        progress,
                        ack: None,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Self { lane: weak, tx }
    }

    /// Whether this forwarder delivers to `lane`, not to an earlier worker.
    fn feeds(&self, lane: &mpsc::Sender<GraphCommand>) -> bool {
        self.lane.upgrade().is_some_and(|own| own.same_channel(lane))
    }
}

async fn request_state(
    tx: &mpsc::Sender<GraphCommand>,
    command: impl FnOnce(oneshot::Sender<Result<GraphExecutionState>>) -> GraphCommand,
) -> Result<GraphExecutionState> {
    let (respond, response) = oneshot::channel();
    tx.send(command(respond))
        .await
        .map_err(|_| GraphflowError::EngineShutdown)?;
    response.await.map_err(|_| GraphflowError::EngineShutdown)?
}

fn validate_request(request: &ExecuteRequest) -> std::result::Result<(), ValidationError> {
    let required = [
        ("workflow_id", &request.workflow_id),
        ("workflow_name", &request.workflow_name),
        ("user_id", &request.user_id),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyField(field));
        }
    }
    if request.tasks.is_empty() {
        return Err(ValidationError::NoTasks);
    }
    Ok(())
}
