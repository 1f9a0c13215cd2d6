use std::collections::HashSet;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use graphflow_core::error::{GraphflowError, Result};
use graphflow_core::traits::TaskScheduler;
use graphflow_core::types::TaskSubmission;

/// A recorded `stop` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCall {
    pub graph_id: String,
    pub task_id: String,
    pub reason: String,
}

/// Scheduler that records every call and never runs anything.
///
/// Progress is driven by the test, which reports task status to the engine
/// itself.
#[derive(Default)]
pub struct MockScheduler {
    submissions: Mutex<Vec<TaskSubmission>>,
    stops: Mutex<Vec<StopCall>>,
    rejected: Mutex<HashSet<String>>,
    transient_failures: Mutex<usize>,
    fail_stops: Mutex<bool>,
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every submission of `task_id`.
    pub fn reject_task(&self, task_id: &str) {
        self.rejected.lock().unwrap().insert(task_id.to_string());
    }

    /// Fail the next `n` submissions with a transient error.
    pub fn fail_next_submits(&self, n: usize) {
        *self.transient_failures.lock().unwrap() = n;
    }

    /// Make every `stop` call return an error.
    pub fn fail_stops(&self) {
        *self.fail_stops.lock().unwrap() = true;
    }

    /// Park every submission of `task_id` until [`release_held`](Self::release_held).
    pub fn hold_task(&self, task_id: &str) {
        self.held.lock().unwrap().insert(task_id.to_string());
    }

    pub fn release_held(&self) {
        self.held.lock().unwrap().clear();
        self.released.notify_waiters();
    }

    pub fn submissions(&self) -> Vec<TaskSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    /// Submitted task ids, in submission order.
    pub fn submitted_ids(&self) -> Vec<String> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.task_id.clone())
            .collect()
    }

    /// Submitted task ids for one graph, sorted.
    pub fn submitted_for(&self, graph_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.graph_id == graph_id)
            .map(|s| s.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn submission_count(&self, task_id: &str) -> usize {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.task_id == task_id)
            .count()
    }

    pub fn stops(&self) -> Vec<StopCall> {
        self.stops.lock().unwrap().clone()
    }

    /// Stopped task ids, sorted.
    pub fn stopped_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .stops
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Forget everything recorded so far (not the failure settings).
    pub fn clear(&self) {
        self.submissions.lock().unwrap().clear();
        self.stops.lock().unwrap().clear();
    }
}

impl TaskScheduler for MockScheduler {
    fn submit(&self, task: TaskSubmission) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            loop {
                let released = self.released.notified();
                let held = self.held.lock().unwrap().contains(&task.task_id);
                if !held {
                    break;
                }
                released.await;
            }
            {
                let mut remaining = self.transient_failures.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(GraphflowError::Scheduler("scheduler unavailable".into()));
                }
            }
            if self.rejected.lock().unwrap().contains(&task.task_id) {
                return Err(GraphflowError::SchedulerRejected {
                    task_id: task.task_id.clone(),
                    reason: "rejected by mock".into(),
                });
            }
            self.submissions.lock().unwrap().push(task);
            Ok(())
        })
    }

    fn stop(&self, graph_id: &str, task_id: &str, reason: &str) -> BoxFuture<'_, Result<()>> {
        let call = StopCall {
            graph_id: graph_id.to_string(),
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        };

        Box::pin(async move {
            self.stops.lock().unwrap().push(call);
            if *self.fail_stops.lock().unwrap() {
                return Err(GraphflowError::Scheduler("stop failed".into()));
            }
            Ok(())
        })
    }
}
