use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use graphflow_core::error::{GraphflowError, Result};
use graphflow_core::traits::GraphStore;
use graphflow_core::types::GraphExecutionState;

/// Wraps a real [`GraphStore`] and fails writes on demand.
///
/// Reads always go through, so tests can observe what actually landed.
pub struct FlakyStore {
    inner: Arc<dyn GraphStore>,
    fail_inserts: Mutex<bool>,
    failing_updates: Mutex<usize>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn GraphStore>) -> Self {
        Self {
            inner,
            fail_inserts: Mutex::new(false),
            failing_updates: Mutex::new(0),
        }
    }

    /// Make every insert fail with a database error.
    pub fn fail_inserts(&self) {
        *self.fail_inserts.lock().unwrap() = true;
    }

    /// Fail the next `n` updates with a database error.
    pub fn fail_next_updates(&self, n: usize) {
        *self.failing_updates.lock().unwrap() = n;
    }

    pub fn heal(&self) {
        *self.fail_inserts.lock().unwrap() = false;
        *self.failing_updates.lock().unwrap() = 0;
    }
}

fn disk_full<'a, T: Send + 'a>() -> BoxFuture<'a, Result<T>> {
    Box::pin(async { Err(GraphflowError::Database("disk full".into())) })
}

impl GraphStore for FlakyStore {
    fn insert(&self, state: &GraphExecutionState) -> BoxFuture<'_, Result<()>> {
        if *self.fail_inserts.lock().unwrap() {
            return disk_full();
        }
        self.inner.insert(state)
    }

    fn update(&self, state: &GraphExecutionState) -> BoxFuture<'_, Result<u64>> {
        {
            let mut remaining = self.failing_updates.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return disk_full();
            }
        }
        self.inner.update(state)
    }

    fn get(
        &self,
        workflow_id: &str,
        graph_id: &str,
    ) -> BoxFuture<'_, Result<Option<GraphExecutionState>>> {
        self.inner.get(workflow_id, graph_id)
    }

    fn list(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<GraphExecutionState>>> {
        self.inner.list(workflow_id)
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<GraphExecutionState>>> {
        self.inner.list_active()
    }
}
