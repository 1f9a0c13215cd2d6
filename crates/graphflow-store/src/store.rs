use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use graphflow_core::error::{GraphflowError, Result};
use graphflow_core::traits::{GraphStore, OperationLedger, OperationStart};
use graphflow_core::types::{GraphExecutionState, OperationRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS graphs (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    execution_id TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    state_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_graphs_workflow
    ON graphs(workflow_id, created_at);

CREATE INDEX IF NOT EXISTS idx_graphs_status
    ON graphs(status);

CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    graph_id TEXT NOT NULL,
    workflow_id TEXT NOT NULL,
    idempotency_key TEXT UNIQUE,
    done INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL
);";

fn db_err(e: impl std::fmt::Display) -> GraphflowError {
    GraphflowError::Database(e.to_string())
}

/// SQLite-backed graph state store and operation ledger.
///
/// Each graph is one row: indexed columns for lookup plus the full state as
/// JSON. Updates are optimistic: a write only lands if the row still carries
/// the version the writer read.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_states(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<GraphExecutionState>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| {
                let json: String = row.get(0)?;
                let version: i64 = row.get(1)?;
                Ok((json, version))
            })
            .map_err(db_err)?;

        let mut states = Vec::new();
        for row in rows {
            let (json, version) = row.map_err(db_err)?;
            let mut state: GraphExecutionState = serde_json::from_str(&json)?;
            state.version = version as u64;
            states.push(state);
        }
        Ok(states)
    }
}

impl GraphStore for SqliteStore {
    fn insert(&self, state: &GraphExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();

        Box::pin(async move {
            let json = serde_json::to_string(&state)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO graphs (id, workflow_id, execution_id, status, version, state_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    state.id,
                    state.workflow_id,
                    state.execution_id,
                    state.status.as_str(),
                    state.version as i64,
                    json,
                    state.created_at.to_rfc3339(),
                    state.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn update(&self, state: &GraphExecutionState) -> BoxFuture<'_, Result<u64>> {
        let mut state = state.clone();

        Box::pin(async move {
            let expected = state.version;
            state.version = expected + 1;
            let json = serde_json::to_string(&state)?;

            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE graphs
                     SET status = ?1, version = ?2, state_json = ?3, updated_at = ?4
                     WHERE id = ?5 AND version = ?6",
                    params![
                        state.status.as_str(),
                        state.version as i64,
                        json,
                        state.updated_at.to_rfc3339(),
                        state.id,
                        expected as i64,
                    ],
                )
                .map_err(db_err)?;

            if changed == 1 {
                return Ok(state.version);
            }

            let exists: Option<i64> = conn
                .query_row("SELECT version FROM graphs WHERE id = ?1", params![state.id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;
            match exists {
                Some(_) => Err(GraphflowError::StateConflict {
                    graph_id: state.id.clone(),
                    expected,
                }),
                None => Err(GraphflowError::NotFound(state.id.clone())),
            }
        })
    }

    fn get(
        &self,
        workflow_id: &str,
        graph_id: &str,
    ) -> BoxFuture<'_, Result<Option<GraphExecutionState>>> {
        let workflow_id = workflow_id.to_string();
        let graph_id = graph_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let states = Self::query_states(
                &conn,
                "SELECT state_json, version FROM graphs WHERE workflow_id = ?1 AND id = ?2",
                params![workflow_id, graph_id],
            )?;
            Ok(states.into_iter().next())
        })
    }

    fn list(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<GraphExecutionState>>> {
        let workflow_id = workflow_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_states(
                &conn,
                "SELECT state_json, version FROM graphs
                 WHERE workflow_id = ?1
                 ORDER BY created_at ASC, id ASC",
                params![workflow_id],
            )
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<GraphExecutionState>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_states(
                &conn,
                "SELECT state_json, version FROM graphs
                 WHERE status IN ('WAITING', 'EXECUTING')
                 ORDER BY created_at ASC, id ASC",
                [],
            )
        })
    }
}

fn read_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRecord> {
    let ts_str: String = row.get(6)?;
    Ok(OperationRecord {
        id: row.get(0)?,
        graph_id: row.get(1)?,
        workflow_id: row.get(2)?,
        idempotency_key: row.get(3)?,
        done: row.get::<_, i64>(4)? != 0,
        error: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const OPERATION_COLUMNS: &str =
    "id, graph_id, workflow_id, idempotency_key, done, error, created_at";

impl OperationLedger for SqliteStore {
    fn begin(
        &self,
        graph_id: &str,
        workflow_id: &str,
        idempotency_key: Option<&str>,
    ) -> BoxFuture<'_, Result<OperationStart>> {
        let record = OperationRecord {
            id: Uuid::new_v4().to_string(),
            graph_id: graph_id.to_string(),
            workflow_id: workflow_id.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
            done: false,
            error: None,
            created_at: Utc::now(),
        };

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO operations (id, graph_id, workflow_id, idempotency_key, done, error, created_at)
                     VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
                    params![
                        record.id,
                        record.graph_id,
                        record.workflow_id,
                        record.idempotency_key,
                        record.created_at.to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;

            if inserted == 1 {
                return Ok(OperationStart::Created(record));
            }

            // Only the unique idempotency key can make the insert a no-op.
            let existing = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM operations WHERE idempotency_key = ?1",
                        OPERATION_COLUMNS
                    ),
                    params![record.idempotency_key],
                    read_operation,
                )
                .map_err(db_err)?;
            Ok(OperationStart::Existing(existing))
        })
    }

    fn complete(&self, operation_id: &str) -> BoxFuture<'_, Result<()>> {
        let operation_id = operation_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE operations SET done = 1, error = NULL WHERE id = ?1",
                    params![operation_id],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(GraphflowError::NotFound(operation_id));
            }
            Ok(())
        })
    }

    fn fail(&self, operation_id: &str, error: &str) -> BoxFuture<'_, Result<()>> {
        let operation_id = operation_id.to_string();
        let error = error.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE operations SET done = 1, error = ?1 WHERE id = ?2",
                    params![error, operation_id],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(GraphflowError::NotFound(operation_id));
            }
            Ok(())
        })
    }

    fn operation(&self, operation_id: &str) -> BoxFuture<'_, Result<Option<OperationRecord>>> {
        let operation_id = operation_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.query_row(
                &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS),
                params![operation_id],
                read_operation,
            )
            .optional()
            .map_err(db_err)
        })
    }
}
