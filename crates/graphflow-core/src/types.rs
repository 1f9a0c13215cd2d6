use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How data reaches a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotMedia {
    File,
    Pipe,
    Arg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotDirection {
    Input,
    Output,
}

/// A named data port on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub media: SlotMedia,
    pub direction: SlotDirection,
}

impl Slot {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media: SlotMedia::File,
            direction: SlotDirection::Input,
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media: SlotMedia::File,
            direction: SlotDirection::Output,
        }
    }

    pub fn with_media(mut self, media: SlotMedia) -> Self {
        self.media = media;
        self
    }
}

/// Immutable description of one task in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDesc {
    /// Unique within the graph.
    pub id: String,
    /// Human-readable name. Falls back to the id when empty.
    #[serde(default)]
    pub name: String,
    /// Executable descriptor handed to the scheduler untouched.
    #[serde(default)]
    pub operation: serde_json::Value,
    #[serde(default)]
    pub slots: Vec<Slot>,
    /// Slot name -> channel id.
    #[serde(default)]
    pub slot_assignments: BTreeMap<String, String>,
}

impl TaskDesc {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            operation: serde_json::Value::Null,
            slots: vec![],
            slot_assignments: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_operation(mut self, operation: serde_json::Value) -> Self {
        self.operation = operation;
        self
    }

    /// Declare an input slot bound to `channel`.
    pub fn reads(mut self, slot: impl Into<String>, channel: impl Into<String>) -> Self {
        let slot = slot.into();
        self.slot_assignments.insert(slot.clone(), channel.into());
        self.slots.push(Slot::input(slot));
        self
    }

    /// Declare an output slot bound to `channel`.
    pub fn writes(mut self, slot: impl Into<String>, channel: impl Into<String>) -> Self {
        let slot = slot.into();
        self.slot_assignments.insert(slot.clone(), channel.into());
        self.slots.push(Slot::output(slot));
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Channel/slot pairs as handed to the scheduler, in slot declaration order.
    pub fn bindings(&self) -> Vec<SlotBinding> {
        self.slots
            .iter()
            .filter_map(|slot| {
                self.slot_assignments.get(&slot.name).map(|channel| SlotBinding {
                    slot: slot.clone(),
                    channel: channel.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDesc {
    #[serde(default = "generate_channel_id")]
    pub id: String,
}

impl ChannelDesc {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

fn generate_channel_id() -> String {
    format!("channel-{}", Uuid::new_v4())
}

/// Tasks plus the channels connecting them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default)]
    pub tasks: Vec<TaskDesc>,
    #[serde(default)]
    pub channels: Vec<ChannelDesc>,
}

impl GraphDescription {
    pub fn new(tasks: Vec<TaskDesc>, channels: Vec<ChannelDesc>) -> Self {
        Self { tasks, channels }
    }
}

/// A slot and the channel it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    pub slot: Slot,
    pub channel: String,
}

/// Graph-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GraphStatus {
    Waiting,
    Executing,
    Completed,
    Failed,
}

impl GraphStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GraphStatus::Completed | GraphStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GraphStatus::Waiting => "WAITING",
            GraphStatus::Executing => "EXECUTING",
            GraphStatus::Completed => "COMPLETED",
            GraphStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Waiting,
    Queue,
    Executing,
    Success,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }

    /// Dispatched to the scheduler and not yet finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Queue | TaskStatus::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Queue => "QUEUE",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of a single task inside a running graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    /// Schedulable unit (condensed component) this task belongs to.
    pub unit: String,
    /// Every task with a path into this one, cycle partners included.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Inverse of `depends_on`.
    #[serde(default)]
    pub depended_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The persisted record of one submitted graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExecutionState {
    pub id: String,
    pub operation_id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub user_id: String,
    pub status: GraphStatus,
    pub tasks: BTreeMap<String, TaskState>,
    /// Task ids of the units dispatched in the current level.
    #[serde(default)]
    pub current_frontier: BTreeSet<String>,
    /// The submitted description; later frontiers are dispatched from it.
    pub description: GraphDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task_name: Option<String>,
    /// Optimistic locking counter, bumped by every successful store update.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphExecutionState {
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks.values().all(|t| t.status == TaskStatus::Success)
    }

    pub fn non_terminal_tasks(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn in_flight_tasks(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Request to start a graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub workflow_id: String,
    pub user_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub tasks: Vec<TaskDesc>,
    #[serde(default)]
    pub channels: Vec<ChannelDesc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ExecuteRequest {
    pub fn description(&self) -> GraphDescription {
        GraphDescription::new(self.tasks.clone(), self.channels.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub graph_id: String,
    pub status: GraphStatus,
}

/// Everything the scheduler needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub graph_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    pub operation: serde_json::Value,
    pub bindings: Vec<SlotBinding>,
}

/// A progress report emitted by the external scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub graph_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TaskProgress {
    pub fn new(graph_id: impl Into<String>, task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            graph_id: graph_id.into(),
            task_id: task_id.into(),
            status,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Long-running-operation record, one per graph submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub graph_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Events published by the engine on the [`EventBus`](crate::event::EventBus).
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    GraphStarted {
        graph_id: String,
        workflow_id: String,
    },
    TaskDispatched {
        graph_id: String,
        task_id: String,
    },
    TaskStatusChanged {
        graph_id: String,
        task_id: String,
        status: TaskStatus,
    },
    GraphCompleted {
        graph_id: String,
    },
    GraphFailed {
        graph_id: String,
        reason: String,
        failed_task_id: Option<String>,
    },
}

impl GraphEvent {
    pub fn graph_id(&self) -> &str {
        match self {
            GraphEvent::GraphStarted { graph_id, .. }
            | GraphEvent::TaskDispatched { graph_id, .. }
            | GraphEvent::TaskStatusChanged { graph_id, .. }
            | GraphEvent::GraphCompleted { graph_id }
            | GraphEvent::GraphFailed { graph_id, .. } => graph_id,
        }
    }
}
