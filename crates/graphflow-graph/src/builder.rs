use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use graphflow_core::error::ValidationError;
use graphflow_core::types::{GraphDescription, SlotDirection, TaskDesc};

use crate::graph::{DirectedGraph, GraphVertex, VertexId};

/// A task as a graph vertex.
#[derive(Debug, Clone)]
pub struct TaskVertex {
    pub task: TaskDesc,
}

impl GraphVertex for TaskVertex {
    fn id(&self) -> &str {
        &self.task.id
    }
}

/// A dependency created by a channel with a writer and a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEdge {
    pub channel: String,
}

pub type TaskGraph = DirectedGraph<TaskVertex, ChannelEdge>;

/// Validates a [`GraphDescription`] and compiles it into a [`TaskGraph`].
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    max_tasks: usize,
}

#[derive(Default)]
struct ChannelEnds {
    producers: BTreeSet<VertexId>,
    consumers: BTreeSet<VertexId>,
}

impl GraphBuilder {
    pub fn new(max_tasks: usize) -> Self {
        Self { max_tasks }
    }

    /// Pre-flight check: build and discard.
    pub fn validate(&self, description: &GraphDescription) -> Result<(), ValidationError> {
        self.build(description).map(|_| ())
    }

    /// Build the task graph.
    ///
    /// Tasks become vertices in request order. Every channel with at least
    /// one writer and one reader yields an edge per (writer, reader) pair;
    /// channels missing either side are external ports and yield nothing.
    pub fn build(&self, description: &GraphDescription) -> Result<TaskGraph, ValidationError> {
        if description.tasks.is_empty() {
            return Err(ValidationError::NoTasks);
        }
        if description.tasks.len() > self.max_tasks {
            return Err(ValidationError::TooManyTasks {
                count: description.tasks.len(),
                max: self.max_tasks,
            });
        }

        let mut channels: Vec<&str> = Vec::with_capacity(description.channels.len());
        let mut ends: HashMap<&str, ChannelEnds> = HashMap::new();
        for channel in &description.channels {
            if ends.insert(&channel.id, ChannelEnds::default()).is_some() {
                return Err(ValidationError::DuplicateChannel(channel.id.clone()));
            }
            channels.push(&channel.id);
        }

        let mut graph = TaskGraph::new();
        for task in &description.tasks {
            check_slots(task)?;

            let vertex = graph
                .add_vertex(TaskVertex { task: task.clone() })
                .map_err(|v| ValidationError::DuplicateTask(v.task.id))?;

            for (slot_name, channel) in &task.slot_assignments {
                let slot = task.slot(slot_name).ok_or_else(|| ValidationError::UndeclaredSlot {
                    task: task.id.clone(),
                    slot: slot_name.clone(),
                })?;
                let entry =
                    ends.get_mut(channel.as_str()).ok_or_else(|| ValidationError::UnknownChannel {
                        task: task.id.clone(),
                        channel: channel.clone(),
                    })?;
                match slot.direction {
                    SlotDirection::Output => entry.producers.insert(vertex),
                    SlotDirection::Input => entry.consumers.insert(vertex),
                };
            }
        }

        for channel in channels {
            let entry = &ends[channel];
            if entry.producers.is_empty() || entry.consumers.is_empty() {
                debug!(channel, "External channel, no dependency edge");
                continue;
            }
            for &producer in &entry.producers {
                for &consumer in &entry.consumers {
                    graph.add_edge(
                        producer,
                        consumer,
                        ChannelEdge {
                            channel: channel.to_string(),
                        },
                    );
                }
            }
        }

        Ok(graph)
    }
}

/// A slot name may not be both an input and an output of the same task.
fn check_slots(task: &TaskDesc) -> Result<(), ValidationError> {
    let inputs: HashSet<&str> = task
        .slots
        .iter()
        .filter(|s| s.direction == SlotDirection::Input)
        .map(|s| s.name.as_str())
        .collect();

    match task
        .slots
        .iter()
        .find(|s| s.direction == SlotDirection::Output && inputs.contains(s.name.as_str()))
    {
        Some(slot) => Err(ValidationError::SlotDirectionConflict {
            task: task.id.clone(),
            slot: slot.name.clone(),
        }),
        None => Ok(()),
    }
}
