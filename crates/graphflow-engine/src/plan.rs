use std::collections::{BTreeMap, BTreeSet, HashMap};

use graphflow_core::error::{GraphflowError, Result, ValidationError};
use graphflow_core::types::{
    GraphDescription, GraphExecutionState, TaskDesc, TaskState, TaskStatus, TaskSubmission,
};
use graphflow_graph::{
    condense_graph, contract, find_roots, next_bfs_group, topological_order, Component,
    Condensation, GraphBuilder, TaskGraph, VertexId,
};

/// A compiled graph ready for level-by-level scheduling.
///
/// Scheduling happens over units: the vertices of the condensed graph. A
/// unit is a single task or the full membership of a cycle, and its tasks
/// are always dispatched together.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: TaskGraph,
    condensation: Condensation,
}

impl ExecutionPlan {
    /// Validate `description` and condense it.
    pub fn build(
        description: &GraphDescription,
        builder: &GraphBuilder,
    ) -> std::result::Result<Self, ValidationError> {
        let graph = builder.build(description)?;
        let condensation = condense_graph(&graph);
        Ok(Self {
            graph,
            condensation,
        })
    }

    /// Rebuild the plan of a persisted graph, reusing the unit membership
    /// recorded in its task states instead of recomputing components.
    pub fn restore(state: &GraphExecutionState) -> Result<Self> {
        let graph = GraphBuilder::new(usize::MAX)
            .build(&state.description)
            .map_err(|e| GraphflowError::Plan(format!("stored description is invalid: {}", e)))?;

        let mut groups: BTreeMap<&str, Vec<VertexId>> = BTreeMap::new();
        for (vertex, task) in graph.vertices() {
            let unit = state
                .tasks
                .get(&task.task.id)
                .map(|t| t.unit.as_str())
                .ok_or_else(|| {
                    GraphflowError::Plan(format!("task {} has no stored state", task.task.id))
                })?;
            groups.entry(unit).or_default().push(vertex);
        }
        if state.tasks.len() != graph.vertex_count() {
            return Err(GraphflowError::Plan(format!(
                "stored state tracks {} tasks, description has {}",
                state.tasks.len(),
                graph.vertex_count()
            )));
        }

        let mut groups: Vec<Vec<VertexId>> = groups.into_values().collect();
        groups.sort_by_key(|g| g.iter().min().copied());
        let condensation = contract(&graph, groups);

        if topological_order(&condensation.graph).is_none() {
            return Err(GraphflowError::Plan(
                "stored unit membership does not cover every cycle".into(),
            ));
        }
        Ok(Self {
            graph,
            condensation,
        })
    }

    pub fn task_count(&self) -> usize {
        self.graph.vertex_count()
    }

    pub fn unit_count(&self) -> usize {
        self.condensation.graph.vertex_count()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskDesc> {
        self.graph.find(task_id).map(|v| &self.graph.vertex(v).task)
    }

    pub fn unit(&self, unit: VertexId) -> &Component {
        self.condensation.component(unit)
    }

    /// Unit that schedules `task_id`.
    pub fn unit_of(&self, task_id: &str) -> Option<VertexId> {
        self.graph
            .find(task_id)
            .map(|v| self.condensation.component_of(v))
    }

    /// Distinct units covering `task_ids`, in unit order.
    pub fn units_of<'a>(&self, task_ids: impl IntoIterator<Item = &'a String>) -> Vec<VertexId> {
        let units: BTreeSet<VertexId> = task_ids
            .into_iter()
            .filter_map(|id| self.unit_of(id))
            .collect();
        units.into_iter().collect()
    }

    /// Task ids of every member of `units`, in submission order.
    pub fn tasks_of(&self, units: &[VertexId]) -> Vec<String> {
        let mut members: Vec<VertexId> = units
            .iter()
            .flat_map(|&u| self.unit(u).members.iter().copied())
            .collect();
        members.sort();
        members
            .into_iter()
            .map(|m| self.graph.vertex(m).task.id.clone())
            .collect()
    }

    /// Units with no incoming dependency, the first frontier.
    pub fn root_units(&self) -> Vec<VertexId> {
        find_roots(&self.condensation.graph)
    }

    /// Units in topological order, one inner vec per BFS level from the roots.
    ///
    /// Each unit appears at the level of its longest path from a root, which
    /// is the level it is dispatched at when every task succeeds.
    pub fn levels(&self) -> Vec<Vec<VertexId>> {
        let graph = &self.condensation.graph;
        let order = topological_order(graph).unwrap_or_default();
        let mut depth = vec![0usize; graph.vertex_count()];
        for &unit in &order {
            for child in graph.successors(unit) {
                depth[child.0] = depth[child.0].max(depth[unit.0] + 1);
            }
        }
        let mut levels: Vec<Vec<VertexId>> = Vec::new();
        for unit in graph.vertex_ids() {
            let d = depth[unit.0];
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(unit);
        }
        levels
    }

    /// Whether `unit` may be dispatched: none of its tasks has been
    /// dispatched yet, and every task of every direct predecessor unit
    /// succeeded.
    pub fn is_ready<F>(&self, unit: VertexId, status: &F) -> bool
    where
        F: Fn(&str) -> Option<TaskStatus>,
    {
        let waiting = self
            .unit(unit)
            .member_names
            .iter()
            .all(|t| status(t) == Some(TaskStatus::Waiting));
        waiting
            && self.condensation.graph.predecessors(unit).all(|parent| {
                self.unit(parent)
                    .member_names
                    .iter()
                    .all(|t| status(t) == Some(TaskStatus::Success))
            })
    }

    /// The frontier following `current`: the BFS children of its units,
    /// keeping only those that are ready.
    ///
    /// A join point whose parents sit on different levels becomes ready only
    /// once its last parent finishes, so it is dispatched exactly once.
    pub fn next_frontier<F>(&self, current: &[VertexId], status: F) -> Vec<VertexId>
    where
        F: Fn(&str) -> Option<TaskStatus>,
    {
        next_bfs_group(&self.condensation.graph, current)
            .into_iter()
            .filter(|&unit| self.is_ready(unit, &status))
            .collect()
    }

    /// Every ready unit in the graph, regardless of level.
    pub fn ready_units<F>(&self, status: F) -> Vec<VertexId>
    where
        F: Fn(&str) -> Option<TaskStatus>,
    {
        self.condensation
            .graph
            .vertex_ids()
            .filter(|&unit| self.is_ready(unit, &status))
            .collect()
    }

    /// `(depends_on, depended_by)` for every task.
    ///
    /// `depends_on` holds every task with a path into the task, which
    /// includes the other members of its cycle. Computed over the
    /// condensation in topological order.
    pub fn dependency_sets(&self) -> Result<HashMap<String, (BTreeSet<String>, BTreeSet<String>)>> {
        let graph = &self.condensation.graph;
        let order = topological_order(graph)
            .ok_or_else(|| GraphflowError::Plan("condensed graph is not acyclic".into()))?;

        let mut ancestors: Vec<BTreeSet<String>> = vec![BTreeSet::new(); graph.vertex_count()];
        for &unit in &order {
            let mut inherited = BTreeSet::new();
            for parent in graph.predecessors(unit) {
                inherited.extend(ancestors[parent.0].iter().cloned());
                inherited.extend(self.unit(parent).member_names.iter().cloned());
            }
            ancestors[unit.0] = inherited;
        }

        let mut sets: HashMap<String, (BTreeSet<String>, BTreeSet<String>)> = HashMap::new();
        for unit in graph.vertex_ids() {
            let component = self.unit(unit);
            for task in &component.member_names {
                let mut depends_on = ancestors[unit.0].clone();
                if component.cyclic {
                    depends_on.extend(component.member_names.iter().filter(|m| *m != task).cloned());
                }
                sets.entry(task.clone()).or_default().0 = depends_on;
            }
        }

        let edges: Vec<(String, String)> = sets
            .iter()
            .flat_map(|(task, (deps, _))| deps.iter().map(move |d| (d.clone(), task.clone())))
            .collect();
        for (dependency, dependent) in edges {
            if let Some(entry) = sets.get_mut(&dependency) {
                entry.1.insert(dependent);
            }
        }
        Ok(sets)
    }

    /// Initial WAITING state of every task, keyed by task id.
    pub fn initial_task_states(&self) -> Result<BTreeMap<String, TaskState>> {
        let mut sets = self.dependency_sets()?;
        let mut tasks = BTreeMap::new();
        for (vertex, task) in self.graph.vertices() {
            let (depends_on, depended_by) = sets.remove(&task.task.id).unwrap_or_default();
            let unit = self.condensation.component_of(vertex);
            tasks.insert(
                task.task.id.clone(),
                TaskState {
                    id: task.task.id.clone(),
                    name: task.task.display_name().to_string(),
                    status: TaskStatus::Waiting,
                    unit: self.unit(unit).name.clone(),
                    depends_on,
                    depended_by,
                    description: None,
                },
            );
        }
        Ok(tasks)
    }

    /// The scheduler payload for `task_id` within `state`.
    pub fn submission(&self, state: &GraphExecutionState, task_id: &str) -> Option<TaskSubmission> {
        let task = self.task(task_id)?;
        Some(TaskSubmission {
            graph_id: state.id.clone(),
            workflow_id: state.workflow_id.clone(),
            execution_id: state.execution_id.clone(),
            task_id: task.id.clone(),
            task_name: task.display_name().to_string(),
            operation: task.operation.clone(),
            bindings: task.bindings(),
        })
    }
}
