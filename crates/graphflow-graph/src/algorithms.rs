//! Pure functions over [`DirectedGraph`], independent of task semantics.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::graph::{DirectedGraph, EdgeId, GraphVertex, VertexId};

/// Vertices without incoming edges, across every weakly connected cluster.
///
/// From each unvisited vertex the walk follows incoming edges backwards
/// until it reaches vertices that have none. Returned in vertex order.
pub fn find_roots<V, E>(graph: &DirectedGraph<V, E>) -> Vec<VertexId> {
    let mut visited = vec![false; graph.vertex_count()];
    let mut roots = Vec::new();
    let mut queue = VecDeque::new();

    for start in graph.vertex_ids() {
        if visited[start.0] {
            continue;
        }
        visited[start.0] = true;
        queue.push_back(start);

        while let Some(vertex) = queue.pop_front() {
            if graph.incoming(vertex).is_empty() {
                roots.push(vertex);
                continue;
            }
            for parent in graph.predecessors(vertex) {
                if !visited[parent.0] {
                    visited[parent.0] = true;
                    queue.push_back(parent);
                }
            }
        }
    }

    roots.sort();
    roots
}

/// Distinct children of every vertex in `current`, in discovery order.
///
/// Does not filter vertices visited in earlier groups; a join point reachable
/// from several levels shows up every time one of its parents is expanded.
pub fn next_bfs_group<V, E>(graph: &DirectedGraph<V, E>, current: &[VertexId]) -> Vec<VertexId> {
    let mut seen = HashSet::new();
    let mut group = Vec::new();
    for &vertex in current {
        for child in graph.successors(vertex) {
            if seen.insert(child) {
                group.push(child);
            }
        }
    }
    group
}

/// A strongly connected set of original vertices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// The member's name for singletons, `a+b+...` otherwise.
    pub name: String,
    /// Member vertices of the original graph, in vertex order.
    pub members: Vec<VertexId>,
    /// Names of `members`, same order.
    pub member_names: Vec<String>,
    /// Whether the members form a cycle (more than one member, or a self-loop).
    pub cyclic: bool,
}

impl GraphVertex for Component {
    fn id(&self) -> &str {
        &self.name
    }
}

/// Every original edge crossing from one component to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondensedEdge {
    pub edges: Vec<EdgeId>,
}

/// The acyclic graph of components plus the vertex → component mapping.
#[derive(Debug, Clone)]
pub struct Condensation {
    pub graph: DirectedGraph<Component, CondensedEdge>,
    membership: Vec<VertexId>,
}

impl Condensation {
    /// Component holding original vertex `vertex`.
    pub fn component_of(&self, vertex: VertexId) -> VertexId {
        self.membership[vertex.0]
    }

    pub fn component(&self, id: VertexId) -> &Component {
        self.graph.vertex(id)
    }
}

/// Strongly connected components, Kosaraju style.
///
/// Pass 1 runs a forward DFS from every unvisited vertex and records
/// vertices in post-order. Pass 2 walks that order in reverse and collects,
/// over incoming edges, every vertex not yet assigned; each walk is one
/// component. Components come out in topological order of the condensation.
pub fn strongly_connected_components<V, E>(graph: &DirectedGraph<V, E>) -> Vec<Vec<VertexId>> {
    let n = graph.vertex_count();

    // Pass 1: post-order over forward edges, iteratively.
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut stack: Vec<(VertexId, usize)> = Vec::new();
    for start in graph.vertex_ids() {
        if visited[start.0] {
            continue;
        }
        visited[start.0] = true;
        stack.push((start, 0));
        while let Some(top) = stack.last_mut() {
            let (vertex, next) = *top;
            let outgoing = graph.outgoing(vertex);
            if next < outgoing.len() {
                top.1 += 1;
                let child = graph.edge(outgoing[next]).to;
                if !visited[child.0] {
                    visited[child.0] = true;
                    stack.push((child, 0));
                }
            } else {
                stack.pop();
                order.push(vertex);
            }
        }
    }

    // Pass 2: reverse post-order over incoming edges.
    let mut assigned = vec![false; n];
    let mut components = Vec::new();
    let mut pending = Vec::new();
    for &start in order.iter().rev() {
        if assigned[start.0] {
            continue;
        }
        assigned[start.0] = true;
        pending.push(start);
        let mut members = Vec::new();
        while let Some(vertex) = pending.pop() {
            members.push(vertex);
            for parent in graph.predecessors(vertex) {
                if !assigned[parent.0] {
                    assigned[parent.0] = true;
                    pending.push(parent);
                }
            }
        }
        members.sort();
        components.push(members);
    }

    components
}

/// Fold every strongly connected component into a single vertex.
pub fn condense_graph<V: GraphVertex, E>(graph: &DirectedGraph<V, E>) -> Condensation {
    contract(graph, strongly_connected_components(graph))
}

/// Build the condensation from a known grouping of vertices.
///
/// `groups` must partition the vertices of `graph`. Used when component
/// membership was computed earlier and only the structure must be rebuilt.
pub fn contract<V: GraphVertex, E>(
    graph: &DirectedGraph<V, E>,
    groups: Vec<Vec<VertexId>>,
) -> Condensation {
    let mut membership = vec![VertexId(usize::MAX); graph.vertex_count()];
    let mut condensed: DirectedGraph<Component, CondensedEdge> = DirectedGraph::new();

    for mut members in groups {
        members.sort();
        let member_names: Vec<String> =
            members.iter().map(|&m| graph.name(m).to_string()).collect();
        let self_loop = members.len() == 1 && graph.successors(members[0]).any(|s| s == members[0]);
        let base = member_names.join("+");

        let mut name = base.clone();
        let mut suffix = 1;
        while condensed.find(&name).is_some() {
            suffix += 1;
            name = format!("{}#{}", base, suffix);
        }

        let cyclic = members.len() > 1 || self_loop;
        let id = match condensed.add_vertex(Component {
            name,
            members: members.clone(),
            member_names,
            cyclic,
        }) {
            Ok(id) => id,
            Err(_) => unreachable!("component names are made unique above"),
        };
        for member in members {
            membership[member.0] = id;
        }
    }

    let mut crossing: HashMap<(VertexId, VertexId), EdgeId> = HashMap::new();
    for (edge_id, edge) in graph.edges() {
        let from = membership[edge.from.0];
        let to = membership[edge.to.0];
        if from == to {
            continue;
        }
        match crossing.get(&(from, to)) {
            Some(&existing) => condensed.edge_mut(existing).payload.edges.push(edge_id),
            None => {
                let id = condensed.add_edge(from, to, CondensedEdge { edges: vec![edge_id] });
                crossing.insert((from, to), id);
            }
        }
    }

    Condensation {
        graph: condensed,
        membership,
    }
}

/// Components in topological order (Kahn). `None` if the graph has a cycle.
pub fn topological_order<V, E>(graph: &DirectedGraph<V, E>) -> Option<Vec<VertexId>> {
    let mut in_degree: Vec<usize> = graph.vertex_ids().map(|v| graph.incoming(v).len()).collect();
    let mut ready: VecDeque<VertexId> = graph.vertex_ids().filter(|v| in_degree[v.0] == 0).collect();
    let mut order = Vec::with_capacity(graph.vertex_count());

    while let Some(vertex) = ready.pop_front() {
        order.push(vertex);
        for child in graph.successors(vertex) {
            in_degree[child.0] -= 1;
            if in_degree[child.0] == 0 {
                ready.push_back(child);
            }
        }
    }

    (order.len() == graph.vertex_count()).then_some(order)
}
