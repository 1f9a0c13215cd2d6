use std::collections::HashMap;

/// Index of a vertex inside one [`DirectedGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub usize);

/// Index of an edge inside one [`DirectedGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// Capability every vertex payload provides: a stable, unique name.
pub trait GraphVertex {
    fn id(&self) -> &str;
}

/// A directed edge between two vertices of the same graph.
#[derive(Debug, Clone)]
pub struct Edge<E> {
    pub from: VertexId,
    pub to: VertexId,
    pub payload: E,
}

/// Arena-backed directed graph.
///
/// Vertices and edges live in vectors and refer to each other by index, so
/// cycles in the logical graph never turn into cycles of ownership. Vertices
/// are also reachable by name through [`GraphVertex::id`].
#[derive(Debug, Clone)]
pub struct DirectedGraph<V, E> {
    vertices: Vec<V>,
    index: HashMap<String, VertexId>,
    edges: Vec<Edge<E>>,
    outgoing: Vec<Vec<EdgeId>>,
    incoming: Vec<Vec<EdgeId>>,
}

impl<V, E> Default for DirectedGraph<V, E> {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }
}

impl<V: GraphVertex, E> DirectedGraph<V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Gives the vertex back if its name is already taken.
    pub fn add_vertex(&mut self, vertex: V) -> Result<VertexId, V> {
        if self.index.contains_key(vertex.id()) {
            return Err(vertex);
        }
        let id = VertexId(self.vertices.len());
        self.index.insert(vertex.id().to_string(), id);
        self.vertices.push(vertex);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        Ok(id)
    }

    /// Add an edge. Both ends must belong to this graph.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId, payload: E) -> EdgeId {
        assert!(from.0 < self.vertices.len() && to.0 < self.vertices.len());
        let id = EdgeId(self.edges.len());
        self.edges.push(Edge { from, to, payload });
        self.outgoing[from.0].push(id);
        self.incoming[to.0].push(id);
        id
    }

    pub fn find(&self, name: &str) -> Option<VertexId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: VertexId) -> &str {
        self.vertices[id.0].id()
    }
}

impl<V, E> DirectedGraph<V, E> {
    pub fn vertex(&self, id: VertexId) -> &V {
        &self.vertices[id.0]
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        (0..self.vertices.len()).map(VertexId)
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &V)> + '_ {
        self.vertices.iter().enumerate().map(|(i, v)| (VertexId(i), v))
    }

    pub fn edge(&self, id: EdgeId) -> &Edge<E> {
        &self.edges[id.0]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge<E> {
        &mut self.edges[id.0]
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge<E>)> + '_ {
        self.edges.iter().enumerate().map(|(i, e)| (EdgeId(i), e))
    }

    pub fn outgoing(&self, id: VertexId) -> &[EdgeId] {
        &self.outgoing[id.0]
    }

    pub fn incoming(&self, id: VertexId) -> &[EdgeId] {
        &self.incoming[id.0]
    }

    /// Targets of outgoing edges; may repeat when parallel edges exist.
    pub fn successors(&self, id: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.outgoing[id.0].iter().map(|e| self.edges[e.0].to)
    }

    /// Sources of incoming edges; may repeat when parallel edges exist.
    pub fn predecessors(&self, id: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.incoming[id.0].iter().map(|e| self.edges[e.0].from)
    }
}
