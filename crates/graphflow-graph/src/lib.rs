//! Task graphs: the arena-backed directed graph, the builder that compiles a
//! [`GraphDescription`](graphflow_core::types::GraphDescription) into one, and
//! the algorithms the execution engine schedules with (root discovery, BFS
//! levels, strongly-connected-component condensation).

pub mod algorithms;
pub mod builder;
pub mod graph;

pub use algorithms::{
    condense_graph, contract, find_roots, next_bfs_group, strongly_connected_components,
    topological_order, Component, Condensation, CondensedEdge,
};
pub use builder::{ChannelEdge, GraphBuilder, TaskGraph, TaskVertex};
pub use graph::{DirectedGraph, Edge, EdgeId, GraphVertex, VertexId};
