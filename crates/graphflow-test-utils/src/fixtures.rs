use std::collections::BTreeMap;

use graphflow_core::types::{ChannelDesc, ExecuteRequest, GraphDescription, TaskDesc};

/// Build a description where every `(a, b)` edge is its own channel `a-b`,
/// written by `a` through slot `to_b` and read by `b` through slot `from_a`.
pub fn description_from_edges(tasks: &[&str], edges: &[(&str, &str)]) -> GraphDescription {
    let mut descs: BTreeMap<&str, TaskDesc> = BTreeMap::new();
    for id in tasks {
        descs.insert(
            *id,
            TaskDesc::new(*id)
                .with_name(format!("task {}", id))
                .with_operation(serde_json::json!({ "command": format!("run {}", id) })),
        );
    }

    let mut channels = Vec::new();
    for (from, to) in edges {
        let channel = format!("{}-{}", from, to);
        channels.push(ChannelDesc::new(channel.clone()));

        let writer = descs.remove(from).expect("edge source is a task");
        descs.insert(*from, writer.writes(format!("to_{}", to), channel.clone()));
        let reader = descs.remove(to).expect("edge target is a task");
        descs.insert(*to, reader.reads(format!("from_{}", from), channel));
    }

    // Keep the caller's task order.
    let ordered = tasks
        .iter()
        .map(|id| descs.remove(id).expect("task present"))
        .collect();
    GraphDescription::new(ordered, channels)
}

pub fn request_from_edges(
    workflow_id: &str,
    tasks: &[&str],
    edges: &[(&str, &str)],
) -> ExecuteRequest {
    let description = description_from_edges(tasks, edges);
    ExecuteRequest {
        workflow_id: workflow_id.to_string(),
        user_id: "user-1".to_string(),
        workflow_name: "fixture".to_string(),
        tasks: description.tasks,
        channels: description.channels,
        idempotency_key: None,
    }
}

/// Ten tasks in three clusters with fan-out and fan-in.
pub fn scenario_a_edges() -> Vec<(&'static str, &'static str)> {
    vec![
        ("1", "2"),
        ("3", "2"),
        ("3", "4"),
        ("5", "6"),
        ("7", "6"),
        ("7", "8"),
        ("9", "10"),
        ("10", "8"),
    ]
}
