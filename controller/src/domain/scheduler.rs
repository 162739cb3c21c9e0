use stevedore_shared::{Container, ContainerState, Node, NodeRole, NodeState};

/// Least-loaded placement over the current node set.
///
/// Load is the count of containers observed `running` on a node, so placement
/// lags reality by at most one worker tick. Only Ready nodes with the Worker
/// role are eligible. Ties break towards the smaller node id, which makes the
/// choice deterministic for identical input. `None` means no eligible worker
/// exists and nothing should be committed this tick.
pub fn place<'a>(nodes: &'a [Node], containers: &[Container]) -> Option<&'a Node> {
    nodes
        .iter()
        .filter(|node| node.role == NodeRole::Worker && node.state == NodeState::Ready)
        .min_by_key(|node| (running_on(&node.id, containers), node.id.as_str()))
}

fn running_on(node_id: &str, containers: &[Container]) -> usize {
    containers
        .iter()
        .filter(|c| c.node_id == node_id && c.state == ContainerState::Running)
        .count()
}
