pub mod client;
pub mod heartbeat;
pub mod reconciler;
pub mod runtime;

use std::time::Duration;
use stevedore_shared::Node;

/// Cadence of the worker reconciliation sweep.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the liveness heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Grace handed to the runtime when stopping a container.
pub const STOP_GRACE_SECONDS: u32 = 10;

/// The node record this worker registers under. Capacity is advisory; only
/// the CPU count is cheap enough to probe portably.
pub fn self_node(node_id: &str) -> Node {
    let mut node = Node::worker(node_id, local_address());
    node.capacity.cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(0);
    node
}

/// Best-effort local address discovery. A UDP connect never sends a packet
/// but forces the OS to pick the outbound interface.
fn local_address() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
