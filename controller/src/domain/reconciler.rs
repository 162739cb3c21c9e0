use crate::domain::ports::{Store, StoreError};
use crate::domain::scheduler;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::time::Duration;
use stevedore_shared::{ContainerState, NodeState};
use tokio::sync::watch;

/// Control-plane half of the reconciliation machinery: a periodic sweep that
/// commits placements for unscheduled containers and expires nodes that
/// stopped heartbeating. Worker-side convergence is its counterpart in the
/// worker crate; the two never share a tick.
pub struct ControlReconciler<S: Store> {
    store: S,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl<S: Store> ControlReconciler<S> {
    pub fn new(store: S, interval: Duration, stale_after: Duration) -> Self {
        ControlReconciler {
            store,
            interval,
            stale_after: chrono::Duration::seconds(stale_after.as_secs() as i64),
        }
    }

    /// Runs sweeps until the shutdown flag flips; the first sweep fires
    /// immediately. Sweep errors are logged, never fatal: the next tick
    /// re-evaluates from persisted state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!("Reconcile error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Stopping control-plane reconciliation loop");
                    return;
                }
            }
        }
    }

    pub async fn reconcile(&self) -> Result<(), StoreError> {
        self.schedule_pending().await?;
        self.expire_nodes().await?;
        Ok(())
    }

    async fn schedule_pending(&self) -> Result<(), StoreError> {
        let containers = self.store.list_containers().await?;
        let nodes = self.store.list_nodes().await?;

        for container in &containers {
            if container.scheduled || container.desired_state != ContainerState::Running {
                continue;
            }
            match scheduler::place(&nodes, &containers) {
                Some(node) => {
                    let mut placed = container.clone();
                    placed.node_id = node.id.clone();
                    placed.scheduled = true;
                    placed.updated_at = Utc::now();
                    self.store.save_container(&placed).await?;
                    info!("Scheduled container {} onto {}", placed.id, node.id);
                }
                None => {
                    debug!(
                        "No ready worker for container {}, retrying next tick",
                        container.id
                    );
                }
            }
        }
        Ok(())
    }

    async fn expire_nodes(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        for node in self.store.list_nodes().await? {
            if node.state == NodeState::Ready && now - node.last_seen > self.stale_after {
                warn!(
                    "Node {} last seen {}s ago, marking not-ready",
                    node.id,
                    (now - node.last_seen).num_seconds()
                );
                let mut expired = node;
                expired.state = NodeState::NotReady;
                self.store.save_node(&expired).await?;
            }
        }
        Ok(())
    }
}
