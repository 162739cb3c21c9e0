use crate::STOP_GRACE_SECONDS;
use crate::client::{ApiError, ControlApi};
use crate::runtime::{Runtime, RuntimeError, RuntimeSpec};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::time::Duration;
use stevedore_shared::{Container, ContainerState, RESTART_CAP};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Maps the runtime's state string onto the container state machine.
fn map_runtime_state(state: &str) -> ContainerState {
    match state {
        "running" => ContainerState::Running,
        "exited" | "dead" => ContainerState::Stopped,
        "created" => ContainerState::Created,
        _ => ContainerState::Failed,
    }
}

/// Worker half of the reconciliation machinery: each tick fetches this
/// node's assignments from the control plane, compares desired against
/// observed runtime state and drives the runtime towards desired, reporting
/// every mutation back. Containers are converged independently; one failure
/// never blocks the rest of the tick.
pub struct WorkerReconciler<R: Runtime, C: ControlApi> {
    runtime: R,
    api: C,
    node_id: String,
    interval: Duration,
}

impl<R: Runtime, C: ControlApi> WorkerReconciler<R, C> {
    pub fn new(runtime: R, api: C, node_id: String, interval: Duration) -> Self {
        WorkerReconciler {
            runtime,
            api,
            node_id,
            interval,
        }
    }

    /// Runs sweeps until the shutdown flag flips; ticks never overlap.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!("Reconcile error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Stopping worker reconciliation loop");
                    return;
                }
            }
        }
    }

    pub async fn reconcile(&self) -> Result<(), WorkerError> {
        let containers = self.api.assigned_containers().await?;
        for container in containers {
            if container.node_id != self.node_id {
                continue;
            }
            let id = container.id.clone();
            if let Err(e) = self.converge(container).await {
                error!("Failed to reconcile container {id}: {e}");
            }
        }
        Ok(())
    }

    async fn converge(&self, container: Container) -> Result<(), WorkerError> {
        let observed = self.observed_state(&container).await;
        match container.desired_state {
            ContainerState::Running => self.converge_running(container, observed).await,
            ContainerState::Stopped => self.converge_stopped(container, observed).await,
            ContainerState::Destroyed => self.converge_destroyed(container).await,
            other => {
                debug!("Ignoring desired state {other} for container {}", container.id);
                Ok(())
            }
        }
    }

    /// `None` when there is no runtime resource behind the record: never
    /// created, or the runtime lost track of it.
    async fn observed_state(&self, container: &Container) -> Option<ContainerState> {
        if container.runtime_id.is_empty() {
            return None;
        }
        match self.runtime.inspect(&container.runtime_id).await {
            Ok(status) => Some(map_runtime_state(&status.state)),
            Err(_) => None,
        }
    }

    async fn converge_running(
        &self,
        mut container: Container,
        observed: Option<ContainerState>,
    ) -> Result<(), WorkerError> {
        if container.restart_count >= RESTART_CAP {
            // quarantined, nothing left to try
            return Ok(());
        }

        let mut observed = observed;
        if observed.is_none() {
            info!("Container {} has no runtime resource, creating", container.id);
            self.runtime.pull(&container.image).await?;

            let spec = RuntimeSpec::from(&container);
            match self.runtime.create(&spec).await {
                Ok(runtime_id) => {
                    container.runtime_id = runtime_id;
                    container.state = ContainerState::Created;
                    container.updated_at = Utc::now();
                    self.report(&container).await;
                    observed = Some(ContainerState::Created);
                }
                Err(e) => {
                    container.runtime_id.clear();
                    container.state = ContainerState::Failed;
                    container.updated_at = Utc::now();
                    self.report(&container).await;
                    return Err(e.into());
                }
            }
        }

        if observed != Some(ContainerState::Running) {
            if let Err(e) = self.runtime.start(&container.runtime_id).await {
                container.restart_count += 1;
                container.state = ContainerState::Failed;
                if container.restart_count >= RESTART_CAP {
                    warn!(
                        "Container {} failed to start {} times, quarantining",
                        container.id, container.restart_count
                    );
                    container.desired_state = ContainerState::Stopped;
                }
                container.updated_at = Utc::now();
                self.report(&container).await;
                return Err(e.into());
            }

            if let Ok(status) = self.runtime.inspect(&container.runtime_id).await {
                container.ip_address = status.ip_address;
            }
            container.state = ContainerState::Running;
            container.updated_at = Utc::now();
            self.report(&container).await;
        }

        Ok(())
    }

    async fn converge_stopped(
        &self,
        mut container: Container,
        observed: Option<ContainerState>,
    ) -> Result<(), WorkerError> {
        if observed == Some(ContainerState::Running) {
            self.runtime
                .stop(&container.runtime_id, STOP_GRACE_SECONDS)
                .await?;
            container.state = ContainerState::Stopped;
            container.updated_at = Utc::now();
            self.report(&container).await;
        }
        Ok(())
    }

    async fn converge_destroyed(&self, container: Container) -> Result<(), WorkerError> {
        if !container.runtime_id.is_empty() {
            match self.runtime.remove(&container.runtime_id).await {
                // a resource the runtime already forgot counts as removed
                Ok(()) | Err(RuntimeError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.api.delete_container(&container.id).await?;
        info!("Container {} destroyed", container.id);
        Ok(())
    }

    /// Transport failures are logged, not propagated: the runtime action
    /// already happened, and the next tick re-reports from observed state.
    async fn report(&self, container: &Container) {
        if let Err(e) = self.api.report_status(container).await {
            warn!("Failed to report status for {}: {e}", container.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeStatus;
    use bollard::errors::Error as BollardError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use stevedore_shared::Node;

    const NODE: &str = "worker-1";

    #[derive(Default)]
    struct FakeRuntimeInner {
        containers: HashMap<String, String>,
        fail_start: bool,
        pull_calls: usize,
        start_calls: usize,
        stop_calls: Vec<(String, u32)>,
        removed: Vec<String>,
        next_id: usize,
    }

    #[derive(Clone, Default)]
    struct FakeRuntime(Arc<Mutex<FakeRuntimeInner>>);

    impl FakeRuntime {
        fn insert(&self, runtime_id: &str, state: &str) {
            self.0
                .lock()
                .unwrap()
                .containers
                .insert(runtime_id.to_string(), state.to_string());
        }
    }

    fn start_failure() -> RuntimeError {
        RuntimeError::Docker(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "start failed".to_string(),
        })
    }

    impl Runtime for FakeRuntime {
        async fn pull(&self, _image: &str) -> Result<(), RuntimeError> {
            self.0.lock().unwrap().pull_calls += 1;
            Ok(())
        }

        async fn create(&self, _spec: &RuntimeSpec) -> Result<String, RuntimeError> {
            let mut inner = self.0.lock().unwrap();
            inner.next_id += 1;
            let runtime_id = format!("rt-{}", inner.next_id);
            inner
                .containers
                .insert(runtime_id.clone(), "created".to_string());
            Ok(runtime_id)
        }

        async fn start(&self, runtime_id: &str) -> Result<(), RuntimeError> {
            let mut inner = self.0.lock().unwrap();
            inner.start_calls += 1;
            if inner.fail_start {
                return Err(start_failure());
            }
            match inner.containers.get_mut(runtime_id) {
                Some(state) => {
                    *state = "running".to_string();
                    Ok(())
                }
                None => Err(RuntimeError::NotFound),
            }
        }

        async fn stop(&self, runtime_id: &str, timeout_seconds: u32) -> Result<(), RuntimeError> {
            let mut inner = self.0.lock().unwrap();
            inner
                .stop_calls
                .push((runtime_id.to_string(), timeout_seconds));
            match inner.containers.get_mut(runtime_id) {
                Some(state) => {
                    *state = "exited".to_string();
                    Ok(())
                }
                None => Err(RuntimeError::NotFound),
            }
        }

        async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
            let mut inner = self.0.lock().unwrap();
            if inner.containers.remove(runtime_id).is_none() {
                return Err(RuntimeError::NotFound);
            }
            inner.removed.push(runtime_id.to_string());
            Ok(())
        }

        async fn inspect(&self, runtime_id: &str) -> Result<RuntimeStatus, RuntimeError> {
            let inner = self.0.lock().unwrap();
            let state = inner
                .containers
                .get(runtime_id)
                .ok_or(RuntimeError::NotFound)?;
            Ok(RuntimeStatus {
                runtime_id: runtime_id.to_string(),
                state: state.clone(),
                ip_address: if state == "running" {
                    "172.17.0.9".to_string()
                } else {
                    String::new()
                },
                ..Default::default()
            })
        }

        async fn list(&self) -> Result<Vec<RuntimeStatus>, RuntimeError> {
            Ok(vec![])
        }

        async fn logs(&self, _runtime_id: &str, _tail: usize) -> Result<String, RuntimeError> {
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct FakeApiInner {
        assigned: Vec<Container>,
        reports: Vec<Container>,
        deleted: Vec<String>,
    }

    /// Stands in for the control plane: status reports are merged the way
    /// the real status endpoint merges them.
    #[derive(Clone, Default)]
    struct FakeApi(Arc<Mutex<FakeApiInner>>);

    impl FakeApi {
        fn assign(&self, container: Container) {
            self.0.lock().unwrap().assigned.push(container);
        }

        fn stored(&self, id: &str) -> Container {
            self.0
                .lock()
                .unwrap()
                .assigned
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .unwrap()
        }
    }

    impl ControlApi for FakeApi {
        async fn register(&self, _node: &Node) -> Result<(), ApiError> {
            Ok(())
        }

        async fn heartbeat(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn assigned_containers(&self) -> Result<Vec<Container>, ApiError> {
            Ok(self.0.lock().unwrap().assigned.clone())
        }

        async fn report_status(&self, container: &Container) -> Result<(), ApiError> {
            let mut inner = self.0.lock().unwrap();
            if let Some(existing) = inner.assigned.iter_mut().find(|c| c.id == container.id) {
                existing.apply_report(container);
            }
            inner.reports.push(container.clone());
            Ok(())
        }

        async fn delete_container(&self, id: &str) -> Result<(), ApiError> {
            let mut inner = self.0.lock().unwrap();
            inner.assigned.retain(|c| c.id != id);
            inner.deleted.push(id.to_string());
            Ok(())
        }
    }

    fn assigned_container() -> Container {
        let mut container = Container::new("nginx:alpine", vec!["8081:80".parse().unwrap()]);
        container.scheduled = true;
        container.node_id = NODE.to_string();
        container
    }

    fn reconciler(
        runtime: &FakeRuntime,
        api: &FakeApi,
    ) -> WorkerReconciler<FakeRuntime, FakeApi> {
        WorkerReconciler::new(
            runtime.clone(),
            api.clone(),
            NODE.to_string(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn creates_and_starts_a_missing_container_in_one_tick() {
        let runtime = FakeRuntime::default();
        let api = FakeApi::default();
        let container = assigned_container();
        let id = container.id.clone();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        let stored = api.stored(&id);
        assert_eq!(stored.state, ContainerState::Running);
        assert!(!stored.runtime_id.is_empty());
        assert_eq!(stored.ip_address, "172.17.0.9");
        assert_eq!(runtime.0.lock().unwrap().pull_calls, 1);
        assert_eq!(runtime.0.lock().unwrap().start_calls, 1);
    }

    #[tokio::test]
    async fn restarts_an_exited_container() {
        let runtime = FakeRuntime::default();
        runtime.insert("rt-9", "exited");
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-9".to_string();
        container.state = ContainerState::Running;
        let id = container.id.clone();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        let stored = api.stored(&id);
        assert_eq!(stored.state, ContainerState::Running);
        // no recreate, only a restart of the existing resource
        assert_eq!(runtime.0.lock().unwrap().pull_calls, 0);
        assert_eq!(stored.runtime_id, "rt-9");
    }

    #[tokio::test]
    async fn recreates_when_the_runtime_lost_the_resource() {
        let runtime = FakeRuntime::default();
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-gone".to_string();
        container.state = ContainerState::Running;
        let id = container.id.clone();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        let stored = api.stored(&id);
        assert_eq!(stored.state, ContainerState::Running);
        assert_ne!(stored.runtime_id, "rt-gone");
        assert_eq!(runtime.0.lock().unwrap().pull_calls, 1);
    }

    #[tokio::test]
    async fn an_already_running_container_is_left_alone() {
        let runtime = FakeRuntime::default();
        runtime.insert("rt-9", "running");
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-9".to_string();
        container.state = ContainerState::Running;
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        let inner = runtime.0.lock().unwrap();
        assert_eq!(inner.pull_calls, 0);
        assert_eq!(inner.start_calls, 0);
        assert!(api.0.lock().unwrap().reports.is_empty());
    }

    #[tokio::test]
    async fn start_failures_count_up_to_the_cap_and_quarantine() {
        let runtime = FakeRuntime::default();
        runtime.0.lock().unwrap().fail_start = true;
        let api = FakeApi::default();
        let container = assigned_container();
        let id = container.id.clone();
        api.assign(container);

        let reconciler = reconciler(&runtime, &api);
        for expected in 1..=RESTART_CAP {
            reconciler.reconcile().await.unwrap();
            assert_eq!(api.stored(&id).restart_count, expected);
        }

        let stored = api.stored(&id);
        assert_eq!(stored.state, ContainerState::Failed);
        assert_eq!(stored.desired_state, ContainerState::Stopped);
        assert_eq!(stored.restart_count, RESTART_CAP);
        assert_eq!(runtime.0.lock().unwrap().start_calls, RESTART_CAP as usize);
        // created once on the first tick, then only start retries
        assert_eq!(runtime.0.lock().unwrap().pull_calls, 1);

        // quarantined: another tick attempts nothing further
        reconciler.reconcile().await.unwrap();
        assert_eq!(runtime.0.lock().unwrap().start_calls, RESTART_CAP as usize);
    }

    #[tokio::test]
    async fn stops_a_running_container_with_the_fixed_grace() {
        let runtime = FakeRuntime::default();
        runtime.insert("rt-9", "running");
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-9".to_string();
        container.state = ContainerState::Running;
        container.desired_state = ContainerState::Stopped;
        let id = container.id.clone();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        assert_eq!(api.stored(&id).state, ContainerState::Stopped);
        assert_eq!(
            runtime.0.lock().unwrap().stop_calls,
            vec![("rt-9".to_string(), STOP_GRACE_SECONDS)]
        );
    }

    #[tokio::test]
    async fn stop_is_a_no_op_unless_observed_running() {
        let runtime = FakeRuntime::default();
        runtime.insert("rt-9", "exited");
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-9".to_string();
        container.desired_state = ContainerState::Stopped;
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        assert!(runtime.0.lock().unwrap().stop_calls.is_empty());
    }

    #[tokio::test]
    async fn destroy_removes_the_resource_and_deletes_the_record() {
        let runtime = FakeRuntime::default();
        runtime.insert("rt-9", "running");
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-9".to_string();
        container.desired_state = ContainerState::Destroyed;
        let id = container.id.clone();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        let inner = api.0.lock().unwrap();
        assert_eq!(inner.deleted, vec![id]);
        assert!(inner.assigned.is_empty());
        assert_eq!(runtime.0.lock().unwrap().removed, vec!["rt-9".to_string()]);
    }

    #[tokio::test]
    async fn destroy_tolerates_an_already_gone_resource() {
        let runtime = FakeRuntime::default();
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.runtime_id = "rt-gone".to_string();
        container.desired_state = ContainerState::Destroyed;
        let id = container.id.clone();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        assert_eq!(api.0.lock().unwrap().deleted, vec![id]);
    }

    #[tokio::test]
    async fn skips_containers_assigned_to_other_nodes() {
        let runtime = FakeRuntime::default();
        let api = FakeApi::default();
        let mut container = assigned_container();
        container.node_id = "worker-2".to_string();
        api.assign(container);

        reconciler(&runtime, &api).reconcile().await.unwrap();

        assert_eq!(runtime.0.lock().unwrap().pull_calls, 0);
    }

    #[test]
    fn runtime_states_map_onto_the_state_machine() {
        assert_eq!(map_runtime_state("running"), ContainerState::Running);
        assert_eq!(map_runtime_state("exited"), ContainerState::Stopped);
        assert_eq!(map_runtime_state("dead"), ContainerState::Stopped);
        assert_eq!(map_runtime_state("created"), ContainerState::Created);
        assert_eq!(map_runtime_state("restarting"), ContainerState::Failed);
        assert_eq!(map_runtime_state(""), ContainerState::Failed);
    }
}
