use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    LogsOptionsBuilder, RemoveContainerOptions, StartContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::{StreamExt, TryStreamExt};
use log::{debug, info};
use std::collections::HashMap;
use stevedore_shared::{Container, PortMapping};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime resource not found")]
    NotFound,
    #[error(transparent)]
    Docker(BollardError),
}

impl From<BollardError> for RuntimeError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound,
            other => RuntimeError::Docker(other),
        }
    }
}

/// What the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub name: String,
}

impl From<&Container> for RuntimeSpec {
    fn from(container: &Container) -> Self {
        RuntimeSpec {
            image: container.image.clone(),
            env: container.env.clone(),
            ports: container.ports.clone(),
            name: container.id.clone(),
        }
    }
}

/// Observed state of a runtime resource.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatus {
    pub runtime_id: String,
    pub state: String,
    pub ip_address: String,
    pub started_at: String,
    pub exit_code: i64,
    pub error: String,
}

/// Imperative interface to the local container engine. The reconciler only
/// talks to this trait, so convergence logic is testable without a daemon.
pub trait Runtime: Send + Sync + 'static {
    fn pull(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn create(&self, spec: &RuntimeSpec) -> impl Future<Output = Result<String, RuntimeError>> + Send;

    fn start(&self, runtime_id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn stop(
        &self,
        runtime_id: &str,
        timeout_seconds: u32,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove(&self, runtime_id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn inspect(
        &self,
        runtime_id: &str,
    ) -> impl Future<Output = Result<RuntimeStatus, RuntimeError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<RuntimeStatus>, RuntimeError>> + Send;

    fn logs(
        &self,
        runtime_id: &str,
        tail: usize,
    ) -> impl Future<Output = Result<String, RuntimeError>> + Send;
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(DockerRuntime { docker })
    }
}

impl Runtime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let (name, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull_stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("{status}");
            }
        }
        info!("Pulled image {image}");
        Ok(())
    }

    async fn create(&self, spec: &RuntimeSpec) -> Result<String, RuntimeError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &spec.ports {
            let container_port = format!("{}/{}", mapping.container_port, mapping.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let env = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let created = self.docker.create_container(Some(options), body).await?;
        info!("Created container {} for {}", short(&created.id), spec.name);
        Ok(created.id)
    }

    async fn start(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(runtime_id, None::<StartContainerOptions>)
            .await?;
        info!("Started container {}", short(runtime_id));
        Ok(())
    }

    async fn stop(&self, runtime_id: &str, timeout_seconds: u32) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new()
            .t(timeout_seconds as i32)
            .build();
        self.docker.stop_container(runtime_id, Some(options)).await?;
        info!("Stopped container {}", short(runtime_id));
        Ok(())
    }

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(runtime_id, Some(options))
            .await?;
        info!("Removed container {}", short(runtime_id));
        Ok(())
    }

    async fn inspect(&self, runtime_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let details = self
            .docker
            .inspect_container(runtime_id, None::<InspectContainerOptions>)
            .await?;

        let mut status = RuntimeStatus {
            runtime_id: details.id.unwrap_or_else(|| runtime_id.to_string()),
            ..Default::default()
        };
        if let Some(state) = details.state {
            status.state = state.status.map(|s| s.to_string()).unwrap_or_default();
            status.started_at = state.started_at.unwrap_or_default();
            status.exit_code = state.exit_code.unwrap_or_default();
            status.error = state.error.unwrap_or_default();
        }
        if let Some(settings) = details.network_settings
            && let Some(networks) = settings.networks
        {
            for endpoint in networks.values() {
                if let Some(ip) = &endpoint.ip_address
                    && !ip.is_empty()
                {
                    status.ip_address = ip.clone();
                }
            }
        }
        Ok(status)
    }

    async fn list(&self) -> Result<Vec<RuntimeStatus>, RuntimeError> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries
            .into_iter()
            .map(|summary| RuntimeStatus {
                runtime_id: summary.id.unwrap_or_default(),
                state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
                ..Default::default()
            })
            .collect())
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError> {
        let tail = tail.to_string();
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail)
            .build();

        let chunks: Vec<_> = self
            .docker
            .logs(runtime_id, Some(options))
            .try_collect()
            .await?;
        Ok(chunks.iter().map(|chunk| chunk.to_string()).collect())
    }
}

fn short(runtime_id: &str) -> &str {
    runtime_id.get(..12).unwrap_or(runtime_id)
}
