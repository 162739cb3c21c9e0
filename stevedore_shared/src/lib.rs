use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A worker stops retrying a container once it has failed to start this many
/// times; the container is quarantined and its desired state coerced to
/// `Stopped`.
pub const RESTART_CAP: u32 = 3;

/// Lifecycle state of a container. Used both as the observed state reported
/// by workers and as the user-declared desired state (only `Running`,
/// `Stopped` and `Destroyed` make sense as desired states; the API does not
/// enforce this, the reconcilers simply ignore anything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Requested,
    Pulling,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl Display for ContainerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Requested => "requested",
            ContainerState::Pulling => "pulling",
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
            ContainerState::Destroyed => "destroyed",
        };
        write!(f, "{s}")
    }
}

/// A single host-to-container port forwarding, e.g. `8081:80/tcp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParsePortError {
    #[error("expected <host>:<container>[/protocol], got `{0}`")]
    Format(String),
    #[error("invalid port number in `{0}`")]
    Port(String),
}

impl FromStr for PortMapping {
    type Err = ParsePortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto.to_string()),
            None => (s, "tcp".to_string()),
        };
        let (host, container) = ports
            .split_once(':')
            .ok_or_else(|| ParsePortError::Format(s.to_string()))?;
        let host_port = host
            .parse()
            .map_err(|_| ParsePortError::Port(s.to_string()))?;
        let container_port = container
            .parse()
            .map_err(|_| ParsePortError::Port(s.to_string()))?;
        Ok(PortMapping {
            host_port,
            container_port,
            protocol,
        })
    }
}

impl Display for PortMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

/// A container record as persisted by the control plane.
///
/// Field ownership is split: the CLI owns the user-intent fields (`image`,
/// `desired_state`, `env`, `ports`), the control-plane reconciler owns the
/// scheduling fields (`scheduled`, `node_id`), and the owning worker owns the
/// observed fields (`state`, `runtime_id`, `ip_address`, `restart_count`).
/// The [`Container::apply_intent`] and [`Container::apply_report`] merges
/// enforce that split at the API boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub image: String,
    pub desired_state: ContainerState,
    pub state: ContainerState,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub runtime_id: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Container {
    /// A freshly requested container with desired state `Running`, not yet
    /// scheduled anywhere.
    pub fn new(image: impl Into<String>, ports: Vec<PortMapping>) -> Self {
        let now = Utc::now();
        Container {
            id: short_id("cont"),
            image: image.into(),
            desired_state: ContainerState::Running,
            state: ContainerState::Requested,
            scheduled: false,
            node_id: String::new(),
            runtime_id: String::new(),
            ip_address: String::new(),
            env: HashMap::new(),
            ports,
            restart_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a user-intent upsert into an existing record. Only the
    /// user-owned fields move; scheduling and observed fields are preserved.
    /// Setting the desired state back to `Running` resets the restart
    /// counter, which is the manual recovery path out of quarantine.
    pub fn apply_intent(&mut self, req: &Container) {
        if req.desired_state == ContainerState::Running
            && self.desired_state != ContainerState::Running
        {
            self.restart_count = 0;
        }
        self.image = req.image.clone();
        self.env = req.env.clone();
        self.ports = req.ports.clone();
        self.desired_state = req.desired_state;
        self.updated_at = Utc::now();
    }

    /// Merge a worker status report into an existing record. Only the
    /// observed fields move. The one sanctioned write to `desired_state` is
    /// the quarantine coercion: a report carrying `stopped` at the restart
    /// cap.
    pub fn apply_report(&mut self, report: &Container) {
        self.state = report.state;
        self.runtime_id = report.runtime_id.clone();
        self.ip_address = report.ip_address.clone();
        self.restart_count = report.restart_count;
        if report.desired_state == ContainerState::Stopped && report.restart_count >= RESTART_CAP {
            self.desired_state = ContainerState::Stopped;
        }
        self.updated_at = report.updated_at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Ready,
    NotReady,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Ready => write!(f, "ready"),
            NodeState::NotReady => write!(f, "not-ready"),
        }
    }
}

/// Advisory resource vector. Nothing in the core enforces these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// A node record. Created on first register, refreshed by heartbeats,
/// expired to `NotReady` by the control-plane reconciler. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub role: NodeRole,
    pub state: NodeState,
    #[serde(default)]
    pub capacity: Resources,
    #[serde(default)]
    pub allocated: Resources,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn worker(id: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Node {
            id: id.into(),
            address: address.into(),
            role: NodeRole::Worker,
            state: NodeState::Ready,
            capacity: Resources::default(),
            allocated: Resources::default(),
            created_at: now,
            last_seen: now,
        }
    }
}

/// Body of `POST /nodes/heartbeat`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
}

/// Body of the `POST /containers` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContainerAccepted {
    pub id: String,
    pub status: String,
}

/// `<prefix>-<12 hex chars>`, e.g. `cont-9f86d081884c`.
pub fn short_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}
