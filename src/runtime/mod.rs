//! Container runtime clients used to resolve Kubernetes identity of containers
//! and to list containers when no event source is available.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

mod cri;
mod error;

pub use cri::CriClient;
pub use error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A container as reported by a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub state: ContainerState,
    /// Pid of the container's init process, `0` when the runtime did not report it.
    pub pid: u32,
    pub labels: BTreeMap<String, String>,
}

impl RuntimeContainer {
    /// Builds a container from CRI style labels, which carry the pod identity.
    pub fn from_labels(
        id: String,
        name: String,
        state: ContainerState,
        labels: BTreeMap<String, String>,
    ) -> Self {
        let label = |key: &str| labels.get(key).cloned().unwrap_or_default();
        let name = if name.is_empty() {
            label(CONTAINER_NAME_LABEL)
        } else {
            name
        };
        Self {
            pod_namespace: label(POD_NAMESPACE_LABEL),
            pod_name: label(POD_NAME_LABEL),
            id,
            name,
            state,
            pid: 0,
            labels,
        }
    }
}

#[async_trait::async_trait]
pub trait RuntimeClient: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Lists running containers. Pids may be `0`.
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>>;

    /// Returns the container with the given id, including its pid.
    async fn get_container(&self, id: &str) -> Result<RuntimeContainer>;
}

/// Supported runtime flavors and their default sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Containerd,
    CriO,
    CriDockerd,
}

impl RuntimeKind {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::CriO => "cri-o",
            RuntimeKind::CriDockerd => "cri-dockerd",
        }
    }

    pub fn default_socket(self) -> &'static str {
        match self {
            RuntimeKind::Containerd => "/run/containerd/containerd.sock",
            RuntimeKind::CriO => "/run/crio/crio.sock",
            RuntimeKind::CriDockerd => "/run/cri-dockerd.sock",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "containerd" => Ok(RuntimeKind::Containerd),
            "cri-o" | "crio" => Ok(RuntimeKind::CriO),
            "cri-dockerd" | "docker" => Ok(RuntimeKind::CriDockerd),
            other => Err(Error::UnknownRuntime(other.to_owned())),
        }
    }
}

/// A runtime to connect to, written as `name` or `name=/path/to/socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub socket_path: PathBuf,
}

impl FromStr for RuntimeConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, socket) = match s.split_once('=') {
            Some((name, socket)) => (name.trim(), Some(socket.trim())),
            None => (s.trim(), None),
        };
        let kind = name.parse::<RuntimeKind>()?;
        let socket_path = PathBuf::from(socket.unwrap_or(kind.default_socket()));
        Ok(Self { kind, socket_path })
    }
}

impl RuntimeConfig {
    /// The socket as seen from the agent, below `host_root`.
    pub fn host_socket(&self, host_root: &std::path::Path) -> PathBuf {
        crate::fsutil::join_under(host_root, &self.socket_path)
    }
}

/// Creates clients for every runtime whose socket exists below `host_root`.
///
/// Runtimes without a socket are skipped with a debug message.
pub fn connect_all(
    configs: &[RuntimeConfig],
    host_root: &std::path::Path,
) -> Vec<Arc<dyn RuntimeClient>> {
    let mut clients: Vec<Arc<dyn RuntimeClient>> = Vec::with_capacity(configs.len());
    for config in configs {
        let socket = config.host_socket(host_root);
        if !socket.exists() {
            log::debug!(
                "Runtime {} not available: no socket at {}",
                config.kind.name(),
                socket.display()
            );
            continue;
        }
        log::info!("Using runtime {} at {}", config.kind.name(), socket.display());
        clients.push(Arc::new(CriClient::new(
            config.kind.name(),
            &socket,
            DEFAULT_TIMEOUT,
        )));
    }
    clients
}
