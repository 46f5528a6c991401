use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tonic::transport::Channel;

use super::{ContainerState, Error, Result, RuntimeClient, RuntimeContainer};
use crate::cri::v1 as cri;
use crate::cri::v1::runtime_service_client::RuntimeServiceClient;

/// Client for runtimes implementing the Kubernetes CRI (containerd, CRI-O, cri-dockerd).
#[derive(Debug, Clone)]
pub struct CriClient {
    name: String,
    client: RuntimeServiceClient<Channel>,
    timeout: Duration,
}

impl CriClient {
    pub fn new(name: &str, socket_path: &Path, timeout: Duration) -> Self {
        let channel = crate::grpc::lazy_channel_for_unix_socket(socket_path, timeout);
        Self {
            name: name.to_owned(),
            client: RuntimeServiceClient::new(channel),
            timeout,
        }
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.timeout);
        request
    }

    fn request_error(&self, status: tonic::Status) -> Error {
        Error::Request {
            runtime: self.name.clone(),
            source: Box::new(status),
        }
    }
}

fn convert_state(state: cri::ContainerState) -> ContainerState {
    match state {
        cri::ContainerState::ContainerCreated => ContainerState::Created,
        cri::ContainerState::ContainerRunning => ContainerState::Running,
        cri::ContainerState::ContainerExited => ContainerState::Exited,
        cri::ContainerState::ContainerUnknown => ContainerState::Unknown,
    }
}

/// Extracts the init pid from the verbose `info` map of a container status.
///
/// containerd and CRI-O both report a JSON document under the `info` key
/// with a top-level `pid` field.
fn pid_from_info(info: &std::collections::HashMap<String, String>) -> std::result::Result<u32, String> {
    let raw = info
        .get("info")
        .ok_or_else(|| "missing `info` key".to_owned())?;
    let doc: serde_json::Value = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    let pid = doc
        .get("pid")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| "missing `pid` field".to_owned())?;
    u32::try_from(pid).map_err(|err| err.to_string())
}

#[async_trait::async_trait]
impl RuntimeClient for CriClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>> {
        let request = self.request(cri::ListContainersRequest {
            filter: Some(cri::ContainerFilter {
                state: Some(cri::ContainerStateValue {
                    state: cri::ContainerState::ContainerRunning as i32,
                }),
                ..Default::default()
            }),
        });
        let response = self
            .client
            .clone()
            .list_containers(request)
            .await
            .map_err(|status| self.request_error(status))?;

        let containers = response
            .into_inner()
            .containers
            .into_iter()
            .map(|c| {
                let state = convert_state(c.state());
                let name = c.metadata.map(|m| m.name).unwrap_or_default();
                RuntimeContainer::from_labels(c.id, name, state, c.labels.into_iter().collect())
            })
            .collect::<Vec<_>>();
        log::trace!("{}: listed {} running containers", self.name, containers.len());
        Ok(containers)
    }

    async fn get_container(&self, id: &str) -> Result<RuntimeContainer> {
        let request = self.request(cri::ContainerStatusRequest {
            container_id: id.to_owned(),
            verbose: true,
        });
        let response = match self.client.clone().container_status(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == tonic::Code::NotFound => {
                return Err(Error::NotFound {
                    runtime: self.name.clone(),
                    id: id.to_owned(),
                });
            }
            Err(status) => return Err(self.request_error(status)),
        };
        let status = response.status.ok_or_else(|| Error::NotFound {
            runtime: self.name.clone(),
            id: id.to_owned(),
        })?;

        let state = convert_state(status.state());
        let name = status.metadata.map(|m| m.name).unwrap_or_default();
        let labels: BTreeMap<String, String> = status.labels.into_iter().collect();
        let mut container = RuntimeContainer::from_labels(status.id, name, state, labels);
        match pid_from_info(&response.info) {
            Ok(pid) => container.pid = pid,
            Err(reason) if state == ContainerState::Running => {
                return Err(Error::InvalidInfo {
                    runtime: self.name.clone(),
                    id: id.to_owned(),
                    reason,
                });
            }
            Err(_) => {}
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_pid_from_info() {
        let mut info = HashMap::new();
        info.insert(
            "info".to_owned(),
            r#"{"sandboxID":"abc","pid":4242,"runtimeSpec":{}}"#.to_owned(),
        );
        assert_eq!(pid_from_info(&info), Ok(4242));

        info.insert("info".to_owned(), r#"{"sandboxID":"abc"}"#.to_owned());
        assert!(pid_from_info(&info).is_err());

        assert!(pid_from_info(&HashMap::new()).is_err());
    }

    #[test]
    fn test_convert_state() {
        assert_eq!(
            convert_state(cri::ContainerState::ContainerRunning),
            ContainerState::Running
        );
        assert_eq!(
            convert_state(cri::ContainerState::ContainerExited),
            ContainerState::Exited
        );
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_a_request_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = CriClient::new(
            "containerd",
            &dir.path().join("missing.sock"),
            Duration::from_millis(200),
        );
        let err = client.list_containers().await.unwrap_err();
        assert!(matches!(err, Error::Request { .. }));
    }
}
