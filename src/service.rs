//! gRPC surface of the [`TracerManager`].
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::container::{self, Container, ContainerID, MntNsId, OwnerReference, Selector};
use crate::gadgettracermanager::api as pb;
use crate::gadgettracermanager::api::gadget_tracer_manager_server::{
    GadgetTracerManager, GadgetTracerManagerServer,
};
use crate::manager::{self, TracerManager};
use crate::{collection, tracer};

const STREAM_BUFFER: usize = 16;

impl From<manager::Error> for Status {
    fn from(err: manager::Error) -> Self {
        use manager::Error;
        let message = err.to_string();
        match err {
            Error::ContainerExists(_)
            | Error::Tracer(tracer::Error::AlreadyExists(_))
            | Error::Tracer(tracer::Error::PinInUse { .. })
            | Error::Collection(collection::Error::MntNsConflict { .. }) => {
                Status::already_exists(message)
            }
            Error::ContainerNotFound(_) | Error::Tracer(tracer::Error::NotFound(_)) => {
                Status::not_found(message)
            }
            Error::InvalidContainer(_)
            | Error::Tracer(tracer::Error::InvalidId(_))
            | Error::Collection(collection::Error::MissingMntNs(_)) => {
                Status::invalid_argument(message)
            }
            Error::Closed => Status::unavailable(message),
            _ => Status::internal(message),
        }
    }
}

fn labels_to_map(labels: Vec<pb::Label>) -> BTreeMap<String, String> {
    labels.into_iter().map(|l| (l.key, l.value)).collect()
}

fn labels_from_map(labels: &BTreeMap<String, String>) -> Vec<pb::Label> {
    labels
        .iter()
        .map(|(key, value)| pb::Label {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

impl From<pb::ContainerSelector> for Selector {
    fn from(s: pb::ContainerSelector) -> Self {
        Selector {
            namespace: s.namespace,
            podname: s.podname,
            container_name: s.container_name,
            labels: labels_to_map(s.labels),
        }
    }
}

impl TryFrom<pb::ContainerDefinition> for Container {
    type Error = container::Error;

    fn try_from(def: pb::ContainerDefinition) -> container::Result<Self> {
        let mut c = Container::new(ContainerID::new(&def.id)?, def.pid);
        c.cgroup_path = def.cgroup_path;
        c.cgroup_id = def.cgroup_id;
        c.mntns = def.mntns;
        c.netns = def.netns;
        c.namespace = def.namespace;
        c.podname = def.podname;
        c.name = def.name;
        c.labels = labels_to_map(def.labels);
        c.cgroup_v1 = def.cgroup_v1;
        c.cgroup_v2 = def.cgroup_v2;
        c.mount_sources = def.mount_sources;
        c.owner_reference = def.owner_reference.map(|o| OwnerReference {
            api_version: o.apiversion,
            kind: o.kind,
            name: o.name,
            uid: o.uid,
        });
        Ok(c)
    }
}

impl From<&Container> for pb::ContainerDefinition {
    fn from(c: &Container) -> Self {
        pb::ContainerDefinition {
            id: c.id.to_string(),
            cgroup_path: c.cgroup_path.clone(),
            cgroup_id: c.cgroup_id,
            mntns: c.mntns,
            netns: c.netns,
            pid: c.pid,
            namespace: c.namespace.clone(),
            podname: c.podname.clone(),
            name: c.name.clone(),
            labels: labels_from_map(&c.labels),
            cgroup_v1: c.cgroup_v1.clone(),
            cgroup_v2: c.cgroup_v2.clone(),
            mount_sources: c.mount_sources.clone(),
            owner_reference: c.owner_reference.as_ref().map(|o| pb::OwnerReference {
                apiversion: o.api_version.clone(),
                kind: o.kind.clone(),
                name: o.name.clone(),
                uid: o.uid.clone(),
            }),
        }
    }
}

/// Serves a shared [`TracerManager`].
#[derive(Debug, Clone)]
pub struct Service {
    manager: Arc<TracerManager>,
}

impl Service {
    pub fn new(manager: Arc<TracerManager>) -> Self {
        Self { manager }
    }

    pub fn into_server(self) -> GadgetTracerManagerServer<Self> {
        GadgetTracerManagerServer::new(self)
    }
}

#[tonic::async_trait]
impl GadgetTracerManager for Service {
    type ReceiveStreamStream = ReceiverStream<Result<pb::StreamData, Status>>;

    async fn add_tracer(
        &self,
        request: Request<pb::AddTracerRequest>,
    ) -> Result<Response<pb::TracerId>, Status> {
        let req = request.into_inner();
        let selector = req.selector.map(Selector::from).unwrap_or_default();
        self.manager.add_tracer(&req.id, selector)?;
        Ok(Response::new(pb::TracerId { id: req.id }))
    }

    async fn remove_tracer(
        &self,
        request: Request<pb::TracerId>,
    ) -> Result<Response<pb::RemoveTracerResponse>, Status> {
        self.manager.remove_tracer(&request.into_inner().id)?;
        Ok(Response::new(pb::RemoveTracerResponse {}))
    }

    async fn receive_stream(
        &self,
        request: Request<pb::TracerId>,
    ) -> Result<Response<Self::ReceiveStreamStream>, Status> {
        let id = request.into_inner().id;
        let (stream, mut subscription) = self.manager.receive_stream(&id)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        log::debug!("Client subscribed to the stream of tracer `{id}`");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    line = subscription.recv() => {
                        let Some(line) = line else {
                            break;
                        };
                        if tx.send(Ok(pb::StreamData { line })).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            stream.unsubscribe(subscription);
            log::debug!("Stream of tracer `{id}` finished");
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn add_container(
        &self,
        request: Request<pb::ContainerDefinition>,
    ) -> Result<Response<pb::AddContainerResponse>, Status> {
        let container = Container::try_from(request.into_inner())
            .map_err(|err| manager::Error::InvalidContainer(err.to_string()))?;
        self.manager.add_container(container).await?;
        Ok(Response::new(pb::AddContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<pb::ContainerDefinition>,
    ) -> Result<Response<pb::RemoveContainerResponse>, Status> {
        let def = request.into_inner();
        if !def.id.is_empty() {
            self.manager.remove_container(&def.id)?;
        } else if let Some(mntns) = MntNsId::new(def.mntns) {
            self.manager.remove_container_by_mntns(mntns)?;
        } else {
            return Err(manager::Error::InvalidContainer(
                "neither id nor mntns given".to_owned(),
            )
            .into());
        }
        Ok(Response::new(pb::RemoveContainerResponse {}))
    }

    async fn dump_state(
        &self,
        _request: Request<pb::DumpStateRequest>,
    ) -> Result<Response<pb::Dump>, Status> {
        Ok(Response::new(pb::Dump {
            state: self.manager.dump_state(),
        }))
    }
}
