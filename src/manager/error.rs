use crate::{bpf, collection, gadget, tracer, watcher};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container `{0}` already exists")]
    ContainerExists(String),
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("invalid container definition: {0}")]
    InvalidContainer(String),
    #[error("tracer manager is closed")]
    Closed,
    #[error(transparent)]
    Collection(#[from] collection::Error),
    #[error(transparent)]
    Tracer(#[from] tracer::Error),
    #[error(transparent)]
    Gadget(#[from] gadget::Error),
    #[error(transparent)]
    Watcher(#[from] watcher::Error),
    #[error(transparent)]
    Bpf(#[from] bpf::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
