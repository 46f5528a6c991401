//! Container identity and metadata.
//!
//! A [`Container`] is identified by its mount namespace id ([`MntNsId`]) while
//! it is tracked; the runtime's container id string is kept alongside for
//! lookups coming from the runtime side (e.g. termination events).
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

mod error;
mod selector;

pub use error::{Error, Result};
pub use selector::Selector;

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// A validated container identifier, typically a 64 character hex string.
///
/// # Examples
///
/// ```
/// # use gadget_tracer_manager::container::ContainerID;
/// let id = ContainerID::new("4f2a9c").unwrap();
/// assert_eq!(id.as_ref(), "4f2a9c");
/// assert!(ContainerID::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyContainerID`] for an empty input and
    /// [`Error::InvalidContainerID`] if the input exceeds [`CONTAINER_ID_MAX_LEN`]
    /// or contains a path separator or NUL byte.
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty() {
            return Err(Error::EmptyContainerID);
        }
        if src.len() > CONTAINER_ID_MAX_LEN || src.contains(['/', '\0']) {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ContainerID {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// A non-zero mount namespace inode number, the key containers are tracked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MntNsId(u64);

impl MntNsId {
    /// Returns `None` for `0`, which never names a real namespace.
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MntNsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kubernetes owner reference of the pod a container belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A container as tracked by the agent.
///
/// Everything except `id` may be missing: enrichment is best effort. A
/// container is only tracked once `mntns` is known.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Container {
    pub id: ContainerID,
    pub pid: u32,
    pub mntns: u64,
    pub netns: u64,
    pub cgroup_path: String,
    pub cgroup_id: u64,
    pub cgroup_v1: String,
    pub cgroup_v2: String,
    pub namespace: String,
    pub podname: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owner_reference: Option<OwnerReference>,
    pub mount_sources: Vec<String>,
}

impl Container {
    /// A container with only its id (and optionally its pid) known.
    pub fn new(id: ContainerID, pid: u32) -> Self {
        Self {
            id,
            pid,
            mntns: 0,
            netns: 0,
            cgroup_path: String::new(),
            cgroup_id: 0,
            cgroup_v1: String::new(),
            cgroup_v2: String::new(),
            namespace: String::new(),
            podname: String::new(),
            name: String::new(),
            labels: BTreeMap::new(),
            owner_reference: None,
            mount_sources: Vec::new(),
        }
    }

    pub fn mntns_id(&self) -> Option<MntNsId> {
        MntNsId::new(self.mntns)
    }

    /// The pod infrastructure ("pause") container carries no container name.
    pub fn is_pause(&self) -> bool {
        self.name.is_empty()
    }
}

/// Kind of a [`ContainerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Remove,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Add => f.write_str("add"),
            EventKind::Remove => f.write_str("remove"),
        }
    }
}

/// A container lifecycle notification carrying a snapshot of the container.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub kind: EventKind,
    pub container: Arc<Container>,
}

impl ContainerEvent {
    pub fn add(container: Arc<Container>) -> Self {
        Self {
            kind: EventKind::Add,
            container,
        }
    }

    pub fn remove(container: Arc<Container>) -> Self {
        Self {
            kind: EventKind::Remove,
            container,
        }
    }
}
