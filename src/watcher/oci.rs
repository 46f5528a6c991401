//! The subset of the OCI runtime spec (`config.json`) the agent reads.
use std::collections::BTreeMap;
use std::path::Path;

use super::{Error, Result};
use crate::container::Container;
use crate::fsutil;

const CRI_CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";
const CRI_SANDBOX_NAMESPACE: &str = "io.kubernetes.cri.sandbox-namespace";
const CRI_SANDBOX_NAME: &str = "io.kubernetes.cri.sandbox-name";
const CRI_CONTAINER_NAME: &str = "io.kubernetes.cri.container-name";
const POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
const POD_NAME: &str = "io.kubernetes.pod.name";
const CONTAINER_NAME: &str = "io.kubernetes.container.name";

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub process: Option<Process>,
    #[serde(default)]
    pub root: Option<Root>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub linux: Option<Linux>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Process {
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Root {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default)]
    pub cgroups_path: String,
}

impl Spec {
    /// Reads `config.json` from a bundle directory.
    pub fn from_bundle(bundle: impl AsRef<Path>) -> Result<Self> {
        let path = bundle.as_ref().join("config.json");
        let raw = fsutil::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|source| Error::Bundle { path, source })
    }

    /// Whether this is a pod sandbox ("pause") container.
    pub fn is_sandbox(&self) -> bool {
        self.annotations
            .get(CRI_CONTAINER_TYPE)
            .is_some_and(|t| t == "sandbox")
    }

    /// Copies mount sources and the Kubernetes identity found in the
    /// annotations into the container. Fields already set are kept.
    pub fn apply_to(&self, container: &mut Container) {
        if container.mount_sources.is_empty() {
            container.mount_sources = self
                .mounts
                .iter()
                .filter(|m| !m.source.is_empty())
                .map(|m| m.source.clone())
                .collect();
        }

        let annotation = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|k| self.annotations.get(*k))
                .cloned()
                .unwrap_or_default()
        };
        if container.namespace.is_empty() {
            container.namespace = annotation([CRI_SANDBOX_NAMESPACE, POD_NAMESPACE]);
        }
        if container.podname.is_empty() {
            container.podname = annotation([CRI_SANDBOX_NAME, POD_NAME]);
        }
        if container.name.is_empty() && !self.is_sandbox() {
            container.name = annotation([CRI_CONTAINER_NAME, CONTAINER_NAME]);
        }
    }
}
