use std::collections::BTreeMap;
use std::fmt;

use super::Container;

/// Declarative container filter.
///
/// Empty fields are wildcards, populated fields must all match, and `labels`
/// must be a subset of the container's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Selector {
    pub namespace: String,
    pub podname: String,
    pub container_name: String,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn matches(&self, container: &Container) -> bool {
        if !self.namespace.is_empty() && self.namespace != container.namespace {
            return false;
        }
        if !self.podname.is_empty() && self.podname != container.podname {
            return false;
        }
        if !self.container_name.is_empty() && self.container_name != container.name {
            return false;
        }

        self.labels
            .iter()
            .all(|(k, v)| container.labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty()
            && self.podname.is_empty()
            && self.container_name.is_empty()
            && self.labels.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{*}");
        }
        let mut parts = Vec::with_capacity(4);
        if !self.namespace.is_empty() {
            parts.push(format!("namespace={}", self.namespace));
        }
        if !self.podname.is_empty() {
            parts.push(format!("podname={}", self.podname));
        }
        if !self.container_name.is_empty() {
            parts.push(format!("containername={}", self.container_name));
        }
        for (k, v) in &self.labels {
            parts.push(format!("label:{k}={v}"));
        }
        write!(f, "{{{}}}", parts.join(","))
    }
}
