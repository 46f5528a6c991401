//! Best effort resolution of container metadata from `/proc` and the runtimes.
use std::path::PathBuf;
use std::sync::Arc;

use crate::container::Container;
use crate::mountinfo::CgroupMounts;
use crate::proc::{Namespace, ProcFs};
use crate::runtime::{self, RuntimeClient};
use crate::{cgroup, fsutil};

/// Fills in missing fields of a container. Every step is optional and a
/// failing step only produces a warning.
#[derive(Debug, Default)]
pub(super) struct Enricher {
    pub(super) proc: Option<ProcFs>,
    pub(super) host_root: PathBuf,
    pub(super) cgroup_mounts: Option<CgroupMounts>,
    pub(super) runtimes: Vec<Arc<dyn RuntimeClient>>,
}

impl Enricher {
    pub(super) async fn enrich(&self, container: &mut Container) {
        if container.pid == 0 || container.namespace.is_empty() || container.podname.is_empty() {
            self.enrich_from_runtime(container).await;
        }
        if container.pid != 0 {
            if let Some(proc) = &self.proc {
                self.enrich_namespaces(proc, container);
                self.enrich_cgroup(proc, container);
            }
        }
    }

    fn enrich_namespaces(&self, proc: &ProcFs, container: &mut Container) {
        if container.mntns == 0 {
            match proc.namespace_id(container.pid, Namespace::Mnt) {
                Ok(id) => container.mntns = id,
                Err(err) => log::warn!("container `{}`: {err}", container.id),
            }
        }
        if container.netns == 0 {
            match proc.namespace_id(container.pid, Namespace::Net) {
                Ok(id) => container.netns = id,
                Err(err) => log::warn!("container `{}`: {err}", container.id),
            }
        }
    }

    fn enrich_cgroup(&self, proc: &ProcFs, container: &mut Container) {
        if !container.cgroup_v1.is_empty() || !container.cgroup_v2.is_empty() {
            return;
        }
        let paths = match cgroup::read_cgroup_paths(proc.cgroup_file(container.pid)) {
            Ok(paths) => paths,
            Err(err) => {
                log::warn!("container `{}`: {err}", container.id);
                return;
            }
        };
        container.cgroup_v1 = paths.v1;
        container.cgroup_v2 = paths.v2;
        if container.cgroup_path.is_empty() {
            container.cgroup_path = if container.cgroup_v2.is_empty() {
                container.cgroup_v1.clone()
            } else {
                container.cgroup_v2.clone()
            };
        }

        let v2_mount = self.cgroup_mounts.as_ref().and_then(|m| m.v2.as_ref());
        if let Some(mount) = v2_mount {
            if container.cgroup_id == 0 && !container.cgroup_v2.is_empty() {
                let dir = fsutil::join_under(
                    fsutil::join_under(&self.host_root, mount),
                    &container.cgroup_v2,
                );
                match cgroup::cgroup_id(&dir) {
                    Ok(id) => container.cgroup_id = id,
                    Err(err) => log::warn!("container `{}`: {err}", container.id),
                }
            }
        }
    }

    async fn enrich_from_runtime(&self, container: &mut Container) {
        for client in &self.runtimes {
            match client.get_container(container.id.as_str()).await {
                Ok(rc) => {
                    log::debug!(
                        "container `{}` resolved by runtime {}",
                        container.id,
                        client.name()
                    );
                    fill(&mut container.namespace, rc.pod_namespace);
                    fill(&mut container.podname, rc.pod_name);
                    fill(&mut container.name, rc.name);
                    if container.pid == 0 {
                        container.pid = rc.pid;
                    }
                    for (key, value) in rc.labels {
                        container.labels.entry(key).or_insert(value);
                    }
                    return;
                }
                Err(err @ runtime::Error::NotFound { .. }) => log::debug!("{err}"),
                Err(err) => log::warn!("{err}"),
            }
        }
        if !self.runtimes.is_empty() {
            log::warn!(
                "container `{}` is unknown to all runtimes, keeping it without pod metadata",
                container.id
            );
        }
    }
}

fn fill(field: &mut String, value: String) {
    if field.is_empty() {
        *field = value;
    }
}
