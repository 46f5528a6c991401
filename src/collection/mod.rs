//! Registry of live containers, keyed by mount namespace id.
//!
//! Containers are inserted before their `Add` event is published and removed
//! after their `Remove` event was delivered to every subscriber, so a
//! subscriber can always look up the container an event refers to. The
//! `Remove` fan-out of a container only starts after its `Add` fan-out ended.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;

use crate::container::{Container, ContainerEvent, MntNsId, Selector};
use crate::mountinfo::CgroupMounts;
use crate::proc::ProcFs;
use crate::pubsub::{PubSub, SubscriptionToken};
use crate::runtime::RuntimeClient;

mod enrich;
mod error;

pub use error::{Error, Result};

use enrich::Enricher;

#[derive(Debug)]
struct Entry {
    container: Arc<Container>,
    /// Set once a `Remove` is being published; hides the entry from lookups
    /// and makes concurrent removals of the same container no-ops.
    terminating: bool,
    /// Held while the container's `Add` is being published.
    fanout: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub struct ContainerCollection {
    containers: DashMap<MntNsId, Entry>,
    bus: PubSub,
    enricher: Enricher,
}

impl Default for ContainerCollection {
    fn default() -> Self {
        CollectionBuilder::default().build()
    }
}

impl ContainerCollection {
    pub fn builder() -> CollectionBuilder {
        CollectionBuilder::default()
    }

    /// Enriches and inserts a container, then publishes `Add`.
    ///
    /// Returns `Ok(false)` without publishing if a container with the same
    /// mount namespace or the same id is already tracked.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingMntNs`] if the mount namespace could not be resolved.
    /// - [`Error::MntNsConflict`] if another container owns the mount namespace.
    pub async fn add_container(&self, mut container: Container) -> Result<bool> {
        if self.contains_id(container.id.as_str()) {
            log::debug!("container `{}` is already tracked", container.id);
            return Ok(false);
        }
        self.enricher.enrich(&mut container).await;
        let Some(key) = container.mntns_id() else {
            return Err(Error::MissingMntNs(container.id));
        };

        let container = Arc::new(container);
        let fanout = Arc::new(Mutex::new(()));
        let publishing = fanout.lock().unwrap_or_else(PoisonError::into_inner);
        match self.containers.entry(key) {
            MapEntry::Occupied(existing) => {
                let existing = &existing.get().container;
                if existing.id == container.id {
                    return Ok(false);
                }
                return Err(Error::MntNsConflict {
                    mntns: key.as_raw(),
                    id: container.id.clone(),
                    existing: existing.id.clone(),
                });
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    container: Arc::clone(&container),
                    terminating: false,
                    fanout: Arc::clone(&fanout),
                });
            }
        }

        log::info!(
            "Added container `{}` (mntns={}, namespace={}, pod={}, name={})",
            container.id,
            key,
            container.namespace,
            container.podname,
            container.name
        );
        self.bus.publish(&ContainerEvent::add(container));
        drop(publishing);
        Ok(true)
    }

    /// Publishes `Remove` for the container with the given id, then deletes it.
    ///
    /// Blocks until a concurrent `Add` of the same container was delivered,
    /// so it must not be called from a subscriber handling that `Add`.
    /// Returns `None` if no such container is tracked or it is already being
    /// removed.
    pub fn remove_container(&self, id: &str) -> Option<Arc<Container>> {
        let (key, container, fanout) = self.containers.iter_mut().find_map(|mut entry| {
            if entry.terminating || entry.container.id.as_str() != id {
                return None;
            }
            entry.terminating = true;
            Some((
                *entry.key(),
                Arc::clone(&entry.container),
                Arc::clone(&entry.fanout),
            ))
        })?;

        let _added = fanout.lock().unwrap_or_else(PoisonError::into_inner);
        self.bus.publish(&ContainerEvent::remove(Arc::clone(&container)));
        self.containers.remove_if(&key, |_, entry| entry.terminating);
        log::info!("Removed container `{}` (mntns={key})", container.id);
        Some(container)
    }

    pub fn get(&self, mntns: MntNsId) -> Option<Arc<Container>> {
        self.containers
            .get(&mntns)
            .filter(|entry| !entry.terminating)
            .map(|entry| Arc::clone(&entry.container))
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Container>> {
        self.containers
            .iter()
            .find(|entry| !entry.terminating && entry.container.id.as_str() == id)
            .map(|entry| Arc::clone(&entry.container))
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.get_by_id(id).is_some()
    }

    /// Snapshot of all live containers, ordered by container id.
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.select(&Selector::default())
    }

    /// Live containers matching the selector, ordered by container id.
    pub fn select(&self, selector: &Selector) -> Vec<Arc<Container>> {
        let mut out: Vec<Arc<Container>> = self
            .containers
            .iter()
            .filter(|entry| !entry.terminating && selector.matches(&entry.container))
            .map(|entry| Arc::clone(&entry.container))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&ContainerEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.bus.unsubscribe(token)
    }
}

/// Configures which enrichment steps a [`ContainerCollection`] performs.
#[derive(Debug, Default)]
pub struct CollectionBuilder {
    proc: Option<ProcFs>,
    host_root: Option<PathBuf>,
    cgroup_mounts: Option<CgroupMounts>,
    runtimes: Vec<Arc<dyn RuntimeClient>>,
}

impl CollectionBuilder {
    /// Resolves namespaces and cgroups through `/proc` below `host_root`.
    pub fn set_host_root(&mut self, host_root: impl AsRef<Path>) -> &mut Self {
        let host_root = host_root.as_ref();
        self.proc = Some(ProcFs::under(host_root));
        self.host_root = Some(host_root.to_path_buf());
        self
    }

    /// Enables cgroup id resolution against the given hierarchy mount points.
    pub fn set_cgroup_mounts(&mut self, mounts: CgroupMounts) -> &mut Self {
        self.cgroup_mounts = Some(mounts);
        self
    }

    /// Adds a runtime queried for pod metadata. Runtimes are asked in the
    /// order they were added.
    pub fn add_runtime_client(&mut self, client: Arc<dyn RuntimeClient>) -> &mut Self {
        self.runtimes.push(client);
        self
    }

    pub fn build(&mut self) -> ContainerCollection {
        ContainerCollection {
            containers: DashMap::new(),
            bus: PubSub::default(),
            enricher: Enricher {
                proc: self.proc.take(),
                host_root: self.host_root.take().unwrap_or_else(|| PathBuf::from("/")),
                cgroup_mounts: self.cgroup_mounts.take(),
                runtimes: std::mem::take(&mut self.runtimes),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::container::{ContainerID, EventKind};
    use crate::runtime::{self, ContainerState, RuntimeContainer};

    fn container(id: &str, mntns: u64, podname: &str) -> Container {
        let mut c = Container::new(ContainerID::new(id).unwrap(), 0);
        c.mntns = mntns;
        c.podname = podname.to_owned();
        c.name = format!("{id}-name");
        c
    }

    fn record(collection: &ContainerCollection) -> Arc<Mutex<Vec<(EventKind, String)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        collection.subscribe(move |e: &ContainerEvent| {
            sink.lock()
                .unwrap()
                .push((e.kind, e.container.id.to_string()));
        });
        events
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let collection = ContainerCollection::default();
        let events = record(&collection);

        assert!(collection.add_container(container("a", 5, "p")).await.unwrap());
        assert!(!collection.add_container(container("a", 5, "p")).await.unwrap());
        assert_eq!(collection.len(), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_without_mntns_is_rejected() {
        let collection = ContainerCollection::default();
        let err = collection
            .add_container(container("a", 0, "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingMntNs(_)));
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn test_mntns_conflict() {
        let collection = ContainerCollection::default();
        collection.add_container(container("a", 5, "p")).await.unwrap();
        let err = collection
            .add_container(container("b", 5, "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MntNsConflict { mntns: 5, .. }));
    }

    #[tokio::test]
    async fn test_remove_publishes_once() {
        let collection = ContainerCollection::default();
        let events = record(&collection);
        collection.add_container(container("a", 5, "p")).await.unwrap();

        assert!(collection.remove_container("a").is_some());
        assert!(collection.remove_container("a").is_none());
        assert!(collection.remove_container("unknown").is_none());
        assert!(collection.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (EventKind::Add, "a".to_owned()),
                (EventKind::Remove, "a".to_owned())
            ]
        );
    }

    #[tokio::test]
    async fn test_container_visible_to_add_subscriber_and_not_after_remove() {
        let collection = Arc::new(ContainerCollection::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let weak = Arc::downgrade(&collection);
            let seen = Arc::clone(&seen);
            collection.subscribe(move |e: &ContainerEvent| {
                let Some(collection) = weak.upgrade() else {
                    return;
                };
                let visible = collection.contains_id(e.container.id.as_str());
                seen.lock().unwrap().push((e.kind, visible));
            });
        }
        collection.add_container(container("a", 5, "p")).await.unwrap();
        collection.remove_container("a");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(EventKind::Add, true), (EventKind::Remove, false)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_waits_for_add_fanout() {
        let collection = Arc::new(ContainerCollection::default());
        collection.subscribe(|e: &ContainerEvent| {
            if e.kind == EventKind::Add {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        });
        let events = record(&collection);

        let adding = {
            let collection = Arc::clone(&collection);
            tokio::spawn(async move { collection.add_container(container("a", 5, "p")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let removed = tokio::task::spawn_blocking({
            let collection = Arc::clone(&collection);
            move || collection.remove_container("a")
        })
        .await
        .unwrap();

        assert!(adding.await.unwrap().unwrap());
        assert!(removed.is_some());
        assert!(collection.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (EventKind::Add, "a".to_owned()),
                (EventKind::Remove, "a".to_owned())
            ]
        );
    }

    #[tokio::test]
    async fn test_select() {
        let collection = ContainerCollection::default();
        collection.add_container(container("b", 6, "q")).await.unwrap();
        collection.add_container(container("a", 5, "p")).await.unwrap();

        let selector = Selector {
            podname: "p".to_owned(),
            ..Default::default()
        };
        let ids: Vec<_> = collection
            .select(&selector)
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(collection.containers().len(), 2);
        assert_eq!(
            collection.get(MntNsId::new(6).unwrap()).unwrap().podname,
            "q"
        );
    }

    #[derive(Debug)]
    struct FakeRuntime {
        name: &'static str,
        known: Vec<RuntimeContainer>,
    }

    #[async_trait::async_trait]
    impl RuntimeClient for FakeRuntime {
        fn name(&self) -> &str {
            self.name
        }

        async fn list_containers(&self) -> runtime::Result<Vec<RuntimeContainer>> {
            Ok(self.known.clone())
        }

        async fn get_container(&self, id: &str) -> runtime::Result<RuntimeContainer> {
            self.known
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| runtime::Error::NotFound {
                    runtime: self.name.to_owned(),
                    id: id.to_owned(),
                })
        }
    }

    #[tokio::test]
    async fn test_first_runtime_that_knows_the_container_wins() {
        let rc = |pod: &str| RuntimeContainer {
            id: "a".to_owned(),
            name: "nginx".to_owned(),
            pod_namespace: "default".to_owned(),
            pod_name: pod.to_owned(),
            state: ContainerState::Running,
            pid: 0,
            labels: [("app".to_owned(), "web".to_owned())].into_iter().collect(),
        };
        let collection = ContainerCollection::builder()
            .add_runtime_client(Arc::new(FakeRuntime {
                name: "empty",
                known: Vec::new(),
            }))
            .add_runtime_client(Arc::new(FakeRuntime {
                name: "first",
                known: vec![rc("web-0")],
            }))
            .add_runtime_client(Arc::new(FakeRuntime {
                name: "second",
                known: vec![rc("web-1")],
            }))
            .build();

        let mut c = Container::new(ContainerID::new("a").unwrap(), 0);
        c.mntns = 5;
        collection.add_container(c).await.unwrap();

        let c = collection.get_by_id("a").unwrap();
        assert_eq!(c.namespace, "default");
        assert_eq!(c.podname, "web-0");
        assert_eq!(c.name, "nginx");
        assert_eq!(c.labels.get("app").map(String::as_str), Some("web"));
    }
}
