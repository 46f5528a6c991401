//! Tracers and their per-tracer mount namespace filter maps.
//!
//! Each tracer owns a pinned `mntnsset_<id>` hash map holding the mount
//! namespaces of all containers its selector matches. Gadget BPF programs
//! only report events of tasks whose mount namespace is in the set.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::bpf::{self, KernelMap, MapProvider, MapSpec};
use crate::collection::ContainerCollection;
use crate::container::{Container, ContainerEvent, EventKind, Selector};
use crate::error::ResultOkLogExt;
use crate::pubsub::SubscriptionToken;

mod error;
mod stream;

pub use error::{Error, Result};
pub use stream::{GadgetStream, HISTORY_LEN, Subscription};

pub const FILTER_MAP_NAME: &str = "mntnsset";
const FILTER_MAP_PREFIX: &str = "mntnsset_";
const FILTER_MAX_ENTRIES: u32 = 1024;

fn filter_spec() -> MapSpec {
    MapSpec {
        name: FILTER_MAP_NAME.to_owned(),
        key_size: std::mem::size_of::<u64>() as u32,
        value_size: std::mem::size_of::<u32>() as u32,
        max_entries: FILTER_MAX_ENTRIES,
    }
}

#[derive(Debug)]
struct Tracer {
    selector: Selector,
    filter: Arc<dyn KernelMap>,
    pin: PathBuf,
    stream: Arc<GadgetStream>,
}

impl Tracer {
    fn insert(&self, container: &Container) -> bpf::Result<()> {
        match container.mntns_id() {
            Some(mntns) => self
                .filter
                .update(&mntns.as_raw().to_ne_bytes(), &1u32.to_ne_bytes()),
            None => Ok(()),
        }
    }

    fn remove(&self, container: &Container) -> bpf::Result<()> {
        if let Some(mntns) = container.mntns_id() {
            self.filter.delete(&mntns.as_raw().to_ne_bytes())?;
        }
        Ok(())
    }

    fn mntns_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .filter
            .keys()
            .ok_log()
            .unwrap_or_default()
            .iter()
            .filter_map(|key| key.as_slice().try_into().ok().map(u64::from_ne_bytes))
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Snapshot of a tracer for introspection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TracerInfo {
    pub id: String,
    pub selector: Selector,
    pub pin: PathBuf,
    pub mntns: Vec<u64>,
}

#[derive(Debug)]
pub struct TracerCollection {
    tracers: Mutex<HashMap<String, Tracer>>,
    containers: Arc<ContainerCollection>,
    provider: Arc<dyn MapProvider>,
    pin_dir: PathBuf,
    subscription: SubscriptionToken,
}

impl TracerCollection {
    /// Creates the collection and subscribes it to container events.
    pub fn new(
        containers: Arc<ContainerCollection>,
        provider: Arc<dyn MapProvider>,
        pin_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let subscription = containers.subscribe(move |event| {
                if let Some(tracers) = weak.upgrade() {
                    tracers.handle_event(event);
                }
            });
            Self {
                tracers: Mutex::new(HashMap::new()),
                containers,
                provider,
                pin_dir: pin_dir.into(),
                subscription,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracer>> {
        self.tracers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn filter_pin_path(&self, id: &str) -> PathBuf {
        self.pin_dir
            .join(format!("{FILTER_MAP_PREFIX}{}", bpf::sanitize_pin_name(id)))
    }

    /// Registers a tracer and fills its filter with the matching containers.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] for an empty id.
    /// - [`Error::AlreadyExists`] if the id is taken.
    /// - [`Error::PinInUse`] if another tracer owns the filter pin.
    /// - [`Error::Bpf`] if the filter map cannot be created.
    pub fn add_tracer(&self, id: &str, selector: Selector) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId(id.to_owned()));
        }
        let mut tracers = self.lock();
        if tracers.contains_key(id) {
            return Err(Error::AlreadyExists(id.to_owned()));
        }

        let pin = self.filter_pin_path(id);
        if let Some((owner, _)) = tracers.iter().find(|(_, t)| t.pin == pin) {
            return Err(Error::PinInUse {
                id: id.to_owned(),
                owner: owner.clone(),
                pin,
            });
        }
        let filter = self.provider.open_pinned(&filter_spec(), &pin)?;
        let tracer = Tracer {
            selector,
            filter,
            pin,
            stream: Arc::new(GadgetStream::default()),
        };
        // Enumerated under the tracers lock: a concurrent event waits for it.
        for container in self.containers.select(&tracer.selector) {
            if let Err(err) = tracer.insert(&container) {
                self.provider.unpin(&tracer.pin).ok_log();
                return Err(err.into());
            }
        }
        log::info!(
            "Added tracer `{id}` with selector {} ({} containers)",
            tracer.selector,
            tracer.mntns_ids().len()
        );
        tracers.insert(id.to_owned(), tracer);
        Ok(())
    }

    /// Unregisters a tracer, unpins its filter and ends its stream.
    pub fn remove_tracer(&self, id: &str) -> Result<()> {
        let tracer = self
            .lock()
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;
        tracer.stream.close();
        self.provider.unpin(&tracer.pin)?;
        log::info!("Removed tracer `{id}`");
        Ok(())
    }

    pub fn tracer_exists(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn stream(&self, id: &str) -> Result<Arc<GadgetStream>> {
        self.lock()
            .get(id)
            .map(|t| Arc::clone(&t.stream))
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    pub fn selector(&self, id: &str) -> Result<Selector> {
        self.lock()
            .get(id)
            .map(|t| t.selector.clone())
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Mount namespaces in the tracer's filter, sorted.
    pub fn filter_mntns(&self, id: &str) -> Result<Vec<u64>> {
        self.lock()
            .get(id)
            .map(Tracer::mntns_ids)
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// All tracers, ordered by id.
    pub fn tracers(&self) -> Vec<TracerInfo> {
        let mut out: Vec<TracerInfo> = self
            .lock()
            .iter()
            .map(|(id, t)| TracerInfo {
                id: id.clone(),
                selector: t.selector.clone(),
                pin: t.pin.clone(),
                mntns: t.mntns_ids(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn handle_event(&self, event: &ContainerEvent) {
        let tracers = self.lock();
        for (id, tracer) in tracers.iter() {
            let result = match event.kind {
                EventKind::Add if tracer.selector.matches(&event.container) => {
                    tracer.insert(&event.container)
                }
                EventKind::Add => Ok(()),
                EventKind::Remove => tracer.remove(&event.container),
            };
            if let Err(err) = result {
                log::warn!(
                    "tracer `{id}`: failed to update filter for container `{}`: {err}",
                    event.container.id
                );
            }
        }
    }

    /// Removes every tracer and its pin.
    pub fn close(&self) {
        let tracers: Vec<(String, Tracer)> = self.lock().drain().collect();
        for (_, tracer) in tracers {
            tracer.stream.close();
            self.provider.unpin(&tracer.pin).ok_log();
        }
    }

    pub fn pin_dir(&self) -> &Path {
        &self.pin_dir
    }
}

impl Drop for TracerCollection {
    fn drop(&mut self) {
        self.containers.unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::MemoryMaps;
    use crate::container::ContainerID;

    fn setup() -> (Arc<MemoryMaps>, Arc<ContainerCollection>, Arc<TracerCollection>) {
        let maps = Arc::new(MemoryMaps::default());
        let containers = Arc::new(ContainerCollection::default());
        let tracers = TracerCollection::new(containers.clone(), maps.clone(), "/pin");
        (maps, containers, tracers)
    }

    fn container(id: &str, mntns: u64, podname: &str) -> Container {
        let mut c = Container::new(ContainerID::new(id).unwrap(), 0);
        c.mntns = mntns;
        c.namespace = "default".to_owned();
        c.podname = podname.to_owned();
        c.name = "main".to_owned();
        c
    }

    fn pod(name: &str) -> Selector {
        Selector {
            podname: name.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_filter_follows_container_churn() {
        let (_maps, containers, tracers) = setup();
        tracers.add_tracer("t1", pod("p")).unwrap();

        containers.add_container(container("a", 5, "p")).await.unwrap();
        assert_eq!(tracers.filter_mntns("t1").unwrap(), vec![5]);

        containers.add_container(container("b", 6, "q")).await.unwrap();
        assert_eq!(tracers.filter_mntns("t1").unwrap(), vec![5]);

        containers.remove_container("a");
        assert!(tracers.filter_mntns("t1").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_remove_leaves_no_stale_filter_entry() {
        let maps = Arc::new(MemoryMaps::default());
        let containers = Arc::new(ContainerCollection::default());
        containers.subscribe(|e: &ContainerEvent| {
            if e.kind == EventKind::Add {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        });
        let tracers = TracerCollection::new(containers.clone(), maps, "/pin");
        tracers.add_tracer("t1", pod("p")).unwrap();

        let adding = {
            let containers = Arc::clone(&containers);
            tokio::spawn(async move { containers.add_container(container("a", 5, "p")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let removed = tokio::task::spawn_blocking({
            let containers = Arc::clone(&containers);
            move || containers.remove_container("a")
        })
        .await
        .unwrap();
        adding.await.unwrap().unwrap();

        assert!(removed.is_some());
        assert!(containers.is_empty());
        assert!(tracers.filter_mntns("t1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_tracer_picks_up_existing_containers() {
        let (_maps, containers, tracers) = setup();
        containers.add_container(container("a", 5, "p")).await.unwrap();
        containers.add_container(container("b", 6, "q")).await.unwrap();

        tracers.add_tracer("all", Selector::default()).unwrap();
        tracers.add_tracer("p", pod("p")).unwrap();
        assert_eq!(tracers.filter_mntns("all").unwrap(), vec![5, 6]);
        assert_eq!(tracers.filter_mntns("p").unwrap(), vec![5]);
    }

    #[test]
    fn test_duplicate_and_unknown_ids() {
        let (maps, _containers, tracers) = setup();
        tracers.add_tracer("t1", Selector::default()).unwrap();
        assert!(matches!(
            tracers.add_tracer("t1", Selector::default()),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            tracers.add_tracer("", Selector::default()),
            Err(Error::InvalidId(_))
        ));
        assert!(matches!(tracers.remove_tracer("nope"), Err(Error::NotFound(_))));
        assert!(matches!(tracers.stream("nope"), Err(Error::NotFound(_))));

        let pin = tracers.filter_pin_path("t1");
        assert_eq!(pin, PathBuf::from("/pin/mntnsset_t1"));
        assert!(maps.is_pinned(&pin));
        tracers.remove_tracer("t1").unwrap();
        assert!(!maps.is_pinned(&pin));
        assert!(!tracers.tracer_exists("t1"));
    }

    #[tokio::test]
    async fn test_similar_ids_get_separate_filters() {
        let (maps, containers, tracers) = setup();
        containers.add_container(container("a", 5, "p")).await.unwrap();

        tracers.add_tracer("ns/t", pod("p")).unwrap();
        tracers.add_tracer("ns:t", pod("zzz")).unwrap();
        tracers.add_tracer("ns_t", pod("zzz")).unwrap();
        assert_ne!(tracers.filter_pin_path("ns/t"), tracers.filter_pin_path("ns:t"));
        assert_eq!(tracers.filter_mntns("ns/t").unwrap(), vec![5]);
        assert!(tracers.filter_mntns("ns:t").unwrap().is_empty());

        tracers.remove_tracer("ns:t").unwrap();
        assert!(maps.is_pinned(&tracers.filter_pin_path("ns/t")));
        assert_eq!(tracers.filter_mntns("ns/t").unwrap(), vec![5]);
    }

    #[test]
    fn test_pin_owned_by_other_tracer() {
        let (_maps, _containers, tracers) = setup();
        tracers.add_tracer("t1", Selector::default()).unwrap();
        let pin = tracers.filter_pin_path("t1");
        {
            let mut guard = tracers.lock();
            let tracer = guard.remove("t1").unwrap();
            guard.insert("other".to_owned(), tracer);
        }

        match tracers.add_tracer("t1", Selector::default()) {
            Err(Error::PinInUse { owner, pin: p, .. }) => {
                assert_eq!(owner, "other");
                assert_eq!(p, pin);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(tracers.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_tracer_ends_stream() {
        let (_maps, _containers, tracers) = setup();
        tracers.add_tracer("t1", Selector::default()).unwrap();
        let stream = tracers.stream("t1").unwrap();
        let mut sub = stream.subscribe();
        stream.publish("line".to_owned()).await;
        tracers.remove_tracer("t1").unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("line"));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_collection_unsubscribes() {
        let (_maps, containers, tracers) = setup();
        drop(tracers);
        containers.add_container(container("a", 5, "p")).await.unwrap();
    }

    #[test]
    fn test_tracers_listing_and_close() {
        let (maps, _containers, tracers) = setup();
        tracers.add_tracer("b", pod("q")).unwrap();
        tracers.add_tracer("a", Selector::default()).unwrap();
        let ids: Vec<_> = tracers.tracers().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        tracers.close();
        assert!(tracers.is_empty());
        assert!(!maps.is_pinned(Path::new("/pin/mntnsset_a")));
    }
}
