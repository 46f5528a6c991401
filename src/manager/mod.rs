//! Process-wide owner of the container and tracer state.
//!
//! [`TracerManager`] wires a [`RuntimeWatcher`] into the container collection
//! and exposes the operations served over gRPC: tracers, manual container
//! injection, output streams and a debug dump.
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bpf::{self, MapProvider, MemoryMaps};
use crate::collection::ContainerCollection;
use crate::container::{Container, ContainerID, MntNsId, Selector};
use crate::containers_map::ContainersMap;
use crate::error::ResultOkLogExt;
use crate::event::Event;
use crate::gadget::{self, Gadget, GadgetContext, GadgetRegistry};
use crate::mountinfo::CgroupMounts;
use crate::pubsub::SubscriptionToken;
use crate::runtime::RuntimeClient;
use crate::tracer::{GadgetStream, Subscription, TracerCollection, TracerInfo};
use crate::watcher::{self, CloseFlag, RuntimeEvent, RuntimeWatcher, WatcherKind, WatcherOptions};

mod error;

pub use error::{Error, Result};

const RUNTIME_EVENT_BUFFER: usize = 64;

/// Manages containers, tracers and the kernel tables shared with gadgets.
pub struct TracerManager {
    containers: Arc<ContainerCollection>,
    tracers: Arc<TracerCollection>,
    containers_map: Arc<ContainersMap>,
    map_subscription: SubscriptionToken,
    runtimes: Vec<Arc<dyn RuntimeClient>>,
    host_root: PathBuf,
    watcher: Mutex<Option<Arc<dyn RuntimeWatcher>>>,
    gadgets: GadgetRegistry,
    running: Mutex<HashMap<String, Box<dyn Gadget>>>,
    node_name: String,
    closed: CloseFlag,
}

impl std::fmt::Debug for TracerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerManager")
            .field("containers", &self.containers.len())
            .field("tracers", &self.tracers.len())
            .field("pin_dir", &self.tracers.pin_dir())
            .field("node_name", &self.node_name)
            .finish()
    }
}

impl TracerManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    fn watcher(&self) -> MutexGuard<'_, Option<Arc<dyn RuntimeWatcher>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, Box<dyn Gadget>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a runtime watcher and feeds its events into the collection.
    ///
    /// Returns `false` if no watcher was started, either because `kind` is
    /// [`WatcherKind::None`] or because automatic selection found nothing
    /// supported.
    pub fn start_watcher(self: &Arc<Self>, kind: WatcherKind, poll_interval: Duration) -> Result<bool> {
        if self.closed.is_closed() {
            return Err(Error::Closed);
        }
        let (tx, rx) = mpsc::channel(RUNTIME_EVENT_BUFFER);
        let options = WatcherOptions {
            host_root: self.host_root.clone(),
            poll_interval,
            runtimes: self.runtimes.clone(),
        };
        let Some(watcher) = watcher::start(kind, &options, tx)? else {
            log::warn!("No runtime watcher running, containers are only added through the API");
            return Ok(false);
        };
        log::info!("Started {} watcher", watcher.name());
        if let Some(previous) = self.watcher().replace(watcher) {
            previous.close();
        }
        tokio::spawn(consume_runtime_events(Arc::downgrade(self), rx));
        Ok(true)
    }

    /// Applies one event of the runtime watcher to the collection.
    pub async fn handle_runtime_event(&self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Add { id, pid, config } => {
                let mut container = Container::new(id, pid);
                if let Some(config) = config {
                    config.apply_to(&mut container);
                }
                let id = container.id.clone();
                if let Err(err) = self.containers.add_container(container).await {
                    log::warn!("Failed to add container `{id}`: {err}");
                }
            }
            RuntimeEvent::Remove { id, pid } => {
                if self.containers.remove_container(id.as_str()).is_none() {
                    log::debug!("Ignoring remove of unknown container `{id}` (pid {pid})");
                }
            }
        }
    }

    /// Adds the containers that were running before the watcher started and
    /// registers termination watches for them. Returns how many were added.
    pub async fn inject_initial_containers(&self) -> usize {
        let watcher = self.watcher().clone();
        let mut added = 0;
        for runtime in &self.runtimes {
            let listed = match runtime.list_containers().await {
                Ok(listed) => listed,
                Err(err) => {
                    log::warn!("Failed to list containers of {}: {err}", runtime.name());
                    continue;
                }
            };
            for rc in listed {
                let Some(id) = ContainerID::new(&rc.id)
                    .ok_log_at(log::Level::Warn, runtime.name())
                else {
                    continue;
                };
                let mut container = Container::new(id.clone(), rc.pid);
                container.namespace = rc.pod_namespace;
                container.podname = rc.pod_name;
                container.name = rc.name;
                container.labels = rc.labels;
                match self.containers.add_container(container).await {
                    Ok(true) => added += 1,
                    Ok(false) => continue,
                    Err(err) => {
                        log::warn!("Failed to add initial container `{id}`: {err}");
                        continue;
                    }
                }
                let (Some(watcher), Some(tracked)) = (&watcher, self.containers.get_by_id(id.as_str())) else {
                    continue;
                };
                if let Err(err) = watcher.add_watch_container_termination(&id, tracked.pid) {
                    log::warn!("Failed to watch termination of container `{id}`: {err}");
                }
            }
        }
        log::info!("Injected {added} initial containers");
        added
    }

    pub fn add_tracer(&self, id: &str, selector: Selector) -> Result<()> {
        if self.closed.is_closed() {
            return Err(Error::Closed);
        }
        self.tracers.add_tracer(id, selector)?;
        Ok(())
    }

    /// Stops the tracer's gadget, if any, and removes the tracer.
    pub fn remove_tracer(&self, id: &str) -> Result<()> {
        let gadget = self.running().remove(id);
        if let Some(mut gadget) = gadget {
            log::debug!("Stopping gadget of tracer `{id}`");
            gadget.stop();
        }
        self.tracers.remove_tracer(id)?;
        Ok(())
    }

    pub fn tracer_exists(&self, id: &str) -> bool {
        self.tracers.tracer_exists(id)
    }

    /// Subscribes to the output stream of a tracer. The returned stream is
    /// needed to unsubscribe.
    pub fn receive_stream(&self, id: &str) -> Result<(Arc<GadgetStream>, Subscription)> {
        let stream = self.tracers.stream(id)?;
        let subscription = stream.subscribe();
        Ok((stream, subscription))
    }

    /// Publishes one output line on a tracer's stream.
    pub async fn publish_event(&self, tracer_id: &str, line: String) -> Result<()> {
        let stream = self.tracers.stream(tracer_id)?;
        stream.publish(line).await;
        Ok(())
    }

    /// Adds a container supplied by an external caller.
    ///
    /// # Errors
    ///
    /// - [`Error::ContainerExists`] if a container with the same id is tracked.
    /// - [`Error::Collection`] if its mount namespace is unknown or taken.
    pub async fn add_container(&self, container: Container) -> Result<()> {
        if self.closed.is_closed() {
            return Err(Error::Closed);
        }
        let id = container.id.clone();
        if self.containers.contains_id(id.as_str()) {
            return Err(Error::ContainerExists(id.to_string()));
        }
        if self.containers.add_container(container).await? {
            Ok(())
        } else {
            Err(Error::ContainerExists(id.to_string()))
        }
    }

    pub fn remove_container(&self, id: &str) -> Result<Arc<Container>> {
        self.containers
            .remove_container(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_owned()))
    }

    /// Removes the container owning the given mount namespace.
    pub fn remove_container_by_mntns(&self, mntns: MntNsId) -> Result<Arc<Container>> {
        let container = self
            .containers
            .get(mntns)
            .ok_or_else(|| Error::ContainerNotFound(format!("mntns {mntns}")))?;
        self.remove_container(container.id.as_str())
    }

    /// Tracked containers, ordered by id.
    pub fn list_containers(&self) -> Vec<Arc<Container>> {
        self.containers.select(&Selector::default())
    }

    pub fn list_tracers(&self) -> Vec<TracerInfo> {
        self.tracers.tracers()
    }

    /// Registered gadgets as `(name, description)`.
    pub fn list_gadgets(&self) -> Vec<(String, String)> {
        self.gadgets.list()
    }

    /// Starts a registered gadget for an existing tracer and announces it
    /// with a `ready` event on the tracer's stream.
    pub async fn start_gadget(
        &self,
        tracer_id: &str,
        name: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<()> {
        let ctx = GadgetContext {
            tracer_id: tracer_id.to_owned(),
            selector: self.tracers.selector(tracer_id)?,
            filter_pin: self.tracers.filter_pin_path(tracer_id),
            node: self.node_name.clone(),
            parameters,
            stream: self.tracers.stream(tracer_id)?,
        };
        let stream = Arc::clone(&ctx.stream);
        {
            let mut running = self.running();
            if running.contains_key(tracer_id) {
                return Err(gadget::Error::AlreadyRunning(tracer_id.to_owned()).into());
            }
            let mut gadget = self.gadgets.create(name)?;
            gadget.start(ctx)?;
            running.insert(tracer_id.to_owned(), gadget);
        }
        log::info!("Started gadget `{name}` for tracer `{tracer_id}`");

        let ready = Event::ready().with_node(&self.node_name);
        if let Some(line) = ready.to_line().ok_log() {
            stream.publish(line).await;
        }
        Ok(())
    }

    /// Human readable snapshot of all containers and tracers.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let containers = self.list_containers();
        let _ = writeln!(out, "List of containers ({}):", containers.len());
        for c in &containers {
            let _ = writeln!(
                out,
                "{} pid={} mntns={} netns={} namespace={} pod={} container={} cgroup={}",
                c.id, c.pid, c.mntns, c.netns, c.namespace, c.podname, c.name, c.cgroup_path
            );
        }

        let tracers = self.list_tracers();
        let _ = writeln!(out, "List of tracers ({}):", tracers.len());
        for t in &tracers {
            let _ = writeln!(
                out,
                "{} selector={} mntns={:?} pin={}",
                t.id,
                t.selector,
                t.mntns,
                t.pin.display()
            );
        }

        let _ = writeln!(
            out,
            "Containers map {}: mntns={:?}",
            self.containers_map.pin_path().display(),
            self.containers_map.mntns_ids()
        );
        out
    }

    pub fn containers(&self) -> &Arc<ContainerCollection> {
        &self.containers
    }

    pub fn containers_map(&self) -> &ContainersMap {
        &self.containers_map
    }

    pub fn filter_mntns(&self, tracer_id: &str) -> Result<Vec<u64>> {
        Ok(self.tracers.filter_mntns(tracer_id)?)
    }

    pub fn pin_dir(&self) -> &Path {
        self.tracers.pin_dir()
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Stops the watcher and gadgets, then removes every pin. Safe to call
    /// more than once.
    pub fn close(&self) {
        if self.closed.is_closed() {
            return;
        }
        self.closed.close();
        if let Some(watcher) = self.watcher().take() {
            watcher.close();
        }
        let gadgets: Vec<(String, Box<dyn Gadget>)> = self.running().drain().collect();
        for (tracer_id, mut gadget) in gadgets {
            log::debug!("Stopping gadget of tracer `{tracer_id}`");
            gadget.stop();
        }
        self.tracers.close();
        self.containers.unsubscribe(self.map_subscription);
        self.containers_map.close();
        log::info!("Tracer manager closed");
    }
}

async fn consume_runtime_events(manager: Weak<TracerManager>, mut rx: mpsc::Receiver<RuntimeEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager.is_closed() {
            break;
        }
        manager.handle_runtime_event(event).await;
    }
    log::debug!("Runtime event consumer stopped");
}

/// Configures and creates a [`TracerManager`].
#[derive(Default)]
pub struct ManagerBuilder {
    host_root: Option<PathBuf>,
    pin_path: Option<PathBuf>,
    cgroup_mounts: Option<CgroupMounts>,
    runtimes: Vec<Arc<dyn RuntimeClient>>,
    provider: Option<Arc<dyn MapProvider>>,
    gadgets: GadgetRegistry,
    node_name: String,
}

impl ManagerBuilder {
    /// Enables `/proc` and cgroup enrichment below `host_root`.
    pub fn set_host_root(&mut self, host_root: impl Into<PathBuf>) -> &mut Self {
        self.host_root = Some(host_root.into());
        self
    }

    /// Directory holding the containers map and the tracer filter maps.
    pub fn set_pin_path(&mut self, pin_path: impl Into<PathBuf>) -> &mut Self {
        self.pin_path = Some(pin_path.into());
        self
    }

    pub fn set_cgroup_mounts(&mut self, mounts: CgroupMounts) -> &mut Self {
        self.cgroup_mounts = Some(mounts);
        self
    }

    pub fn add_runtime_client(&mut self, client: Arc<dyn RuntimeClient>) -> &mut Self {
        self.runtimes.push(client);
        self
    }

    /// Backend of the kernel tables. Defaults to in-memory tables.
    pub fn set_map_provider(&mut self, provider: Arc<dyn MapProvider>) -> &mut Self {
        self.provider = Some(provider);
        self
    }

    pub fn set_gadget_registry(&mut self, gadgets: GadgetRegistry) -> &mut Self {
        self.gadgets = gadgets;
        self
    }

    pub fn set_node_name(&mut self, node_name: impl Into<String>) -> &mut Self {
        self.node_name = node_name.into();
        self
    }

    /// Creates the pin directory and the containers map.
    pub fn build(&mut self) -> Result<Arc<TracerManager>> {
        let pin_path = self
            .pin_path
            .take()
            .unwrap_or_else(|| PathBuf::from(bpf::DEFAULT_PIN_PATH));
        let pin_dir = bpf::create_pin_dir(&pin_path)?;
        let provider = self
            .provider
            .take()
            .unwrap_or_else(|| Arc::new(MemoryMaps::default()));

        let mut collection = ContainerCollection::builder();
        if let Some(host_root) = &self.host_root {
            collection.set_host_root(host_root);
        }
        if let Some(mounts) = self.cgroup_mounts.take() {
            collection.set_cgroup_mounts(mounts);
        }
        for runtime in &self.runtimes {
            collection.add_runtime_client(Arc::clone(runtime));
        }
        let containers = Arc::new(collection.build());

        let containers_map = Arc::new(ContainersMap::new(Arc::clone(&provider), &pin_dir)?);
        let map_subscription = {
            let map = Arc::clone(&containers_map);
            containers.subscribe(move |event| map.handle_event(event))
        };
        let tracers = TracerCollection::new(Arc::clone(&containers), provider, pin_dir);

        Ok(Arc::new(TracerManager {
            containers,
            tracers,
            containers_map,
            map_subscription,
            runtimes: std::mem::take(&mut self.runtimes),
            host_root: self.host_root.take().unwrap_or_else(|| PathBuf::from("/")),
            watcher: Mutex::new(None),
            gadgets: std::mem::take(&mut self.gadgets),
            running: Mutex::new(HashMap::new()),
            node_name: std::mem::take(&mut self.node_name),
            closed: CloseFlag::default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::proc::testutil::fake_pid;
    use crate::runtime::{self, ContainerState, RuntimeContainer};
    use crate::watcher::oci;

    fn manager(pin_dir: &Path) -> Arc<TracerManager> {
        TracerManager::builder()
            .set_pin_path(pin_dir.join("gadget"))
            .set_node_name("node-1")
            .build()
            .unwrap()
    }

    fn container(id: &str, mntns: u64, podname: &str) -> Container {
        let mut c = Container::new(ContainerID::new(id).unwrap(), 0);
        c.mntns = mntns;
        c.namespace = "default".to_owned();
        c.podname = podname.to_owned();
        c.name = format!("{id}-name");
        c
    }

    fn mntns(raw: u64) -> MntNsId {
        MntNsId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_tracer_filter_follows_containers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let selector = Selector {
            podname: "p".to_owned(),
            ..Default::default()
        };
        manager.add_tracer("t1", selector).unwrap();

        manager.add_container(container("c5", 5, "p")).await.unwrap();
        assert_eq!(manager.filter_mntns("t1").unwrap(), vec![5]);

        manager.add_container(container("c6", 6, "q")).await.unwrap();
        assert_eq!(manager.filter_mntns("t1").unwrap(), vec![5]);
        assert_eq!(manager.containers_map().mntns_ids(), vec![5, 6]);

        manager.remove_container_by_mntns(mntns(5)).unwrap();
        assert!(manager.filter_mntns("t1").unwrap().is_empty());
        assert_eq!(manager.containers_map().mntns_ids(), vec![6]);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_containers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add_container(container("c1", 7, "p")).await.unwrap();
        assert!(matches!(
            manager.add_container(container("c1", 7, "p")).await,
            Err(Error::ContainerExists(id)) if id == "c1"
        ));
        assert!(matches!(
            manager.add_container(container("c2", 7, "p")).await,
            Err(Error::Collection(_))
        ));
        assert!(matches!(
            manager.remove_container("nope"),
            Err(Error::ContainerNotFound(_))
        ));
        assert!(matches!(
            manager.remove_container_by_mntns(mntns(99)),
            Err(Error::ContainerNotFound(_))
        ));

        manager.remove_container("c1").unwrap();
        assert!(matches!(
            manager.remove_container("c1"),
            Err(Error::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_container_is_not_in_containers_map() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let mut pause = container("sandbox", 8, "p");
        pause.name.clear();
        manager.add_container(pause).await.unwrap();
        manager.add_container(container("app", 9, "p")).await.unwrap();

        assert_eq!(manager.list_containers().len(), 2);
        assert_eq!(manager.containers_map().mntns_ids(), vec![9]);
        let entry = manager.containers_map().lookup(mntns(9)).unwrap();
        assert_eq!(entry.container_id, "app");
    }

    #[tokio::test]
    async fn test_duplicate_tracer() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add_tracer("t1", Selector::default()).unwrap();
        assert!(matches!(
            manager.add_tracer("t1", Selector::default()),
            Err(Error::Tracer(crate::tracer::Error::AlreadyExists(_)))
        ));
        manager.remove_tracer("t1").unwrap();
        assert!(matches!(
            manager.remove_tracer("t1"),
            Err(Error::Tracer(crate::tracer::Error::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_when_tracer_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add_tracer("t1", Selector::default()).unwrap();
        manager
            .publish_event("t1", "early".to_owned())
            .await
            .unwrap();

        let (_stream, mut subscription) = manager.receive_stream("t1").unwrap();
        manager.publish_event("t1", "late".to_owned()).await.unwrap();
        assert_eq!(subscription.recv().await.as_deref(), Some("early"));
        assert_eq!(subscription.recv().await.as_deref(), Some("late"));

        manager.remove_tracer("t1").unwrap();
        assert_eq!(subscription.recv().await, None);
        assert!(manager.receive_stream("t1").is_err());
    }

    #[tokio::test]
    async fn test_dump_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add_container(container("c1", 11, "p")).await.unwrap();
        manager
            .add_tracer(
                "t1",
                Selector {
                    namespace: "default".to_owned(),
                    ..Default::default()
                },
            )
            .unwrap();

        let dump = manager.dump_state();
        assert!(dump.contains("List of containers (1):"));
        assert!(dump.contains("c1 pid=0 mntns=11"));
        assert!(dump.contains("t1 selector={namespace=default} mntns=[11]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dump_state_during_churn() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add_tracer("all", Selector::default()).unwrap();

        let writer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for i in 1..=200u64 {
                    let id = format!("c{i}");
                    manager.add_container(container(&id, i, "p")).await.unwrap();
                    if i % 2 == 0 {
                        manager.remove_container(&id).unwrap();
                    }
                }
            })
        };
        let reader = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let dump = manager.dump_state();
                    assert!(dump.starts_with("List of containers"));
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();

        assert_eq!(manager.list_containers().len(), 100);
        let expected: Vec<u64> = (1..=200).filter(|i| i % 2 == 1).collect();
        assert_eq!(manager.filter_mntns("all").unwrap(), expected);
        assert_eq!(manager.containers_map().mntns_ids(), expected);
    }

    #[tokio::test]
    async fn test_runtime_events() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        fake_pid(&host.path().join("proc"), 4242, 4026532100, 4026532200, "0::/kubepods/pod1/abc\n");
        let manager = TracerManager::builder()
            .set_host_root(host.path())
            .set_pin_path(dir.path().join("gadget"))
            .build()
            .unwrap();

        let config: oci::Spec = serde_json::from_str(
            r#"{
                "annotations": {
                    "io.kubernetes.cri.sandbox-namespace": "default",
                    "io.kubernetes.cri.sandbox-name": "web-0",
                    "io.kubernetes.cri.container-name": "nginx"
                }
            }"#,
        )
        .unwrap();
        let id = ContainerID::new("abc").unwrap();
        manager
            .handle_runtime_event(RuntimeEvent::Add {
                id: id.clone(),
                pid: 4242,
                config: Some(Box::new(config)),
            })
            .await;

        let c = manager.containers().get_by_id("abc").unwrap();
        assert_eq!(c.mntns, 4026532100);
        assert_eq!(c.podname, "web-0");
        assert_eq!(c.name, "nginx");
        assert_eq!(c.cgroup_v2, "/kubepods/pod1/abc");

        for _ in 0..2 {
            manager
                .handle_runtime_event(RuntimeEvent::Remove {
                    id: id.clone(),
                    pid: 4242,
                })
                .await;
        }
        assert!(manager.list_containers().is_empty());
    }

    #[derive(Debug)]
    struct StaticRuntime {
        containers: Vec<RuntimeContainer>,
    }

    #[async_trait::async_trait]
    impl RuntimeClient for StaticRuntime {
        fn name(&self) -> &str {
            "static"
        }

        async fn list_containers(&self) -> runtime::Result<Vec<RuntimeContainer>> {
            Ok(self.containers.clone())
        }

        async fn get_container(&self, id: &str) -> runtime::Result<RuntimeContainer> {
            self.containers
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| runtime::Error::NotFound {
                    runtime: "static".to_owned(),
                    id: id.to_owned(),
                })
        }
    }

    fn runtime_container(id: &str, pid: u32) -> RuntimeContainer {
        RuntimeContainer {
            id: id.to_owned(),
            name: format!("{id}-name"),
            pod_namespace: "default".to_owned(),
            pod_name: "web-0".to_owned(),
            state: ContainerState::Running,
            pid,
            labels: BTreeMap::from([("app".to_owned(), "web".to_owned())]),
        }
    }

    fn manager_with_runtime(pin_dir: &Path, host: &Path) -> Arc<TracerManager> {
        let proc_root = host.join("proc");
        fake_pid(&proc_root, 100, 4026532301, 4026532401, "0::/a\n");
        fake_pid(&proc_root, 101, 4026532302, 4026532402, "0::/b\n");
        let runtime = Arc::new(StaticRuntime {
            containers: vec![runtime_container("a", 100), runtime_container("b", 101)],
        });
        TracerManager::builder()
            .set_host_root(host)
            .set_pin_path(pin_dir.join("gadget"))
            .add_runtime_client(runtime)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_inject_initial_containers() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let manager = manager_with_runtime(dir.path(), host.path());

        assert_eq!(manager.inject_initial_containers().await, 2);
        assert_eq!(manager.inject_initial_containers().await, 0);
        let ids: Vec<String> = manager
            .list_containers()
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            manager.containers_map().mntns_ids(),
            vec![4026532301, 4026532302]
        );
    }

    #[tokio::test]
    async fn test_poll_watcher_feeds_collection() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let manager = manager_with_runtime(dir.path(), host.path());
        let labels = Selector {
            labels: BTreeMap::from([("app".to_owned(), "web".to_owned())]),
            ..Default::default()
        };
        manager.add_tracer("web", labels).unwrap();

        assert!(
            manager
                .start_watcher(WatcherKind::Poll, Duration::from_millis(10))
                .unwrap()
        );
        for _ in 0..200 {
            if manager.list_containers().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.filter_mntns("web").unwrap(),
            vec![4026532301, 4026532302]
        );
        manager.close();
    }

    #[tokio::test]
    async fn test_no_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(
            !manager
                .start_watcher(WatcherKind::None, Duration::from_secs(1))
                .unwrap()
        );
        // Polling without runtimes is unsupported, which is not an error.
        assert!(
            !manager
                .start_watcher(WatcherKind::Poll, Duration::from_secs(1))
                .unwrap()
        );
    }

    #[derive(Debug)]
    struct FlagGadget {
        running: Arc<AtomicBool>,
    }

    impl Gadget for FlagGadget {
        fn start(&mut self, ctx: GadgetContext) -> gadget::Result<()> {
            assert_eq!(ctx.tracer_id, "t1");
            assert!(ctx.filter_pin.ends_with("mntnsset_t1"));
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_gadget_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let mut gadgets = GadgetRegistry::default();
        {
            let running = Arc::clone(&running);
            gadgets
                .register("flag", "flips a flag", move || {
                    Box::new(FlagGadget {
                        running: Arc::clone(&running),
                    })
                })
                .unwrap();
        }
        let manager = TracerManager::builder()
            .set_pin_path(dir.path().join("gadget"))
            .set_node_name("node-1")
            .set_gadget_registry(gadgets)
            .build()
            .unwrap();
        assert_eq!(
            manager.list_gadgets(),
            vec![("flag".to_owned(), "flips a flag".to_owned())]
        );

        assert!(matches!(
            manager.start_gadget("t1", "flag", BTreeMap::new()).await,
            Err(Error::Tracer(_))
        ));
        manager.add_tracer("t1", Selector::default()).unwrap();
        let (_stream, mut subscription) = manager.receive_stream("t1").unwrap();
        manager
            .start_gadget("t1", "flag", BTreeMap::new())
            .await
            .unwrap();
        assert!(running.load(Ordering::SeqCst));
        assert_eq!(
            subscription.recv().await.as_deref(),
            Some(r#"{"type":"ready","node":"node-1"}"#)
        );
        assert!(matches!(
            manager.start_gadget("t1", "flag", BTreeMap::new()).await,
            Err(Error::Gadget(gadget::Error::AlreadyRunning(_)))
        ));

        manager.remove_tracer("t1").unwrap();
        assert!(!running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_removes_pins() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryMaps::default());
        let manager = TracerManager::builder()
            .set_pin_path(dir.path().join("gadget"))
            .set_map_provider(Arc::clone(&provider) as Arc<dyn MapProvider>)
            .build()
            .unwrap();
        manager.add_tracer("t1", Selector::default()).unwrap();
        let map_pin = manager.containers_map().pin_path().to_path_buf();
        let filter_pin = dir.path().join("gadget").join("mntnsset_t1");
        assert!(provider.is_pinned(&map_pin));
        assert!(provider.is_pinned(&filter_pin));

        manager.close();
        manager.close();
        assert!(!provider.is_pinned(&map_pin));
        assert!(!provider.is_pinned(&filter_pin));
        assert!(matches!(
            manager.add_tracer("t2", Selector::default()),
            Err(Error::Closed)
        ));
    }
}
