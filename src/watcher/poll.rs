//! Container detection by periodically listing containers of the runtimes.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{CloseFlag, RuntimeEvent, RuntimeWatcher, Supported};
use crate::container::ContainerID;
use crate::error::ResultOkLogExt;
use crate::runtime::{ContainerState, RuntimeClient};

#[derive(Debug)]
pub struct PollWatcher {
    closed: CloseFlag,
}

/// Running containers of one listing, keyed by id, with their pids.
type Snapshot = BTreeMap<ContainerID, u32>;

impl PollWatcher {
    pub fn supported(runtimes: &[Arc<dyn RuntimeClient>]) -> Supported {
        if runtimes.is_empty() {
            Supported::No("no container runtime configured".to_owned())
        } else {
            Supported::Yes
        }
    }

    pub fn new(
        runtimes: Vec<Arc<dyn RuntimeClient>>,
        tx: mpsc::Sender<RuntimeEvent>,
        interval: Duration,
    ) -> Self {
        let closed = CloseFlag::default();
        tokio::spawn(poll_loop(runtimes, tx, interval, closed.clone()));
        Self { closed }
    }
}

impl RuntimeWatcher for PollWatcher {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn close(&self) {
        self.closed.close();
    }
}

async fn poll_loop(
    runtimes: Vec<Arc<dyn RuntimeClient>>,
    tx: mpsc::Sender<RuntimeEvent>,
    interval: Duration,
    closed: CloseFlag,
) {
    let mut known: Vec<Snapshot> = vec![Snapshot::new(); runtimes.len()];
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if closed.is_closed() {
            log::debug!("CRI poller stopped");
            return;
        }
        for (client, previous) in runtimes.iter().zip(known.iter_mut()) {
            // A failed listing keeps the previous snapshot so nothing is removed.
            let Some(mut current) = list_running(client.as_ref()).await else {
                continue;
            };
            let (added, removed) = diff(previous, &current);
            for (id, pid) in removed {
                if tx.send(RuntimeEvent::Remove { id, pid }).await.is_err() {
                    return;
                }
            }
            for (id, mut pid) in added {
                if pid == 0 {
                    pid = client
                        .get_container(id.as_str())
                        .await
                        .map(|c| c.pid)
                        .ok_log()
                        .unwrap_or(0);
                }
                // Left out of the snapshot so the next poll retries it.
                if pid == 0 {
                    log::debug!("pid of container `{id}` is not known yet");
                    current.remove(&id);
                    continue;
                }
                current.insert(id.clone(), pid);
                let event = RuntimeEvent::Add {
                    id,
                    pid,
                    config: None,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            *previous = current;
        }
    }
}

async fn list_running(client: &dyn RuntimeClient) -> Option<Snapshot> {
    let containers = client.list_containers().await.ok_log()?;
    let mut snapshot = Snapshot::new();
    for container in containers {
        if container.state != ContainerState::Running {
            continue;
        }
        let Some(id) = ContainerID::new(&container.id).ok_log() else {
            continue;
        };
        snapshot.insert(id, container.pid);
    }
    Some(snapshot)
}

/// Returns the containers only in `current` and those only in `previous`.
fn diff(previous: &Snapshot, current: &Snapshot) -> (Vec<(ContainerID, u32)>, Vec<(ContainerID, u32)>) {
    let added = current
        .iter()
        .filter(|(id, _)| !previous.contains_key(*id))
        .map(|(id, pid)| (id.clone(), *pid))
        .collect();
    let removed = previous
        .iter()
        .filter(|(id, _)| !current.contains_key(*id))
        .map(|(id, pid)| (id.clone(), *pid))
        .collect();
    (added, removed)
}
