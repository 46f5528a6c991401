//! Per-container process exit detection.
use std::collections::HashSet;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use super::{CloseFlag, Error, Result, RuntimeEvent};
use crate::container::ContainerID;

/// Tracks at most one termination watch per container id.
#[derive(Debug)]
pub(super) struct TerminationWatches {
    watched: Mutex<HashSet<ContainerID>>,
    tx: mpsc::Sender<RuntimeEvent>,
    closed: CloseFlag,
    interval: Duration,
}

/// Removes the id from the watched set when a watch task ends.
struct WatchEntry {
    watches: Arc<TerminationWatches>,
    id: ContainerID,
}

impl Drop for WatchEntry {
    fn drop(&mut self) {
        self.watches
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl TerminationWatches {
    pub(super) fn new(tx: mpsc::Sender<RuntimeEvent>, closed: CloseFlag, interval: Duration) -> Self {
        Self {
            watched: Mutex::new(HashSet::new()),
            tx,
            closed,
            interval,
        }
    }

    /// Starts watching `pid` and sends `Remove` for `id` once it exits.
    ///
    /// Returns `Ok(false)` if `id` is already watched.
    ///
    /// # Errors
    ///
    /// [`Error::ProcessGone`] if the process no longer exists.
    pub(super) fn watch(self: &Arc<Self>, id: ContainerID, pid: u32) -> Result<bool> {
        let mut watched = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if watched.contains(&id) {
            return Ok(false);
        }

        let pidfd = match pidfd_open(pid) {
            Ok(fd) => AsyncFd::with_interest(fd, Interest::READABLE).ok(),
            Err(Errno::ENOSYS | Errno::EPERM) => {
                if !process_exists(pid) {
                    return Err(Error::ProcessGone { pid });
                }
                None
            }
            Err(Errno::ESRCH) => return Err(Error::ProcessGone { pid }),
            Err(source) => return Err(Error::PidFd { pid, source }),
        };
        watched.insert(id.clone());
        drop(watched);

        let entry = WatchEntry {
            watches: Arc::clone(self),
            id,
        };
        match pidfd {
            Some(pidfd) => {
                log::debug!("Watching termination of `{}` (pid {pid}) with pidfd", entry.id);
                tokio::spawn(watch_pidfd(entry, pid, pidfd));
            }
            None => {
                log::debug!("Watching termination of `{}` (pid {pid}) by polling", entry.id);
                tokio::spawn(watch_fallback(entry, pid));
            }
        }
        Ok(true)
    }

    pub(super) fn len(&self) -> usize {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn pidfd_open(pid: u32) -> std::result::Result<OwnedFd, Errno> {
    let raw_pid = libc::pid_t::try_from(pid).map_err(|_| Errno::EINVAL)?;
    // SAFETY: pidfd_open takes a pid and flags and returns a new fd or -1.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, raw_pid, 0) };
    if ret < 0 {
        return Err(Errno::last());
    }
    // SAFETY: the syscall returned a fresh fd owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) })
}

fn process_exists(pid: u32) -> bool {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    !matches!(signal::kill(Pid::from_raw(raw_pid), None), Err(Errno::ESRCH))
}

async fn send_remove(entry: &WatchEntry, pid: u32) {
    log::debug!("Container `{}` (pid {pid}) terminated", entry.id);
    let event = RuntimeEvent::Remove {
        id: entry.id.clone(),
        pid,
    };
    if entry.watches.tx.send(event).await.is_err() {
        log::debug!("event receiver closed, dropping remove of `{}`", entry.id);
    }
}

/// A pidfd becomes readable once the process exits.
async fn watch_pidfd(entry: WatchEntry, pid: u32, pidfd: AsyncFd<OwnedFd>) {
    let interval = entry.watches.interval;
    loop {
        if entry.watches.closed.is_closed() {
            return;
        }
        let ready = tokio::time::timeout(interval, pidfd.readable())
            .await
            .map(|result| result.map(|_guard| ()));
        match ready {
            Ok(Ok(())) => break,
            Ok(Err(err)) => {
                log::warn!("polling pidfd of `{}` failed, probing instead: {err}", entry.id);
                drop(pidfd);
                return watch_fallback(entry, pid).await;
            }
            Err(_elapsed) => {}
        }
    }
    send_remove(&entry, pid).await;
}

/// Probes the process with signal 0 once per interval.
async fn watch_fallback(entry: WatchEntry, pid: u32) {
    let interval = entry.watches.interval;
    loop {
        tokio::time::sleep(interval).await;
        if entry.watches.closed.is_closed() {
            return;
        }
        if !process_exists(pid) {
            break;
        }
    }
    send_remove(&entry, pid).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sleep() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap()
    }

    async fn expect_remove(rx: &mut mpsc::Receiver<RuntimeEvent>, id: &str) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RuntimeEvent::Remove { id: got, .. } => assert_eq!(got.as_str(), id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_on_exit() {
        let (tx, mut rx) = mpsc::channel(8);
        let watches = Arc::new(TerminationWatches::new(
            tx,
            CloseFlag::default(),
            Duration::from_millis(50),
        ));
        let mut child = spawn_sleep();
        let id = ContainerID::new("c1").unwrap();

        assert!(watches.watch(id.clone(), child.id()).unwrap());
        assert!(!watches.watch(id, child.id()).unwrap());

        child.kill().unwrap();
        child.wait().unwrap();
        expect_remove(&mut rx, "c1").await;

        let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "second remove delivered");
        assert_eq!(watches.len(), 0);
    }

    #[tokio::test]
    async fn test_fallback_detects_exit() {
        let (tx, mut rx) = mpsc::channel(8);
        let watches = Arc::new(TerminationWatches::new(
            tx,
            CloseFlag::default(),
            Duration::from_millis(50),
        ));
        let mut child = spawn_sleep();
        let entry = WatchEntry {
            watches: Arc::clone(&watches),
            id: ContainerID::new("c2").unwrap(),
        };
        let task = tokio::spawn(watch_fallback(entry, child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
        expect_remove(&mut rx, "c2").await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_process_is_gone() {
        let (tx, _rx) = mpsc::channel(8);
        let watches = Arc::new(TerminationWatches::new(
            tx,
            CloseFlag::default(),
            Duration::from_millis(50),
        ));
        let mut child = spawn_sleep();
        let pid = child.id();
        child.kill().unwrap();
        child.wait().unwrap();

        let result = watches.watch(ContainerID::new("c3").unwrap(), pid);
        assert!(matches!(result, Err(Error::ProcessGone { .. })));
        assert_eq!(watches.len(), 0);
    }

    #[tokio::test]
    async fn test_closed_watch_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let closed = CloseFlag::default();
        let watches = Arc::new(TerminationWatches::new(
            tx,
            closed.clone(),
            Duration::from_millis(50),
        ));
        let mut child = spawn_sleep();
        watches
            .watch(ContainerID::new("c4").unwrap(), child.id())
            .unwrap();
        closed.close();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(watches.len(), 0);

        child.kill().unwrap();
        child.wait().unwrap();
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(extra, Ok(Some(_))));
    }
}
