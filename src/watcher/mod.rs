//! Detection of container creation and termination at the runtime level.
//!
//! Watchers emit [`RuntimeEvent`]s on a channel. For every container id an
//! `Add` is sent before any `Remove`, and at most one `Remove` is sent.
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::container::ContainerID;
use crate::runtime::RuntimeClient;

mod error;
pub mod oci;
mod poll;
mod runc;
mod termination;

pub use error::{Error, Result};
pub use poll::PollWatcher;
pub use runc::RuncWatcher;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum RuntimeEvent {
    Add {
        id: ContainerID,
        pid: u32,
        config: Option<Box<oci::Spec>>,
    },
    Remove {
        id: ContainerID,
        pid: u32,
    },
}

impl RuntimeEvent {
    pub fn id(&self) -> &ContainerID {
        match self {
            RuntimeEvent::Add { id, .. } | RuntimeEvent::Remove { id, .. } => id,
        }
    }
}

/// Result of a capability check. `No` is a routing decision, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supported {
    Yes,
    No(String),
}

/// Cooperative shutdown flag polled by watcher loops.
#[derive(Debug, Clone, Default)]
pub struct CloseFlag(Arc<AtomicBool>);

impl CloseFlag {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub trait RuntimeWatcher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Registers a termination watch for a container detected elsewhere,
    /// e.g. one that was running before the watcher started.
    ///
    /// Returns `Ok(false)` if the watcher does not need one or a watch for
    /// this id already exists.
    fn add_watch_container_termination(&self, _id: &ContainerID, _pid: u32) -> Result<bool> {
        Ok(false)
    }

    /// Stops the watcher loops. They exit within one poll interval.
    fn close(&self);
}

/// Which watcher to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// runc when supported, CRI polling otherwise.
    Auto,
    Runc,
    Poll,
    None,
}

impl FromStr for WatcherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(WatcherKind::Auto),
            "runc" | "fanotify" => Ok(WatcherKind::Runc),
            "poll" | "cri" => Ok(WatcherKind::Poll),
            "none" => Ok(WatcherKind::None),
            other => Err(Error::UnknownKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub host_root: PathBuf,
    pub poll_interval: Duration,
    pub runtimes: Vec<Arc<dyn RuntimeClient>>,
}

/// Starts the watcher of the given kind. Returns `None` when no watcher is
/// wanted or none is supported on this node.
///
/// # Errors
///
/// Fails if an explicitly requested watcher is unsupported or cannot start.
pub fn start(
    kind: WatcherKind,
    options: &WatcherOptions,
    tx: mpsc::Sender<RuntimeEvent>,
) -> Result<Option<Arc<dyn RuntimeWatcher>>> {
    let start_poll = |tx: mpsc::Sender<RuntimeEvent>| -> Option<Arc<dyn RuntimeWatcher>> {
        match PollWatcher::supported(&options.runtimes) {
            Supported::Yes => Some(Arc::new(PollWatcher::new(
                options.runtimes.clone(),
                tx,
                options.poll_interval,
            ))),
            Supported::No(reason) => {
                log::warn!("CRI polling not supported: {reason}");
                None
            }
        }
    };

    match kind {
        WatcherKind::None => Ok(None),
        WatcherKind::Runc => {
            if let Supported::No(reason) = RuncWatcher::supported(&options.host_root) {
                log::error!("runc watcher not supported: {reason}");
                return Err(Error::NoRuncBinary);
            }
            let watcher = RuncWatcher::new(&options.host_root, tx, options.poll_interval)?;
            Ok(Some(Arc::new(watcher)))
        }
        WatcherKind::Poll => Ok(start_poll(tx)),
        WatcherKind::Auto => match RuncWatcher::supported(&options.host_root) {
            Supported::Yes => {
                match RuncWatcher::new(&options.host_root, tx.clone(), options.poll_interval) {
                    Ok(watcher) => Ok(Some(Arc::new(watcher))),
                    Err(err) => {
                        log::warn!("runc watcher failed to start, falling back to polling: {err}");
                        Ok(start_poll(tx))
                    }
                }
            }
            Supported::No(reason) => {
                log::info!("runc watcher not supported ({reason}), using CRI polling");
                Ok(start_poll(tx))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watcher_kind_parse() {
        assert_eq!("auto".parse::<WatcherKind>().unwrap(), WatcherKind::Auto);
        assert_eq!("runc".parse::<WatcherKind>().unwrap(), WatcherKind::Runc);
        assert_eq!("poll".parse::<WatcherKind>().unwrap(), WatcherKind::Poll);
        assert_eq!("none".parse::<WatcherKind>().unwrap(), WatcherKind::None);
        assert!(matches!(
            "inotify".parse::<WatcherKind>(),
            Err(Error::UnknownKind(_))
        ));
    }

    #[test]
    fn test_close_flag_is_shared() {
        let flag = CloseFlag::default();
        let other = flag.clone();
        assert!(!other.is_closed());
        flag.close();
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn test_start_none_and_unsupported_poll() {
        let (tx, _rx) = mpsc::channel(1);
        let options = WatcherOptions {
            host_root: PathBuf::from("/"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            runtimes: Vec::new(),
        };
        assert!(start(WatcherKind::None, &options, tx.clone()).unwrap().is_none());
        assert!(start(WatcherKind::Poll, &options, tx).unwrap().is_none());
    }
}
