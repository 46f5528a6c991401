use std::path::PathBuf;

use crate::{container, fsutil, proc};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to initialize fanotify: {0}")]
    FanotifyInit(#[source] nix::Error),
    #[error("failed to mark `{path}` with fanotify: {source}")]
    FanotifyMark {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to register fanotify fd with the reactor: {0}")]
    AsyncFd(#[source] std::io::Error),
    #[error("no runc binary found")]
    NoRuncBinary,
    #[error("process {pid} exited before it could be watched")]
    ProcessGone { pid: u32 },
    #[error("failed to open pidfd for process {pid}: {source}")]
    PidFd {
        pid: u32,
        #[source]
        source: nix::Error,
    },
    #[error("invalid pid file `{path}`: {reason}")]
    PidFile { path: PathBuf, reason: String },
    #[error(transparent)]
    Read(#[from] fsutil::ReadError),
    #[error("invalid OCI config `{path}`: {source}")]
    Bundle {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Proc(#[from] proc::Error),
    #[error(transparent)]
    ContainerID(#[from] container::Error),
    #[error("unknown watcher `{0}`, expected one of auto, runc, poll, none")]
    UnknownKind(String),
}

pub type Result<T> = std::result::Result<T, Error>;
