//! Environment driven configuration of the agent.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::RuntimeConfig;
use crate::watcher::{self, WatcherKind};
use crate::{bpf, host};

pub const DEFAULT_SOCKET: &str = "/run/gadgettracermanager.socket";
pub const DEFAULT_RUNTIMES: &str = "containerd,cri-o";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Explicit host root. `None` means auto detection below `host_mount`.
    pub host_root: Option<PathBuf>,
    pub host_mount: PathBuf,
    pub pin_path: PathBuf,
    pub socket: PathBuf,
    pub http_addr: Option<SocketAddr>,
    pub runtimes: Vec<RuntimeConfig>,
    pub watcher: WatcherKind,
    pub poll_interval: Duration,
    pub node_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_root: None,
            host_mount: PathBuf::from(host::DEFAULT_HOST_MOUNT),
            pin_path: PathBuf::from(bpf::DEFAULT_PIN_PATH),
            socket: PathBuf::from(DEFAULT_SOCKET),
            http_addr: None,
            runtimes: Vec::new(),
            watcher: WatcherKind::Auto,
            poll_interval: watcher::DEFAULT_POLL_INTERVAL,
            node_name: String::new(),
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Error {
    Error::Invalid {
        key,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from a variable lookup. Unset and empty
    /// variables take their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(v) = get("HOST_ROOT") {
            config.host_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("HOST_MOUNT") {
            config.host_mount = PathBuf::from(v);
        }
        if let Some(v) = get("GADGET_PIN_PATH") {
            config.pin_path = PathBuf::from(v);
        }
        if let Some(v) = get("GADGET_SOCKET") {
            config.socket = PathBuf::from(v);
        }
        if let Some(v) = get("GADGET_HTTP_ADDR") {
            let addr = v
                .parse()
                .map_err(|err| invalid("GADGET_HTTP_ADDR", &v, err))?;
            config.http_addr = Some(addr);
        }

        let runtimes = get("GADGET_RUNTIMES").unwrap_or_else(|| DEFAULT_RUNTIMES.to_owned());
        config.runtimes = runtimes
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| r.parse().map_err(|err| invalid("GADGET_RUNTIMES", r, err)))
            .collect::<Result<_>>()?;

        if let Some(v) = get("GADGET_WATCHER") {
            config.watcher = v
                .trim()
                .parse()
                .map_err(|err| invalid("GADGET_WATCHER", &v, err))?;
        }
        if let Some(v) = get("GADGET_POLL_INTERVAL_MS") {
            let ms: u64 = v
                .trim()
                .parse()
                .map_err(|err| invalid("GADGET_POLL_INTERVAL_MS", &v, err))?;
            if ms == 0 {
                return Err(invalid("GADGET_POLL_INTERVAL_MS", &v, "must be positive"));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = get("NODE_NAME") {
            config.node_name = v;
        }

        Ok(config)
    }

    /// The host root: the explicit one, or the detected one.
    pub fn resolve_host_root(&self) -> host::Result<PathBuf> {
        match &self.host_root {
            Some(root) => Ok(root.clone()),
            None => host::resolve_host_root(&self.host_mount),
        }
    }
}
