//! Detection of whether the agent runs on the host or in a container, and
//! where the host filesystem is then found.
use std::path::{Path, PathBuf};

use crate::fsutil;

pub const DEFAULT_HOST_MOUNT: &str = "/host";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("running in a container but the host filesystem is not mounted at `{0}`")]
    MissingHostMount(PathBuf),
    #[error(transparent)]
    Read(#[from] fsutil::ReadError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Host,
    Container,
}

/// Detects the environment with a series of heuristics:
///
/// 1. the pid namespace of init below `host_mount` differs from ours,
/// 2. `/proc/self/cgroup` names a container runtime or container id,
/// 3. marker files or the `container` environment variable exist.
///
/// Failing checks are logged and skipped.
pub fn detect_environment(host_mount: &Path) -> Environment {
    match is_pid_namespace_isolated(host_mount) {
        Ok(true) => return Environment::Container,
        Ok(false) => {}
        Err(err) => log::debug!("pid namespace check skipped: {err}"),
    }
    match fsutil::read_to_string("/proc/self/cgroup") {
        Ok(content) if matches_container_cgroup(&content) => return Environment::Container,
        Ok(_) => {}
        Err(err) => log::warn!("cgroup check failed: {err}"),
    }
    if has_container_indicators() {
        return Environment::Container;
    }
    Environment::Host
}

/// Returns the host root: `/` on the host, the host mount in a container.
///
/// # Errors
///
/// [`Error::MissingHostMount`] when running in a container without the host
/// filesystem mounted.
pub fn resolve_host_root(host_mount: &Path) -> Result<PathBuf> {
    match detect_environment(host_mount) {
        Environment::Host => Ok(PathBuf::from("/")),
        Environment::Container if host_mount.join("proc").exists() => Ok(host_mount.to_path_buf()),
        Environment::Container => Err(Error::MissingHostMount(host_mount.to_path_buf())),
    }
}

fn is_pid_namespace_isolated(host_mount: &Path) -> Result<bool> {
    let own = fsutil::read_link("/proc/self/ns/pid")?;
    let init = fsutil::read_link(host_mount.join("proc/1/ns/pid"))?;
    Ok(own != init)
}

fn matches_container_cgroup(content: &str) -> bool {
    content.lines().any(|line| {
        ["docker", "kubepods", "containerd", "libpod"]
            .iter()
            .any(|marker| line.contains(marker))
            || line
                .split('/')
                .any(|part| part.len() >= 32 && part.chars().all(|c| c.is_ascii_hexdigit()))
    })
}

fn has_container_indicators() -> bool {
    Path::new("/.dockerenv").exists()
        || Path::new("/run/.containerenv").exists()
        || std::env::var_os("container").is_some()
}
