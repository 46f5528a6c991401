//! Host preparation before kernel maps can be created.
use std::path::Path;

use nix::mount::MsFlags;
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};
use nix::sys::statfs::statfs;

use super::{Error, Result};

fn is_bpffs(path: &Path) -> Result<bool> {
    let stat = statfs(path).map_err(|source| Error::Statfs {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(stat.filesystem_type().0 as i64 == libc::BPF_FS_MAGIC as i64)
}

/// Mounts bpffs at `mount_point` unless it is mounted there already.
pub fn ensure_bpffs(mount_point: &Path) -> Result<()> {
    super::create_pin_dir(mount_point)?;
    if is_bpffs(mount_point)? {
        return Ok(());
    }
    log::info!("Mounting bpffs at {}", mount_point.display());
    nix::mount::mount(
        Some("bpf"),
        mount_point,
        Some("bpf"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|source| Error::Mount {
        path: mount_point.to_path_buf(),
        source,
    })
}

/// Kernels before 5.11 charge BPF maps against `RLIMIT_MEMLOCK`.
pub fn raise_memlock_rlimit() -> Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY).map_err(Error::Memlock)
}
