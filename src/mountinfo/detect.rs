use std::io::BufRead;
use std::path::{Path, PathBuf};

use super::parser::{MountInfo, parse_mount_info_line};
use super::{Error, Result};
use crate::fsutil;

/// Returns the first mount point of a filesystem of type `fs_type`.
///
/// # Errors
///
/// - [`Error::FileOpen`] / [`Error::ReadLine`] on I/O failures.
/// - [`Error::Parse`] if a line is malformed.
/// - [`Error::MissingMount`] if no such mount exists.
pub fn detect_mount_point(path: impl AsRef<Path>, fs_type: &str) -> Result<PathBuf> {
    let path = path.as_ref();
    let reader = fsutil::open_file_reader(path)?;
    let mut found = None;
    for_each_mount(reader, path, |m| {
        if m.fs_type == fs_type {
            found = Some(PathBuf::from(m.mount_point));
            return false;
        }
        true
    })?;

    found.ok_or_else(|| Error::MissingMount {
        fs_type: fs_type.to_owned(),
        path: path.to_path_buf(),
    })
}

/// Mount points of the cgroup hierarchies used to resolve container cgroup paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupMounts {
    /// The unified (v2) hierarchy, e.g. `/sys/fs/cgroup` or `/sys/fs/cgroup/unified`.
    pub v2: Option<PathBuf>,
    /// The v1 `name=systemd` hierarchy, e.g. `/sys/fs/cgroup/systemd`.
    pub v1_systemd: Option<PathBuf>,
}

/// Finds the cgroup v2 and v1 `name=systemd` mount points.
pub fn detect_cgroup_mounts(path: impl AsRef<Path>) -> Result<CgroupMounts> {
    let path = path.as_ref();
    let reader = fsutil::open_file_reader(path)?;
    let mut mounts = CgroupMounts::default();
    for_each_mount(reader, path, |m| {
        match m.fs_type {
            "cgroup2" if mounts.v2.is_none() => mounts.v2 = Some(PathBuf::from(m.mount_point)),
            "cgroup" if mounts.v1_systemd.is_none() && m.has_super_option("name=systemd") => {
                mounts.v1_systemd = Some(PathBuf::from(m.mount_point))
            }
            _ => {}
        }
        mounts.v2.is_none() || mounts.v1_systemd.is_none()
    })?;

    Ok(mounts)
}

/// Calls `f` for each parsed line until it returns `false`.
fn for_each_mount<R: BufRead>(
    mut reader: R,
    origin: &Path,
    mut f: impl FnMut(&MountInfo<'_>) -> bool,
) -> Result<()> {
    let mut line = String::with_capacity(256);
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|source| Error::ReadLine {
                path: origin.to_path_buf(),
                source,
            })?;
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let mount = parse_mount_info_line(&line).map_err(|source| Error::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        if !f(&mount) {
            return Ok(());
        }
    }
}
