//! Cgroup membership of container processes.
//!
//! `/proc/<pid>/cgroup` lines have the format
//! `<hierarchy-id>:<controller-list>:<cgroup-path>`; the unified (v2)
//! hierarchy always has id `0` and an empty controller list.
use std::io::BufRead;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    FileOpen(#[from] fsutil::FileOpenError),
    #[error("failed to read line for file `{path}`: {source}")]
    ReadLine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid line in `{path}`: {source}")]
    Line {
        path: PathBuf,
        #[source]
        source: CgroupLineError,
    },
    #[error("failed to stat cgroup directory `{path}`: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CgroupLineError {
    #[error("invalid cgroup line format: {0}")]
    InvalidFormat(String),
    #[error("invalid hierarchy id in cgroup line: {0}")]
    InvalidHierarchyID(String),
}

#[derive(Debug, PartialEq, Eq)]
pub struct CgroupLine<'a> {
    pub hierarchy_id: u32,
    pub controller_list: Vec<&'a str>,
    pub cgroup_path: &'a str,
}

/// Parses one line of `/proc/<pid>/cgroup`.
///
/// The path is everything after the second `:` since cgroup names may
/// themselves contain colons.
pub fn parse_cgroup_line(line: &str) -> std::result::Result<CgroupLine<'_>, CgroupLineError> {
    let mut it = line.trim_end().splitn(3, ':');
    let hierarchy_id = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?
        .parse::<u32>()
        .map_err(|_| CgroupLineError::InvalidHierarchyID(line.to_owned()))?;
    let controllers = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?;
    let cgroup_path = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?;

    Ok(CgroupLine {
        hierarchy_id,
        controller_list: controllers.split(',').filter(|c| !c.is_empty()).collect(),
        cgroup_path,
    })
}

/// Cgroup paths of a process relative to the hierarchy roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupPaths {
    /// Path in the v1 `name=systemd` hierarchy, empty if there is none.
    pub v1: String,
    /// Path in the unified hierarchy, empty if there is none.
    pub v2: String,
}

/// Reads the v1 (`name=systemd`) and v2 cgroup paths from a cgroup file.
pub fn read_cgroup_paths(path: impl AsRef<Path>) -> Result<CgroupPaths> {
    let path = path.as_ref();
    let mut reader = fsutil::open_file_reader(path)?;
    let mut line = String::with_capacity(256);
    let mut paths = CgroupPaths::default();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|source| Error::ReadLine {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let cgl = parse_cgroup_line(&line).map_err(|source| Error::Line {
            path: path.to_path_buf(),
            source,
        })?;
        if cgl.hierarchy_id == 0 && cgl.controller_list.is_empty() {
            paths.v2 = cgl.cgroup_path.to_owned();
        } else if cgl.controller_list.contains(&"name=systemd") {
            paths.v1 = cgl.cgroup_path.to_owned();
        }
    }

    Ok(paths)
}

/// Returns the cgroup id of a v2 cgroup directory, which is its inode number.
pub fn cgroup_id(dir: impl AsRef<Path>) -> Result<u64> {
    let dir = dir.as_ref();
    std::fs::metadata(dir)
        .map(|m| m.ino())
        .map_err(|source| Error::Stat {
            path: dir.to_path_buf(),
            source,
        })
}
