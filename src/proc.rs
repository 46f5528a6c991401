//! Access to a (possibly host-mounted) `/proc` tree.
use std::path::{Path, PathBuf};

use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Read(#[from] fsutil::ReadError),
    #[error("unexpected namespace link `{link}` at `{path}`")]
    InvalidNamespaceLink { path: PathBuf, link: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Linux namespaces the agent resolves for containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Mnt,
    Net,
}

impl Namespace {
    fn name(self) -> &'static str {
        match self {
            Namespace::Mnt => "mnt",
            Namespace::Net => "net",
        }
    }
}

/// A `/proc` mount, rooted at `/proc` on the host or e.g. `/host/proc` when
/// the agent runs in a container.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `/proc` below the given host root.
    pub fn under(host_root: impl AsRef<Path>) -> Self {
        Self::new(host_root.as_ref().join("proc"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pid_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Returns the inode number of the given namespace of `pid`.
    pub fn namespace_id(&self, pid: u32, ns: Namespace) -> Result<u64> {
        let path = self.pid_path(pid).join("ns").join(ns.name());
        let link = fsutil::read_link(&path)?;
        parse_namespace_link(&link, ns).ok_or(Error::InvalidNamespaceLink { path, link })
    }

    /// Returns the command name of `pid` without the trailing newline.
    pub fn comm(&self, pid: u32) -> Result<String> {
        let comm = fsutil::read_to_string(self.pid_path(pid).join("comm"))?;
        Ok(comm.trim_end_matches('\n').to_owned())
    }

    /// Returns the NUL-separated command line of `pid`.
    pub fn cmdline(&self, pid: u32) -> Result<Vec<String>> {
        let raw = fsutil::read_to_string(self.pid_path(pid).join("cmdline"))?;
        Ok(raw
            .split('\0')
            .filter(|arg| !arg.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn cgroup_file(&self, pid: u32) -> PathBuf {
        self.pid_path(pid).join("cgroup")
    }

    pub fn mountinfo_file(&self, pid: u32) -> PathBuf {
        self.pid_path(pid).join("mountinfo")
    }
}

/// Parses links of the form `mnt:[4026531840]`.
fn parse_namespace_link(link: &str, ns: Namespace) -> Option<u64> {
    link.strip_prefix(ns.name())?
        .strip_prefix(":[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_namespace_link() {
        assert_eq!(
            parse_namespace_link("mnt:[4026531840]", Namespace::Mnt),
            Some(4026531840)
        );
        assert_eq!(parse_namespace_link("net:[12]", Namespace::Mnt), None);
        assert_eq!(parse_namespace_link("mnt:[abc]", Namespace::Mnt), None);
        assert_eq!(parse_namespace_link("mnt:4026531840", Namespace::Mnt), None);
    }

    #[test]
    fn test_namespace_ids_from_fake_proc() {
        let dir = tempfile::tempdir().unwrap();
        testutil::fake_pid(dir.path(), 42, 1001, 2002, "0::/x\n");
        let proc = ProcFs::new(dir.path());

        assert_eq!(proc.namespace_id(42, Namespace::Mnt).unwrap(), 1001);
        assert_eq!(proc.namespace_id(42, Namespace::Net).unwrap(), 2002);
        assert!(matches!(
            proc.namespace_id(43, Namespace::Mnt),
            Err(Error::Read(_))
        ));
    }

    #[test]
    fn test_cmdline_and_comm() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("7");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("comm"), "runc\n").unwrap();
        std::fs::write(
            pid_dir.join("cmdline"),
            "runc\0create\0--bundle\0/b\0--pid-file\0/b/pid\0",
        )
        .unwrap();
        let proc = ProcFs::new(dir.path());

        assert_eq!(proc.comm(7).unwrap(), "runc");
        assert_eq!(
            proc.cmdline(7).unwrap(),
            vec!["runc", "create", "--bundle", "/b", "--pid-file", "/b/pid"]
        );
    }
}
