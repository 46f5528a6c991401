//! Discovery of filesystem mount points from `/proc/<pid>/mountinfo`.
mod detect;
mod error;
mod parser;

pub use detect::{CgroupMounts, detect_cgroup_mounts, detect_mount_point};
pub use error::{Error, Result};
pub use parser::{MountInfo, ParseError, parse_mount_info_line};
