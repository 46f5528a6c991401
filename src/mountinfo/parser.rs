//! Mountinfo line parser.
//!
//! See [`proc_pid_mountinfo(5)`](https://man7.org/linux/man-pages/man5/proc_pid_mountinfo.5.html).

/// A parsed mountinfo line borrowing from the input.
#[derive(Debug, PartialEq, Eq)]
pub struct MountInfo<'a> {
    pub mount_id: &'a str,
    pub parent_id: &'a str,
    pub major_minor: &'a str,
    /// Root of the mount within the filesystem.
    pub root: &'a str,
    /// Mount point relative to the process's root.
    pub mount_point: &'a str,
    pub optional_fields: Vec<&'a str>,
    /// Filesystem type (e.g., `cgroup2`, `bpf`).
    pub fs_type: &'a str,
    pub source: &'a str,
    pub super_options: &'a str,
}

impl MountInfo<'_> {
    /// Returns true if the comma separated super options contain `option`.
    pub fn has_super_option(&self, option: &str) -> bool {
        self.super_options.split(',').any(|o| o == option)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing separator ` - ` in line: `{0}`")]
    MissingSeparator(String),
    #[error("missing `{field}` in line: `{line}`")]
    MissingField { field: &'static str, line: String },
}

/// Parses a single line of mountinfo data without copying.
///
/// # Errors
///
/// Returns [`ParseError`] if the separator or a required field is missing.
pub fn parse_mount_info_line(line: &str) -> Result<MountInfo<'_>, ParseError> {
    let (pre, post) = line
        .split_once(" - ")
        .ok_or_else(|| ParseError::MissingSeparator(line.trim_end().to_owned()))?;

    let missing = |field: &'static str| ParseError::MissingField {
        field,
        line: line.trim_end().to_owned(),
    };

    let mut pre_fields = pre.split_whitespace();
    let mut next_pre = |field| pre_fields.next().ok_or_else(|| missing(field));
    let mount_id = next_pre("mount_id")?;
    let parent_id = next_pre("parent_id")?;
    let major_minor = next_pre("major:minor")?;
    let root = next_pre("root")?;
    let mount_point = next_pre("mount_point")?;
    let optional_fields = pre_fields.collect();

    let mut post_fields = post.split_whitespace();
    let mut next_post = |field| post_fields.next().ok_or_else(|| missing(field));
    let fs_type = next_post("fs_type")?;
    let source = next_post("source")?;
    let super_options = next_post("super_options")?;

    Ok(MountInfo {
        mount_id,
        parent_id,
        major_minor,
        root,
        mount_point,
        optional_fields,
        fs_type,
        source,
        super_options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cgroup2_line() {
        let line = "35 24 0:30 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime shared:9 - cgroup2 cgroup2 rw,nsdelegate\n";
        let m = parse_mount_info_line(line).unwrap();
        assert_eq!(m.mount_point, "/sys/fs/cgroup");
        assert_eq!(m.fs_type, "cgroup2");
        assert_eq!(m.optional_fields, vec!["rw,nosuid,nodev,noexec,relatime", "shared:9"]);
        assert!(m.has_super_option("nsdelegate"));
        assert!(!m.has_super_option("ns"));
    }

    #[test]
    fn error_on_missing_separator() {
        let err = parse_mount_info_line("42 35 0:22 / /mnt rw ext4 /dev/sda1 rw").unwrap_err();
        assert!(matches!(err, ParseError::MissingSeparator(_)));
    }

    #[test]
    fn error_on_missing_mount_point() {
        let err = parse_mount_info_line("42 35 0:22 / - ext4 /dev/sda1 rw").unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField {
                field: "mount_point",
                ..
            }
        ));
    }

    #[test]
    fn error_on_missing_super_options() {
        let err = parse_mount_info_line("42 35 0:22 / /mnt - ext4 /dev/sda1").unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField {
                field: "super_options",
                ..
            }
        ));
    }
}
