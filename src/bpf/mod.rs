//! Kernel tables shared with BPF programs.
//!
//! Tables are hash maps pinned below a bpffs directory. [`MemoryMaps`]
//! implements the same contract in process memory and backs builds without
//! the `bpf` feature as well as the tests.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod error;
mod memory;
#[cfg(feature = "bpf")]
mod pinned;
#[cfg(feature = "bpf")]
mod setup;

pub use error::{Error, Result};
pub use memory::MemoryMaps;
#[cfg(feature = "bpf")]
pub use pinned::PinnedMaps;
#[cfg(feature = "bpf")]
pub use setup::{ensure_bpffs, raise_memlock_rlimit};

pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/gadget";

/// Layout of a pinned hash map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    pub name: String,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

impl MapSpec {
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size as usize {
            return Err(Error::KeySize {
                map: self.name.clone(),
                expected: self.key_size,
                got: key.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.value_size as usize {
            return Err(Error::ValueSize {
                map: self.name.clone(),
                expected: self.value_size,
                got: value.len(),
            });
        }
        Ok(())
    }
}

/// A hash map visible to BPF programs.
pub trait KernelMap: Send + Sync + fmt::Debug {
    fn spec(&self) -> &MapSpec;

    /// Inserts or replaces the value of `key`.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes `key`. Returns `false` if it was not present.
    fn delete(&self, key: &[u8]) -> Result<bool>;

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn keys(&self) -> Result<Vec<Vec<u8>>>;

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }
}

/// Creates pinned maps.
pub trait MapProvider: Send + Sync + fmt::Debug {
    /// Opens the map pinned at `pin`, creating and pinning it if absent.
    ///
    /// A reused map is cleared. A pinned map whose type or sizes differ from
    /// `spec` is unpinned and replaced by a new one.
    fn open_pinned(&self, spec: &MapSpec, pin: &Path) -> Result<Arc<dyn KernelMap>>;

    /// Removes the pin. Missing pins are not an error.
    fn unpin(&self, pin: &Path) -> Result<()>;
}

/// Creates `dir` if it does not exist and sets its mode to 0755.
///
/// Other processes open the pinned tables by path.
pub fn create_pin_dir(dir: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .and_then(|()| std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)))
        .map_err(|source| Error::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    Ok(dir.to_path_buf())
}

/// Turns a tracer id into a pin file name component.
///
/// ASCII alphanumerics, `-` and `.` are kept. Every other byte, `_`
/// included, becomes `_` followed by two hex digits, so distinct ids never
/// share a pin.
pub fn sanitize_pin_name(name: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "_{byte:02x}");
        }
    }
    out
}
