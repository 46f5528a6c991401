//! Pinned BPF hash maps created through libbpf.
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use libbpf_rs::{MapCore, MapFlags, MapHandle, MapType};

use super::{Error, KernelMap, MapProvider, MapSpec, Result};

#[derive(Debug)]
struct PinnedMap {
    spec: MapSpec,
    handle: MapHandle,
}

impl PinnedMap {
    fn libbpf_error(&self, source: libbpf_rs::Error) -> Error {
        Error::Libbpf {
            map: self.spec.name.clone(),
            source,
        }
    }
}

impl KernelMap for PinnedMap {
    fn spec(&self) -> &MapSpec {
        &self.spec
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.spec.check_key(key)?;
        self.spec.check_value(value)?;
        self.handle
            .update(key, value, MapFlags::ANY)
            .map_err(|source| self.libbpf_error(source))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.spec.check_key(key)?;
        match self.handle.delete(key) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == libbpf_rs::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(self.libbpf_error(source)),
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.spec.check_key(key)?;
        self.handle
            .lookup(key, MapFlags::ANY)
            .map_err(|source| self.libbpf_error(source))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.handle.keys().collect())
    }
}

/// Hash maps pinned on bpffs.
#[derive(Debug, Default)]
pub struct PinnedMaps;

fn matches_spec(handle: &MapHandle, spec: &MapSpec) -> bool {
    handle.map_type() == MapType::Hash
        && handle.key_size() == spec.key_size
        && handle.value_size() == spec.value_size
}

fn pin(handle: &MapHandle, path: &Path) -> Result<()> {
    let pin_error = |source| Error::Pin {
        path: path.to_path_buf(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| pin_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;
    // SAFETY: the fd is valid for the lifetime of `handle` and `c_path` is NUL terminated.
    let ret = unsafe { libbpf_sys::bpf_obj_pin(handle.as_fd().as_raw_fd(), c_path.as_ptr()) };
    if ret < 0 {
        return Err(pin_error(std::io::Error::from_raw_os_error(-ret)));
    }
    Ok(())
}

impl MapProvider for PinnedMaps {
    fn open_pinned(&self, spec: &MapSpec, pin_path: &Path) -> Result<Arc<dyn KernelMap>> {
        if pin_path.exists() {
            match MapHandle::from_pinned_path(pin_path) {
                Ok(handle) if matches_spec(&handle, spec) => {
                    log::debug!("Reusing pinned map {}", pin_path.display());
                    let map = PinnedMap {
                        spec: spec.clone(),
                        handle,
                    };
                    map.clear()?;
                    return Ok(Arc::new(map));
                }
                Ok(_) => log::warn!(
                    "Pinned map {} has an unexpected layout, recreating it",
                    pin_path.display()
                ),
                Err(err) => log::warn!(
                    "Failed to open pinned map {}, recreating it: {err}",
                    pin_path.display()
                ),
            }
            self.unpin(pin_path)?;
        }

        let opts = libbpf_sys::bpf_map_create_opts {
            sz: std::mem::size_of::<libbpf_sys::bpf_map_create_opts>() as _,
            ..Default::default()
        };
        let handle = MapHandle::create(
            MapType::Hash,
            Some(&spec.name),
            spec.key_size,
            spec.value_size,
            spec.max_entries,
            &opts,
        )
        .map_err(|source| Error::Libbpf {
            map: spec.name.clone(),
            source,
        })?;
        pin(&handle, pin_path)?;
        log::debug!("Pinned map `{}` at {}", spec.name, pin_path.display());
        Ok(Arc::new(PinnedMap {
            spec: spec.clone(),
            handle,
        }))
    }

    fn unpin(&self, pin_path: &Path) -> Result<()> {
        match std::fs::remove_file(pin_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Unpin {
                path: pin_path.to_path_buf(),
                source,
            }),
        }
    }
}
