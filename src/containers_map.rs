//! The pinned `containers` map: container identity per mount namespace,
//! readable by BPF programs and external tools.
//!
//! A BPF program resolves the container of the current task with
//! `bpf_map_lookup_elem(&containers, &mntns_id)`.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bpf::{self, KernelMap, MapProvider, MapSpec};
use crate::container::{Container, ContainerEvent, EventKind, MntNsId};
use crate::error::ResultOkLogExt;

pub const MAP_NAME: &str = "containers";
/// Size of each string field of an entry, including the trailing NUL.
pub const NAME_MAX_LENGTH: usize = 256;
pub const NAME_MAX_CHARACTERS: usize = NAME_MAX_LENGTH - 1;
const FIELDS: usize = 4;
const MAX_ENTRIES: u32 = 1024;

/// Decoded value of the `containers` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub container_id: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerEntry {
    pub fn from_container(c: &Container) -> Self {
        Self {
            container_id: c.id.to_string(),
            namespace: c.namespace.clone(),
            pod: c.podname.clone(),
            container: c.name.clone(),
        }
    }

    /// Fixed width layout `{container_id, namespace, pod, container}`,
    /// each truncated to [`NAME_MAX_CHARACTERS`] bytes and NUL padded.
    pub fn encode(&self) -> Vec<u8> {
        let mut value = vec![0u8; NAME_MAX_LENGTH * FIELDS];
        let fields = [&self.container_id, &self.namespace, &self.pod, &self.container];
        for (slot, field) in value.chunks_exact_mut(NAME_MAX_LENGTH).zip(fields) {
            let n = field.len().min(NAME_MAX_CHARACTERS);
            slot[..n].copy_from_slice(&field.as_bytes()[..n]);
        }
        value
    }

    pub fn decode(value: &[u8]) -> Option<Self> {
        if value.len() != NAME_MAX_LENGTH * FIELDS {
            return None;
        }
        let mut fields = value.chunks_exact(NAME_MAX_LENGTH).map(|slot| {
            let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
            String::from_utf8_lossy(&slot[..end]).into_owned()
        });
        Some(Self {
            container_id: fields.next()?,
            namespace: fields.next()?,
            pod: fields.next()?,
            container: fields.next()?,
        })
    }
}

pub fn map_spec() -> MapSpec {
    MapSpec {
        name: MAP_NAME.to_owned(),
        key_size: std::mem::size_of::<u64>() as u32,
        value_size: (NAME_MAX_LENGTH * FIELDS) as u32,
        max_entries: MAX_ENTRIES,
    }
}

#[derive(Debug)]
pub struct ContainersMap {
    map: Arc<dyn KernelMap>,
    provider: Arc<dyn MapProvider>,
    pin: PathBuf,
}

impl ContainersMap {
    /// Opens (or recreates) the map pinned as `containers` in `pin_dir`.
    pub fn new(provider: Arc<dyn MapProvider>, pin_dir: &Path) -> bpf::Result<Self> {
        let pin = pin_dir.join(MAP_NAME);
        let map = provider.open_pinned(&map_spec(), &pin)?;
        log::info!("Containers map pinned at {}", pin.display());
        Ok(Self { map, provider, pin })
    }

    /// Bus subscriber keeping the map in sync with the container collection.
    pub fn handle_event(&self, event: &ContainerEvent) {
        let container = &event.container;
        let Some(mntns) = container.mntns_id() else {
            return;
        };
        match event.kind {
            EventKind::Add if container.is_pause() => {
                log::trace!("not adding pause container `{}` to the containers map", container.id);
            }
            EventKind::Add => {
                let value = ContainerEntry::from_container(container).encode();
                self.map
                    .update(&mntns.as_raw().to_ne_bytes(), &value)
                    .ok_log();
            }
            EventKind::Remove => {
                self.map.delete(&mntns.as_raw().to_ne_bytes()).ok_log();
            }
        }
    }

    pub fn lookup(&self, mntns: MntNsId) -> Option<ContainerEntry> {
        self.map
            .lookup(&mntns.as_raw().to_ne_bytes())
            .ok_log()
            .flatten()
            .and_then(|value| ContainerEntry::decode(&value))
    }

    /// Mount namespaces currently in the map, sorted.
    pub fn mntns_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .map
            .keys()
            .ok_log()
            .unwrap_or_default()
            .iter()
            .filter_map(|key| key.as_slice().try_into().ok().map(u64::from_ne_bytes))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn pin_path(&self) -> &Path {
        &self.pin
    }

    /// Removes the pin. The map itself is freed once no program uses it.
    pub fn close(&self) {
        self.provider.unpin(&self.pin).ok_log();
    }
}
