use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::{Error, KernelMap, MapProvider, MapSpec, Result};

#[derive(Debug)]
struct MemoryMap {
    spec: MapSpec,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMap {
    fn new(spec: MapSpec) -> Self {
        Self {
            spec,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KernelMap for MemoryMap {
    fn spec(&self) -> &MapSpec {
        &self.spec
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.spec.check_key(key)?;
        self.spec.check_value(value)?;
        let mut entries = self.entries();
        if !entries.contains_key(key) && entries.len() >= self.spec.max_entries as usize {
            return Err(Error::Full {
                map: self.spec.name.clone(),
                max_entries: self.spec.max_entries,
            });
        }
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.spec.check_key(key)?;
        Ok(self.entries().remove(key).is_some())
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.spec.check_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// Maps kept in process memory, "pinned" in a table keyed by path.
#[derive(Debug, Default)]
pub struct MemoryMaps {
    pins: Mutex<HashMap<PathBuf, Arc<MemoryMap>>>,
}

impl MemoryMaps {
    pub fn is_pinned(&self, pin: &Path) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(pin)
    }

    /// The map pinned at `pin`, if any.
    pub fn pinned(&self, pin: &Path) -> Option<Arc<dyn KernelMap>> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pin)
            .map(|m| Arc::clone(m) as Arc<dyn KernelMap>)
    }

    /// Pins an empty map with an arbitrary layout, as a previous run or
    /// another agent version might have left behind.
    pub fn pin_stale(&self, spec: MapSpec, pin: &Path) -> Arc<dyn KernelMap> {
        let map = Arc::new(MemoryMap::new(spec));
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin.to_path_buf(), Arc::clone(&map));
        map
    }
}

impl MapProvider for MemoryMaps {
    fn open_pinned(&self, spec: &MapSpec, pin: &Path) -> Result<Arc<dyn KernelMap>> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pins.get(pin) {
            let layout_matches = existing.spec.key_size == spec.key_size
                && existing.spec.value_size == spec.value_size
                && existing.spec.max_entries == spec.max_entries;
            if layout_matches {
                log::debug!("Reusing pinned map {}", pin.display());
                existing.clear()?;
                return Ok(Arc::clone(existing) as Arc<dyn KernelMap>);
            }
            log::warn!(
                "Pinned map {} has an unexpected layout, recreating it",
                pin.display()
            );
        }
        let map = Arc::new(MemoryMap::new(spec.clone()));
        pins.insert(pin.to_path_buf(), Arc::clone(&map));
        Ok(map)
    }

    fn unpin(&self, pin: &Path) -> Result<()> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pin);
        Ok(())
    }
}
