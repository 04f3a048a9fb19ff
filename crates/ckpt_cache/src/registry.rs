//! In-process registry of resident checkpoint regions.
//!
//! Two maps keyed by filename: `owned` holds records created by this node's
//! clients, `backup` holds replicas received from the ring predecessor. A
//! filename is owned by exactly one rank, so the maps stay disjoint by
//! construction. Writes happen once per checkpoint transition; a coarse
//! reader-writer lock over both maps is enough.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::anyhow;

use crate::memory::{MemoryMonitor, Region};
use crate::types::{CacheError, CacheResult, DataEntry, Metadata};

#[derive(Default)]
struct Maps {
    owned: BTreeMap<String, Arc<Region>>,
    backup: BTreeMap<String, Arc<Region>>,
}

pub struct StorageRegistry {
    node_rank: i64,
    monitor: Arc<MemoryMonitor>,
    maps: RwLock<Maps>,
}

impl StorageRegistry {
    pub fn new(node_rank: i64, monitor: Arc<MemoryMonitor>) -> Arc<Self> {
        Arc::new(StorageRegistry {
            node_rank,
            monitor,
            maps: RwLock::new(Maps::default()),
        })
    }

    fn is_owned(&self, metadata: &Metadata) -> bool {
        metadata.node_rank == self.node_rank
    }

    /// Insert or replace the region for a record.
    pub fn save(&self, metadata: &Metadata, region: Arc<Region>) -> CacheResult<()> {
        if region.entry().address == 0 {
            return Err(CacheError::Unknown(anyhow!(
                "refuse to register a null region for {}",
                metadata.filename
            )));
        }
        tracing::info!(
            file = %metadata.filename,
            entry = %region.entry(),
            owned = self.is_owned(metadata),
            "registered region"
        );
        let mut maps = self.maps.write().expect("registry lock");
        if self.is_owned(metadata) {
            maps.owned.insert(metadata.filename.clone(), region);
        } else {
            maps.backup.insert(metadata.filename.clone(), region);
        }
        Ok(())
    }

    /// Look up the resident region for a record, if any.
    pub fn load(&self, metadata: &Metadata) -> Option<Arc<Region>> {
        let maps = self.maps.read().expect("registry lock");
        let primary = if self.is_owned(metadata) {
            &maps.owned
        } else {
            &maps.backup
        };
        primary.get(&metadata.filename).cloned()
    }

    /// Drop the region for a record and release its memory accounting. The
    /// unmap itself happens on a background thread when the last reference
    /// goes away.
    pub fn delete(&self, metadata: &Metadata) -> bool {
        let removed = {
            let mut maps = self.maps.write().expect("registry lock");
            let primary = if self.is_owned(metadata) {
                &mut maps.owned
            } else {
                &mut maps.backup
            };
            match primary.remove(&metadata.filename) {
                Some(region) => Some(region),
                None => maps
                    .backup
                    .remove(&metadata.filename)
                    .or_else(|| maps.owned.remove(&metadata.filename)),
            }
        };
        match removed {
            Some(region) => {
                self.monitor.free(region.len() as u64);
                tracing::info!(file = %metadata.filename, "deleted region from registry");
                true
            }
            None => false,
        }
    }

    pub fn owned_len(&self) -> usize {
        self.maps.read().expect("registry lock").owned.len()
    }

    /// Diagnostic dump of both maps as wire entries.
    pub fn snapshot(&self) -> (Vec<(String, DataEntry)>, Vec<(String, DataEntry)>) {
        let maps = self.maps.read().expect("registry lock");
        let dump = |map: &BTreeMap<String, Arc<Region>>| {
            map.iter()
                .map(|(name, region)| (name.clone(), region.entry()))
                .collect()
        };
        (dump(&maps.owned), dump(&maps.backup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckpointState;

    fn metadata(filename: &str, rank: i64) -> Metadata {
        Metadata {
            job: "j".into(),
            filename: filename.into(),
            node_rank: rank,
            iteration: "1".into(),
            state: CheckpointState::Cached,
            size: 128,
        }
    }

    fn fixture() -> (Arc<MemoryMonitor>, Arc<StorageRegistry>) {
        let monitor = MemoryMonitor::new(Some(1 << 20));
        let registry = StorageRegistry::new(0, monitor.clone());
        (monitor, registry)
    }

    #[test]
    fn owned_and_backup_maps_stay_disjoint() {
        let (monitor, registry) = fixture();
        let mine = metadata("a", 0);
        let theirs = metadata("a", 1);

        registry
            .save(&mine, monitor.try_allocate(&mine).unwrap())
            .unwrap();
        let (owned, backup) = registry.snapshot();
        assert_eq!(owned.len(), 1);
        assert!(backup.is_empty());

        // The same filename can only ever arrive with one owner rank; a
        // different filename from a peer lands in the backup map.
        let other = metadata("b", 1);
        registry
            .save(&other, monitor.try_allocate(&other).unwrap())
            .unwrap();
        let (owned, backup) = registry.snapshot();
        assert_eq!(owned.len(), 1);
        assert_eq!(backup.len(), 1);
        assert!(registry.load(&theirs).is_none());
        assert!(registry.load(&mine).is_some());
    }

    #[test]
    fn delete_releases_accounting() {
        let (monitor, registry) = fixture();
        let meta = metadata("a", 0);
        registry
            .save(&meta, monitor.try_allocate(&meta).unwrap())
            .unwrap();
        assert_eq!(monitor.stat().self_total_usage, 128);
        assert!(registry.delete(&meta));
        assert_eq!(monitor.stat().self_total_usage, 0);
        assert!(!registry.delete(&meta));
    }
}
