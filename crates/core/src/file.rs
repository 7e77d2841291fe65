//! Tracked files and the id-keyed file registry

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::region::{ChunkMode, Region, RegionCalculator};

/// Stable file identifier, assigned at first discovery and never reused
pub type FileId = i32;

/// What a peer needs to know about a file to mirror its layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: FileId,
    /// Path relative to the synced root
    pub name: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Observational percentages (0-100), recomputed periodically.
/// On server files only the up-to-date fields are used; on a client's copy
/// only `synced` and `metadata_received`.
#[derive(Debug, Default)]
pub struct FileStatus {
    pub synced: AtomicU8,
    pub metadata_received: AtomicU8,
    pub fast_up_to_date: AtomicU8,
    pub slow_up_to_date: AtomicU8,
}

#[derive(Debug)]
struct FileState {
    size: u64,
    modified: SystemTime,
    regions: BTreeMap<u64, Region>,
}

/// A tracked path with its region layout.
///
/// Scanners and the candidate finder share one instance per file; region
/// updates are recomputations of the same value so last writer wins.
#[derive(Debug)]
pub struct TrackedFile {
    id: FileId,
    name: PathBuf,
    state: RwLock<FileState>,
    pub status: FileStatus,
}

impl TrackedFile {
    /// A file with no regions; call [`TrackedFile::resize`] to lay it out
    #[must_use]
    pub fn new(id: FileId, name: impl Into<PathBuf>, size: u64, modified: SystemTime) -> Self {
        Self {
            id,
            name: name.into(),
            state: RwLock::new(FileState {
                size,
                modified,
                regions: BTreeMap::new(),
            }),
            status: FileStatus::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Path relative to the synced root
    #[must_use]
    pub fn name(&self) -> &Path {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    /// Last mtime recorded for this file
    #[must_use]
    pub fn modified(&self) -> SystemTime {
        self.state.read().modified
    }

    pub fn set_modified(&self, modified: SystemTime) {
        self.state.write().modified = modified;
    }

    #[must_use]
    pub fn metadata(&self) -> FileMetadata {
        let state = self.state.read();
        FileMetadata {
            id: self.id,
            name: self.name.clone(),
            size: state.size,
            modified: state.modified,
        }
    }

    /// Copy of every region in ascending offset order
    #[must_use]
    pub fn regions(&self) -> Vec<Region> {
        self.state.read().regions.values().cloned().collect()
    }

    #[must_use]
    pub fn region(&self, offset: u64) -> Option<Region> {
        self.state.read().regions.get(&offset).cloned()
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.state.read().regions.len()
    }

    /// Run `f` over the region map without copying it
    pub fn with_regions<T>(&self, f: impl FnOnce(&BTreeMap<u64, Region>) -> T) -> T {
        f(&self.state.read().regions)
    }

    /// Re-chunk the file for a new size.
    ///
    /// Returns true if the layout changed.
    pub fn resize(&self, calc: &RegionCalculator, size: u64, mode: ChunkMode) -> bool {
        let mut state = self.state.write();
        state.size = size;
        calc.calculate(&mut state.regions, size, mode)
    }

    /// Apply `f` to the region at `offset` if it still has `size` bytes.
    ///
    /// Returns false when the layout changed underneath the caller, in which
    /// case the computed digest belongs to a region that no longer exists.
    pub fn update_region(&self, offset: u64, size: u64, f: impl FnOnce(&mut Region)) -> bool {
        let mut state = self.state.write();
        match state.regions.get_mut(&offset) {
            Some(region) if region.size == size => {
                f(region);
                true
            }
            _ => false,
        }
    }

    /// Apply `f` to the region at `offset`, whatever its size.
    /// Returns false if there is no region there.
    pub fn update_at(&self, offset: u64, f: impl FnOnce(&mut Region)) -> bool {
        match self.state.write().regions.get_mut(&offset) {
            Some(region) => {
                f(region);
                true
            }
            None => false,
        }
    }

    /// Apply `f` to every region
    pub fn update_all(&self, mut f: impl FnMut(&mut Region)) {
        let mut state = self.state.write();
        for region in state.regions.values_mut() {
            f(region);
        }
    }
}

/// Concurrent map of tracked files, unique by id and by relative name
#[derive(Debug)]
pub struct FileRegistry {
    by_id: DashMap<FileId, Arc<TrackedFile>>,
    by_name: DashMap<PathBuf, FileId>,
    next_id: AtomicI32,
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            next_id: AtomicI32::new(1),
        }
    }

    /// Track `name`, assigning the next id if it is new.
    ///
    /// Returns the file and whether it was created by this call.
    pub fn register(&self, name: &Path, size: u64, modified: SystemTime) -> (Arc<TrackedFile>, bool) {
        match self.by_name.entry(name.to_path_buf()) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                if let Some(file) = self.by_id.get(&id) {
                    return (Arc::clone(file.value()), false);
                }
                // Name survived without its file; re-create under the same id
                let file = Arc::new(TrackedFile::new(id, name, size, modified));
                self.by_id.insert(id, Arc::clone(&file));
                (file, true)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let file = Arc::new(TrackedFile::new(id, name, size, modified));
                self.by_id.insert(id, Arc::clone(&file));
                entry.insert(id);
                (file, true)
            }
        }
    }

    /// Track a file under an id chosen by the other side.
    ///
    /// Returns the file and whether it was created by this call.
    pub fn insert_with_id(&self, meta: &FileMetadata) -> (Arc<TrackedFile>, bool) {
        match self.by_id.entry(meta.id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let file = Arc::new(TrackedFile::new(meta.id, &meta.name, meta.size, meta.modified));
                entry.insert(Arc::clone(&file));
                self.by_name.insert(meta.name.clone(), meta.id);
                (file, true)
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: FileId) -> Option<Arc<TrackedFile>> {
        self.by_id.get(&id).map(|f| Arc::clone(f.value()))
    }

    #[must_use]
    pub fn get_by_name(&self, name: &Path) -> Option<Arc<TrackedFile>> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    /// Snapshot of all tracked files, in no particular order
    #[must_use]
    pub fn files(&self) -> Vec<Arc<TrackedFile>> {
        self.by_id.iter().map(|f| Arc::clone(f.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000)
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let registry = FileRegistry::new();
        let (a, created_a) = registry.register(Path::new("a.bin"), 10, now());
        let (b, created_b) = registry.register(Path::new("b.bin"), 10, now());
        assert!(created_a && created_b);
        assert!(b.id() > a.id());

        let (again, created) = registry.register(Path::new("a.bin"), 99, now());
        assert!(!created);
        assert_eq!(again.id(), a.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_register_is_unique_by_name() {
        let registry = Arc::new(FileRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register(Path::new("same"), 1, now()).0.id())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_region_rejects_stale_size() {
        let file = TrackedFile::new(1, "f", 20, now());
        file.resize(&RegionCalculator::new(8), 20, ChunkMode::Replace);

        assert!(file.update_region(16, 4, |r| r.quick_digest = Some(3)));
        assert_eq!(file.region(16).unwrap().quick_digest, Some(3));

        // Layout changed between read and write
        file.resize(&RegionCalculator::new(8), 22, ChunkMode::Merge);
        assert!(!file.update_region(16, 4, |r| r.quick_digest = Some(9)));
        assert_eq!(file.region(16).unwrap().quick_digest, None);
    }

    #[test]
    fn test_insert_with_id_keeps_remote_id() {
        let registry = FileRegistry::new();
        let meta = FileMetadata {
            id: 42,
            name: PathBuf::from("dir/x"),
            size: 5,
            modified: now(),
        };
        let (file, created) = registry.insert_with_id(&meta);
        assert!(created);
        assert_eq!(file.id(), 42);
        assert_eq!(registry.get_by_name(Path::new("dir/x")).unwrap().id(), 42);
        assert!(!registry.insert_with_id(&meta).1);
    }
}
