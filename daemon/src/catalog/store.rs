use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::id::VideoId;
use super::persistence::CatalogPersistence;
use crate::remove_file_quietly;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("no catalog entry with id {0}")]
    UnknownEntry(VideoId),

    #[error("cached file does not exist: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("catalog I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<CatalogError> for common::WallpaperError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::UnknownEntry(id) => Self::NotFound(id.to_string()),
            other => Self::Catalog(other.to_string()),
        }
    }
}

/// Everything the library knows about one video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: VideoId,
    pub title: String,
    #[serde(default)]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(default)]
    pub cached_file_path: Option<PathBuf>,
    #[serde(default)]
    pub is_cached: bool,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub sort_index: u32,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_reference: Option<String>,
}

impl CatalogEntry {
    pub fn new(id: VideoId, title: impl Into<String>, sort_index: u32) -> Self {
        Self {
            id,
            title: title.into(),
            thumbnail_path: None,
            cached_file_path: None,
            is_cached: false,
            size_bytes: None,
            sort_index,
            added_at: Some(Utc::now()),
            remote_reference: None,
        }
    }

    /// Cached file path, but only when the entry is actually playable
    pub fn playable_path(&self) -> Option<&Path> {
        if self.is_cached {
            self.cached_file_path.as_deref()
        } else {
            None
        }
    }

    /// Re-check the cached flag against the filesystem; returns true if it changed
    fn revalidate(&mut self) -> bool {
        let on_disk = self
            .cached_file_path
            .as_deref()
            .is_some_and(|path| path.is_file());

        if on_disk == self.is_cached {
            return false;
        }

        self.is_cached = on_disk;
        if !on_disk {
            self.cached_file_path = None;
            self.size_bytes = None;
        }
        true
    }
}

impl From<&CatalogEntry> for common::LibraryEntry {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            title: entry.title.clone(),
            thumbnail_path: entry
                .thumbnail_path
                .as_ref()
                .map(|p| p.display().to_string()),
            cached_file_path: entry
                .cached_file_path
                .as_ref()
                .map(|p| p.display().to_string()),
            is_cached: entry.is_cached,
            size_bytes: entry.size_bytes,
            sort_index: entry.sort_index,
        }
    }
}

/// Partial update for `CacheStore::upsert`; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub title: Option<String>,
    pub thumbnail_path: Option<PathBuf>,
    pub remote_reference: Option<String>,
}

/// The video library.
///
/// Entries are kept sorted by `sort_index`, which always runs `0..len`
/// without gaps. Every mutation is applied to a copy, written through the
/// persistence backend, and only then becomes visible, so a failed save
/// leaves the in-memory catalog exactly as it was.
pub struct CacheStore {
    entries: Vec<CatalogEntry>,
    persistence: Box<dyn CatalogPersistence>,
}

impl CacheStore {
    /// Load the catalog and repair entries whose cached file vanished
    pub fn open(persistence: Box<dyn CatalogPersistence>) -> Result<Self, CatalogError> {
        let mut entries = persistence.load()?;
        entries.sort_by_key(|e| e.sort_index);

        let mut healed = 0;
        for entry in &mut entries {
            if entry.revalidate() {
                log::warn!(
                    "Catalog entry {} is_cached flipped to {} after checking disk",
                    entry.id,
                    entry.is_cached
                );
                healed += 1;
            }
        }

        let mut seen = HashSet::new();
        entries.retain(|e| seen.insert(e.id.clone()));
        let reindexed = normalize(&mut entries);

        if healed > 0 || reindexed {
            persistence.save_all(&entries)?;
        }

        log::info!("Catalog loaded with {} entries", entries.len());
        Ok(Self {
            entries,
            persistence,
        })
    }

    pub fn lookup(&self, id: &VideoId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Entries in user-defined order
    pub fn all(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Like `lookup`, but first re-checks the entry's cached file on disk
    pub fn refresh(&mut self, id: &VideoId) -> Result<Option<CatalogEntry>, CatalogError> {
        let Some(index) = self.position(id) else {
            return Ok(None);
        };

        let mut entry = self.entries[index].clone();
        if entry.revalidate() {
            log::warn!("Cached file for {} disappeared, marking as not cached", id);
            self.commit(|entries| {
                entries[index] = entry.clone();
                Ok(())
            })?;
        }

        Ok(Some(entry))
    }

    /// Create the entry if missing (appended last), otherwise apply the
    /// provided fields
    pub fn upsert(
        &mut self,
        id: &VideoId,
        update: EntryUpdate,
    ) -> Result<CatalogEntry, CatalogError> {
        self.commit(|entries| {
            let index = match entries.iter().position(|e| &e.id == id) {
                Some(index) => index,
                None => {
                    let title = update.title.clone().unwrap_or_else(|| id.to_string());
                    entries.push(CatalogEntry::new(id.clone(), title, entries.len() as u32));
                    entries.len() - 1
                }
            };

            let entry = &mut entries[index];
            if let Some(title) = update.title {
                entry.title = title;
            }
            if let Some(thumbnail) = update.thumbnail_path {
                entry.thumbnail_path = Some(thumbnail);
            }
            if let Some(reference) = update.remote_reference {
                entry.remote_reference = Some(reference);
            }

            Ok(entry.clone())
        })
    }

    /// Record that `path` now holds the cached video for `id`.
    ///
    /// Calling this again with the same arguments is a no-op. A previously
    /// cached file at a different path is deleted once the catalog has been
    /// saved.
    pub fn set_cached(
        &mut self,
        id: &VideoId,
        path: &Path,
        size_bytes: u64,
    ) -> Result<CatalogEntry, CatalogError> {
        if !path.is_file() {
            return Err(CatalogError::MissingFile(path.to_path_buf()));
        }
        let index = self
            .position(id)
            .ok_or_else(|| CatalogError::UnknownEntry(id.clone()))?;

        let current = &self.entries[index];
        if current.is_cached
            && current.cached_file_path.as_deref() == Some(path)
            && current.size_bytes == Some(size_bytes)
        {
            return Ok(current.clone());
        }

        let previous = current
            .cached_file_path
            .clone()
            .filter(|old| old.as_path() != path);

        let entry = self.commit(|entries| {
            let entry = &mut entries[index];
            entry.cached_file_path = Some(path.to_path_buf());
            entry.size_bytes = Some(size_bytes);
            entry.is_cached = true;
            Ok(entry.clone())
        })?;

        if let Some(previous) = previous {
            remove_file_quietly!(&previous, "superseded cached file");
        }

        log::info!(
            "Cached {} at {} ({} bytes)",
            id,
            path.display(),
            size_bytes
        );
        Ok(entry)
    }

    /// Drop the cached file but keep the entry in the library
    pub fn mark_evicted(&mut self, id: &VideoId) -> Result<CatalogEntry, CatalogError> {
        let index = self
            .position(id)
            .ok_or_else(|| CatalogError::UnknownEntry(id.clone()))?;
        let previous = self.entries[index].cached_file_path.clone();

        let entry = self.commit(|entries| {
            let entry = &mut entries[index];
            entry.cached_file_path = None;
            entry.size_bytes = None;
            entry.is_cached = false;
            Ok(entry.clone())
        })?;

        if let Some(previous) = previous {
            remove_file_quietly!(&previous, "evicted cached file");
        }

        Ok(entry)
    }

    /// Apply a user-defined ordering.
    ///
    /// Listed ids come first in the given order; unknown or repeated ids are
    /// ignored, and entries not listed keep their relative order after them.
    pub fn reorder(&mut self, new_order: &[VideoId]) -> Result<(), CatalogError> {
        self.commit(|entries| {
            let mut remaining = std::mem::take(entries);
            for id in new_order {
                if let Some(pos) = remaining.iter().position(|e| &e.id == id) {
                    entries.push(remaining.remove(pos));
                }
            }
            entries.append(&mut remaining);
            Ok(())
        })
    }

    /// Delete the row plus its cached file and thumbnail
    pub fn remove(&mut self, id: &VideoId) -> Result<CatalogEntry, CatalogError> {
        let index = self
            .position(id)
            .ok_or_else(|| CatalogError::UnknownEntry(id.clone()))?;

        let removed = self.commit(|entries| Ok(entries.remove(index)))?;

        if let Some(path) = &removed.cached_file_path {
            remove_file_quietly!(path, "cached file");
        }
        if let Some(path) = &removed.thumbnail_path {
            remove_file_quietly!(path, "thumbnail");
        }

        log::info!("Removed {} from the library", id);
        Ok(removed)
    }

    fn position(&self, id: &VideoId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    fn commit<T>(
        &mut self,
        mutate: impl FnOnce(&mut Vec<CatalogEntry>) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        let mut next = self.entries.clone();
        let out = mutate(&mut next)?;
        normalize(&mut next);
        self.persistence.save_all(&next)?;
        self.entries = next;
        Ok(out)
    }
}

/// Renumber `sort_index` to match vector order; returns true if anything changed
fn normalize(entries: &mut [CatalogEntry]) -> bool {
    let mut changed = false;
    for (index, entry) in entries.iter_mut().enumerate() {
        let index = index as u32;
        if entry.sort_index != index {
            entry.sort_index = index;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use std::sync::atomic::Ordering;

    struct FailingSave;

    impl CatalogPersistence for FailingSave {
        fn load(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
            Ok(Vec::new())
        }

        fn save_all(&self, _entries: &[CatalogEntry]) -> Result<(), CatalogError> {
            Err(CatalogError::Io(std::io::Error::other("disk full")))
        }
    }

    fn vid(s: &str) -> VideoId {
        VideoId::new(s).unwrap()
    }

    fn store_with(ids: &[&str]) -> (CacheStore, MemoryCatalog) {
        let backend = MemoryCatalog::default();
        let mut store = CacheStore::open(Box::new(backend.clone())).unwrap();
        for id in ids {
            store.upsert(&vid(id), EntryUpdate::default()).unwrap();
        }
        (store, backend)
    }

    fn order(store: &CacheStore) -> Vec<String> {
        store.all().iter().map(|e| e.id.to_string()).collect()
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let (mut store, backend) = store_with(&[]);

        let created = store
            .upsert(
                &vid("a"),
                EntryUpdate {
                    title: Some("First".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(created.title, "First");
        assert_eq!(created.sort_index, 0);
        assert!(!created.is_cached);

        let updated = store
            .upsert(
                &vid("a"),
                EntryUpdate {
                    remote_reference: Some("https://youtu.be/a".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "First");
        assert_eq!(updated.remote_reference.as_deref(), Some("https://youtu.be/a"));
        assert_eq!(store.all().len(), 1);

        // Every write reached the backend
        assert_eq!(backend.saves.load(Ordering::SeqCst), 2);
        assert_eq!(backend.saved.lock().unwrap()[0].title, "First");
    }

    #[test]
    fn test_set_cached_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = store_with(&["a"]);

        let missing = dir.path().join("a.mp4");
        assert!(matches!(
            store.set_cached(&vid("a"), &missing, 10),
            Err(CatalogError::MissingFile(_))
        ));

        std::fs::write(&missing, b"video").unwrap();
        assert!(matches!(
            store.set_cached(&vid("zzz"), &missing, 5),
            Err(CatalogError::UnknownEntry(_))
        ));

        let entry = store.set_cached(&vid("a"), &missing, 5).unwrap();
        assert!(entry.is_cached);
        assert_eq!(entry.playable_path(), Some(missing.as_path()));
    }

    #[test]
    fn test_set_cached_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, backend) = store_with(&["a"]);
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"video").unwrap();

        store.set_cached(&vid("a"), &path, 5).unwrap();
        let saves = backend.saves.load(Ordering::SeqCst);
        store.set_cached(&vid("a"), &path, 5).unwrap();

        assert_eq!(backend.saves.load(Ordering::SeqCst), saves);
        assert!(path.exists());
    }

    #[test]
    fn test_set_cached_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = store_with(&["a"]);
        let old = dir.path().join("a.webm");
        let new = dir.path().join("a.mp4");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"newer").unwrap();

        store.set_cached(&vid("a"), &old, 3).unwrap();
        store.set_cached(&vid("a"), &new, 5).unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(store.lookup(&vid("a")).unwrap().size_bytes, Some(5));
    }

    #[test]
    fn test_open_self_heals_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.mp4");
        std::fs::write(&kept, b"x").unwrap();

        let mut present = CatalogEntry::new(vid("kept"), "kept", 0);
        present.cached_file_path = Some(kept.clone());
        present.is_cached = true;
        let mut gone = CatalogEntry::new(vid("gone"), "gone", 1);
        gone.cached_file_path = Some(dir.path().join("gone.mp4"));
        gone.is_cached = true;
        gone.size_bytes = Some(100);

        let backend = MemoryCatalog::default();
        *backend.saved.lock().unwrap() = vec![present, gone];

        let store = CacheStore::open(Box::new(backend.clone())).unwrap();
        assert!(store.lookup(&vid("kept")).unwrap().is_cached);

        let healed = store.lookup(&vid("gone")).unwrap();
        assert!(!healed.is_cached);
        assert_eq!(healed.cached_file_path, None);
        assert_eq!(healed.size_bytes, None);

        // The repair was persisted
        assert_eq!(backend.saves.load(Ordering::SeqCst), 1);
        assert!(!backend.saved.lock().unwrap()[1].is_cached);
    }

    #[test]
    fn test_open_normalizes_sort_indices() {
        let backend = MemoryCatalog::default();
        *backend.saved.lock().unwrap() = vec![
            CatalogEntry::new(vid("b"), "b", 7),
            CatalogEntry::new(vid("a"), "a", 3),
            CatalogEntry::new(vid("a"), "duplicate", 9),
        ];

        let store = CacheStore::open(Box::new(backend)).unwrap();
        assert_eq!(order(&store), vec!["a", "b"]);
        assert_eq!(store.all()[1].sort_index, 1);
    }

    #[test]
    fn test_refresh_detects_out_of_band_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = store_with(&["a"]);
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"video").unwrap();
        store.set_cached(&vid("a"), &path, 5).unwrap();

        std::fs::remove_file(&path).unwrap();
        let entry = store.refresh(&vid("a")).unwrap().unwrap();
        assert!(!entry.is_cached);
        assert!(!store.lookup(&vid("a")).unwrap().is_cached);
        assert!(store.refresh(&vid("nope")).unwrap().is_none());
    }

    #[test]
    fn test_mark_evicted_deletes_file_keeps_row() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = store_with(&["a"]);
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"video").unwrap();
        store.set_cached(&vid("a"), &path, 5).unwrap();

        let entry = store.mark_evicted(&vid("a")).unwrap();
        assert!(!entry.is_cached);
        assert!(!path.exists());
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn test_reorder() {
        let (mut store, _) = store_with(&["a", "b", "c", "d"]);

        store
            .reorder(&[vid("c"), vid("unknown"), vid("a"), vid("c")])
            .unwrap();

        assert_eq!(order(&store), vec!["c", "a", "b", "d"]);
        let indices: Vec<u32> = store.all().iter().map(|e| e.sort_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_remove_deletes_files_and_reindexes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = store_with(&["a", "b", "c"]);
        let video = dir.path().join("b.mp4");
        let thumb = dir.path().join("b.jpg");
        std::fs::write(&video, b"video").unwrap();
        std::fs::write(&thumb, b"thumb").unwrap();
        store.set_cached(&vid("b"), &video, 5).unwrap();
        store
            .upsert(
                &vid("b"),
                EntryUpdate {
                    thumbnail_path: Some(thumb.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        store.remove(&vid("b")).unwrap();

        assert!(!video.exists());
        assert!(!thumb.exists());
        assert_eq!(order(&store), vec!["a", "c"]);
        assert_eq!(store.all()[1].sort_index, 1);
        assert!(matches!(
            store.remove(&vid("b")),
            Err(CatalogError::UnknownEntry(_))
        ));
    }

    #[test]
    fn test_failed_save_leaves_catalog_untouched() {
        let mut store = CacheStore::open(Box::new(FailingSave)).unwrap();
        assert!(store.upsert(&vid("a"), EntryUpdate::default()).is_err());
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_library_entry_conversion() {
        let mut entry = CatalogEntry::new(vid("a"), "Clip", 2);
        entry.cached_file_path = Some(PathBuf::from("/cache/a.mp4"));
        entry.is_cached = true;

        let wire = common::LibraryEntry::from(&entry);
        assert_eq!(wire.id, "a");
        assert_eq!(wire.cached_file_path.as_deref(), Some("/cache/a.mp4"));
        assert_eq!(wire.sort_index, 2);
    }
}
