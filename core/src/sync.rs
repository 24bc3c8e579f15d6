//! Synchronizer: keeps Catalog, HashTrie, and on-disk sidecars mutually
//! consistent (spec §4.4) via three composed sources of change: a startup
//! reconciliation pass, a filesystem watcher, and a periodic DB→file sweep.
//!
//! The watcher's debounce/dispatch shape is grounded on the `notify`-based
//! watcher in `AlrikOlson-codescope/server/src/watch.rs`: an `mpsc` channel
//! from the `notify` callback into a dedicated processing thread, so the
//! watcher callback itself never blocks on catalog I/O.

use crate::sidecar::{read_sidecar, write_sidecar};
use crate::{Core, ImgcatError, Result};
use indexmap::IndexSet;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The retry thread drains the duplicate-suppressing FIFO at this cadence
/// (spec §4.4 point 2).
const RETRY_INTERVAL: Duration = Duration::from_secs(2);
/// The DB→file sweep runs at this cadence (spec §4.4 point 3).
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct Synchronizer {
    core: Arc<Core>,
    /// Duplicate-suppressing FIFO of sidecar paths that failed dispatch and
    /// are due for a retry. `IndexSet` gives O(1) "already queued" checks
    /// while preserving arrival order.
    retry_queue: Mutex<IndexSet<PathBuf>>,
    stop: Arc<AtomicBool>,
}

impl Synchronizer {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            retry_queue: Mutex::new(IndexSet::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn sidecar_path(&self, uid: &Uuid) -> PathBuf {
        self.core
            .config
            .image_folder
            .join(format!("{}.xmp", uid.simple()))
    }

    /// Walks the image folder, diffing its sidecar-bearing uids against the
    /// catalog's, and converges: folder-only uids are loaded, catalog-only
    /// uids are removed, and uids in both get a freshness check (spec §4.4
    /// point 1 — the filesystem is authoritative on cold start).
    pub fn reconcile_startup(&self) -> Result<()> {
        let mut on_disk: HashSet<Uuid> = HashSet::new();
        for entry in std::fs::read_dir(&self.core.config.image_folder)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xmp") {
                continue;
            }
            if let Some(uid) = uid_from_sidecar_path(&path) {
                on_disk.insert(uid);
            }
        }
        let in_catalog: HashSet<Uuid> = self.core.catalog.list_all_uids()?.into_iter().collect();

        for uid in on_disk.difference(&in_catalog) {
            self.load_file(uid)?;
        }
        for uid in in_catalog.difference(&on_disk) {
            self.remove_image(uid)?;
        }
        for uid in on_disk.intersection(&in_catalog) {
            self.save_if_file_newer(uid)?;
        }
        Ok(())
    }

    /// Inserts a record read from `<uid>.xmp` into the catalog and trie.
    /// A `DuplicateHash` from the trie is logged and tolerated — duplicate
    /// hashes are legal at the data level (spec §4.4).
    fn load_file(&self, uid: &Uuid) -> Result<()> {
        let path = self.sidecar_path(uid);
        let mut record = read_sidecar(&path, self.core.config.hash_length)?;
        record.regenerate_keywords();

        let guard = self.core.trie.lock();
        self.core.catalog.insert(&record)?;
        if let Err(ImgcatError::DuplicateHash { message }) = guard.borrow_mut().add(&record.hash) {
            tracing::warn!(uid = %uid, hash = %record.hash, %message, "possible duplicate hash on insert");
        }
        Ok(())
    }

    /// Removes a catalog row and, if it was the last row sharing its hash,
    /// the matching trie leaf (hash reference counting, spec §4.4).
    fn remove_image(&self, uid: &Uuid) -> Result<()> {
        let guard = self.core.trie.lock();
        let record = self.core.catalog.get(uid)?;
        self.core.catalog.delete(uid)?;
        if let Some(record) = record {
            if self.core.catalog.count_with_hash(&record.hash)? == 0 {
                if let Err(ImgcatError::MissingHash { message }) =
                    guard.borrow_mut().remove(&record.hash)
                {
                    tracing::warn!(hash = %record.hash, %message, "trie/catalog desync on delete");
                }
            }
        }
        Ok(())
    }

    /// Compares a sidecar's mtime against the catalog row's `last_updated`
    /// and applies whichever side is newer (spec §4.4 conflict policy).
    fn save_if_file_newer(&self, uid: &Uuid) -> Result<()> {
        let path = self.sidecar_path(uid);
        let Some(mut catalog_record) = self.core.catalog.get(uid)? else {
            return self.load_file(uid);
        };
        let mtime = file_mtime(&path)?;

        if mtime > catalog_record.last_updated {
            let mut file_record = read_sidecar(&path, self.core.config.hash_length)?;
            file_record.last_updated = mtime;
            if file_record.regenerate_keywords() {
                file_record.last_updated = time::OffsetDateTime::now_utc();
            }
            self.core.catalog.update(&file_record, file_record.last_updated)?;
        } else if catalog_record.last_updated > mtime {
            if catalog_record.regenerate_keywords() {
                catalog_record.last_updated = time::OffsetDateTime::now_utc();
                self.core
                    .catalog
                    .update(&catalog_record, catalog_record.last_updated)?;
            }
            write_sidecar(&path, &catalog_record)?;
            set_file_mtime(&path, catalog_record.last_updated)?;
        }
        Ok(())
    }

    /// Dispatches one filesystem change. On failure the path is pushed onto
    /// the retry FIFO (duplicates suppressed) rather than propagated.
    fn dispatch(&self, path: &Path, removed: bool) {
        let Some(uid) = uid_from_sidecar_path(path) else {
            return;
        };
        let result = if removed {
            self.remove_image(&uid)
        } else if path.exists() {
            if self.core.catalog.get(&uid).ok().flatten().is_some() {
                self.save_if_file_newer(&uid)
            } else {
                self.load_file(&uid)
            }
        } else {
            self.remove_image(&uid)
        };

        if let Err(err) = result {
            tracing::warn!(path = %path.display(), %err, "sidecar dispatch failed, queuing retry");
            self.retry_queue.lock().insert(path.to_path_buf());
        }
    }

    /// Drains the retry FIFO once, in arrival order, re-attempting each
    /// path's dispatch.
    fn drain_retries(&self) {
        let pending: Vec<PathBuf> = {
            let mut q = self.retry_queue.lock();
            q.drain(..).collect()
        };
        for path in pending {
            let removed = !path.exists();
            self.dispatch(&path, removed);
        }
    }

    /// Spawns the `notify` watcher plus its debounce/dispatch thread and the
    /// retry-drain thread. Returns the watcher handle — dropping it stops
    /// watching.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<RecommendedWatcher> {
        let (tx, rx) = mpsc::channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&self.core.config.image_folder, RecursiveMode::NonRecursive)?;

        let this = Arc::clone(self);
        std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if this.stop.load(Ordering::Relaxed) {
                    break;
                }
                // A move is a delete of the old path plus a create of the new one.
                match event.kind {
                    EventKind::Remove(_) => {
                        for path in &event.paths {
                            this.dispatch(path, true);
                        }
                    }
                    EventKind::Create(_) | EventKind::Modify(_) => {
                        for path in &event.paths {
                            this.dispatch(path, false);
                        }
                    }
                    _ => {}
                }
            }
        });

        let this = Arc::clone(self);
        std::thread::spawn(move || {
            while !this.stop.load(Ordering::Relaxed) {
                std::thread::sleep(RETRY_INTERVAL);
                this.drain_retries();
            }
        });

        Ok(watcher)
    }

    /// Spawns the periodic DB→file sweep thread (spec §4.4 point 3).
    pub fn spawn_sweep(self: &Arc<Self>) {
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            let mut last_sweep = time::OffsetDateTime::now_utc();
            while !this.stop.load(Ordering::Relaxed) {
                std::thread::sleep(SWEEP_INTERVAL);
                let now = time::OffsetDateTime::now_utc();
                if let Err(err) = this.sweep_once(last_sweep) {
                    tracing::warn!(%err, "sweep pass failed");
                }
                last_sweep = now;
            }
        });
    }

    fn sweep_once(&self, since: time::OffsetDateTime) -> Result<()> {
        for uid in self.core.catalog.list_all_uids()? {
            let Some(record) = self.core.catalog.get(&uid)? else {
                continue;
            };
            if record.last_updated > since {
                self.save_if_file_newer(&uid)?;
            }
        }
        Ok(())
    }

    /// Signals the watcher/retry/sweep threads to stop at their next
    /// wakeup.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn uid_from_sidecar_path(path: &Path) -> Option<Uuid> {
    if path.extension().and_then(|e| e.to_str()) != Some("xmp") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok()
}

fn file_mtime(path: &Path) -> Result<time::OffsetDateTime> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    Ok(time::OffsetDateTime::from(modified))
}

fn set_file_mtime(path: &Path, ts: time::OffsetDateTime) -> Result<()> {
    let system_time: std::time::SystemTime = ts.into();
    let file_time = filetime::FileTime::from_system_time(system_time);
    filetime::set_file_mtime(path, file_time).map_err(|e| ImgcatError::IoError {
        message: format!("setting mtime on {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::thread;

    fn test_core(dir: &tempfile::TempDir) -> Arc<Core> {
        let mut config = Config::default();
        config.hash_length = 64;
        config.image_folder = dir.path().join("images");
        config.cache_folder = dir.path().join("cache");
        std::fs::create_dir_all(&config.image_folder).unwrap();
        Arc::new(Core::open(config).unwrap())
    }

    fn write_test_sidecar(dir: &Path, uid: Uuid, hash_hex: &str) {
        let record = crate::record::Record {
            uid,
            hash: crate::hash::Hash::from_hex(hash_hex, 64).unwrap(),
            caption: None,
            authors: None,
            keywords: Default::default(),
            source: None,
            group_id: None,
            collections: Default::default(),
            rating: None,
            date: time::OffsetDateTime::now_utc(),
            last_updated: time::OffsetDateTime::now_utc(),
            source_other: Default::default(),
            source_via: Default::default(),
        };
        write_sidecar(&dir.join(format!("{}.xmp", uid.simple())), &record).unwrap();
    }

    #[test]
    fn reconcile_loads_folder_only_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let uid = Uuid::new_v4();
        write_test_sidecar(&core.config.image_folder, uid, &"ab".repeat(8));

        let sync = Synchronizer::new(Arc::clone(&core));
        sync.reconcile_startup().unwrap();

        assert!(core.catalog.get(&uid).unwrap().is_some());
        assert!(core.trie.lock().borrow().contains(&crate::hash::Hash::from_hex(&"ab".repeat(8), 64).unwrap()));
    }

    #[test]
    fn reconcile_removes_catalog_only_rows() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let uid = Uuid::new_v4();
        let record = crate::record::Record {
            uid,
            hash: crate::hash::Hash::from_hex(&"cd".repeat(8), 64).unwrap(),
            caption: None,
            authors: None,
            keywords: Default::default(),
            source: None,
            group_id: None,
            collections: Default::default(),
            rating: None,
            date: time::OffsetDateTime::now_utc(),
            last_updated: time::OffsetDateTime::now_utc(),
            source_other: Default::default(),
            source_via: Default::default(),
        };
        core.catalog.insert(&record).unwrap();

        let sync = Synchronizer::new(Arc::clone(&core));
        sync.reconcile_startup().unwrap();

        assert!(core.catalog.get(&uid).unwrap().is_none());
    }

    #[test]
    fn watcher_picks_up_new_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let sync = Arc::new(Synchronizer::new(Arc::clone(&core)));
        let _watcher = sync.spawn_watcher().unwrap();

        let uid = Uuid::new_v4();
        write_test_sidecar(&core.config.image_folder, uid, &"ef".repeat(8));

        let mut found = false;
        for _ in 0..50 {
            thread::sleep(Duration::from_millis(100));
            if core.catalog.get(&uid).unwrap().is_some() {
                found = true;
                break;
            }
        }
        sync.stop();
        assert!(found, "watcher did not observe new sidecar within timeout");
    }
}
