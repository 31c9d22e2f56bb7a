//! Local metadata cache: the on-disk mirror of the remote indexes and
//! manifest, plus the on-demand session body cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//!   sessions/                              body cache (on demand)
//!   meta_cache/
//!     meta_indexes/<name>.meta.json
//!     overall_meta.json
//!     cache_info.json
//!   cache_lock                             advisory writer lock
//! ```
//!
//! Writers hold the exclusive advisory lock; readers go lock-free and
//! re-read once under a shared lock when a checksum mismatch shows up.
//! Durable writes are tmp-file-then-rename so readers observe either the
//! old or the new document, never a torn one.

pub mod lock;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use fs4::FileExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use snapvault_storage::ObjectStore;
use snapvault_types::{Result, SnapError};

use crate::config::CacheConfig;
use crate::meta::{
    index_filename, session_filename_of_index, CacheInfo, IntegrityStatus, Manifest, MetaIndex,
};
use lock::CacheLock;

const META_CACHE_DIR: &str = "meta_cache";
const META_INDEXES_DIR: &str = "meta_indexes";
const SESSIONS_DIR: &str = "sessions";
const OVERALL_META_FILE: &str = "overall_meta.json";
const CACHE_INFO_FILE: &str = "cache_info.json";
const LOCK_FILE: &str = "cache_lock";

/// Report from `validate_integrity`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    /// Index files whose content fails self-validation.
    pub corrupted_files: Vec<String>,
    /// Manifest entries with no cached index file.
    pub missing_files: Vec<String>,
    /// Cached index files the local manifest no longer lists.
    pub orphaned_files: Vec<String>,
}

/// Report from `recover_from_corruption`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub method: &'static str,
    pub recovered: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_size_bytes: u64,
    pub total_meta_files: usize,
    pub cached_bodies: usize,
    pub body_cache_bytes: u64,
    pub last_sync: Option<chrono::DateTime<Utc>>,
    pub integrity_status: IntegrityStatus,
}

/// Owner of the local cache directory.
pub struct MetaCache {
    root: PathBuf,
    meta_indexes_dir: PathBuf,
    sessions_dir: PathBuf,
    overall_meta_path: PathBuf,
    cache_info_path: PathBuf,
    lock_path: PathBuf,
    max_body_bytes: u64,
    /// Manifest-ordered view of the cached indexes, rebuilt lazily after
    /// any write invalidates it.
    snapshot: RwLock<Option<Vec<MetaIndex>>>,
}

impl MetaCache {
    pub fn open(cfg: &CacheConfig) -> Result<Self> {
        let root = match &cfg.root_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| SnapError::Config("cannot determine home directory".into()))?
                .join(".snapvault"),
        };
        let meta_cache_dir = root.join(META_CACHE_DIR);
        let cache = Self {
            meta_indexes_dir: meta_cache_dir.join(META_INDEXES_DIR),
            sessions_dir: root.join(SESSIONS_DIR),
            overall_meta_path: meta_cache_dir.join(OVERALL_META_FILE),
            cache_info_path: meta_cache_dir.join(CACHE_INFO_FILE),
            lock_path: root.join(LOCK_FILE),
            max_body_bytes: cfg.max_body_bytes,
            snapshot: RwLock::new(None),
            root,
        };

        fs::create_dir_all(&cache.meta_indexes_dir)?;
        fs::create_dir_all(&cache.sessions_dir)?;
        cache.sweep_tmp_files();

        if !cache.cache_info_path.exists() {
            let mut info = CacheInfo::new();
            info.seal()?;
            let bytes = serde_json::to_vec_pretty(&info)?;
            cache.atomic_write(&cache.cache_info_path, &bytes)?;
        }
        debug!("cache opened at {}", cache.root.display());
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the exclusive writer lock, blocking until available.
    pub fn lock_writer(&self) -> Result<CacheLock> {
        CacheLock::acquire(&self.lock_path)
    }

    fn index_path(&self, session_filename: &str) -> PathBuf {
        self.meta_indexes_dir.join(index_filename(session_filename))
    }

    fn body_path(&self, session_filename: &str) -> PathBuf {
        self.sessions_dir.join(session_filename)
    }

    // ---- reads ------------------------------------------------------

    /// All cached indexes in manifest order. Pure read: served from the
    /// in-memory snapshot, rebuilt from disk only after a write.
    pub fn list_metadata(&self) -> Result<Vec<MetaIndex>> {
        if let Some(snapshot) = self.snapshot.read().expect("snapshot lock").as_ref() {
            return Ok(snapshot.clone());
        }
        let loaded = self.load_all_indexes()?;
        *self.snapshot.write().expect("snapshot lock") = Some(loaded.clone());
        Ok(loaded)
    }

    pub fn get_metadata(&self, session_filename: &str) -> Result<MetaIndex> {
        match self.read_index(session_filename)? {
            Some(index) => Ok(index),
            None => Err(SnapError::NotFound(session_filename.to_string())),
        }
    }

    /// Session filenames that have a cached index.
    pub fn local_filenames(&self) -> Result<HashSet<String>> {
        let mut names = HashSet::new();
        for entry in fs::read_dir(&self.meta_indexes_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(session) = session_filename_of_index(&name) {
                names.insert(session);
            }
        }
        Ok(names)
    }

    pub fn local_manifest(&self) -> Result<Option<Manifest>> {
        let bytes = match self.local_manifest_bytes()? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| SnapError::SchemaMismatch(format!("local manifest: {e}")))?;
        Ok(Some(manifest))
    }

    pub fn local_manifest_bytes(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.overall_meta_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Session filenames with a cached body.
    pub fn cached_body_filenames(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".fastshot") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn load_all_indexes(&self) -> Result<Vec<MetaIndex>> {
        let mut out = Vec::new();
        match self.local_manifest() {
            Ok(Some(manifest)) => {
                for entry in &manifest.sessions {
                    match self.read_index(&entry.filename) {
                        Ok(Some(index)) => out.push(index),
                        Ok(None) => debug!("manifest entry without index: {}", entry.filename),
                        Err(e) => warn!("skipping unreadable index {}: {e}", entry.filename),
                    }
                }
            }
            Ok(None) | Err(_) => {
                // No usable manifest: fall back to the directory, newest
                // first (the timestamp prefix makes names chronological).
                let mut names: Vec<String> = self.local_filenames()?.into_iter().collect();
                names.sort();
                names.reverse();
                for name in names {
                    match self.read_index(&name) {
                        Ok(Some(index)) => out.push(index),
                        Ok(None) => {}
                        Err(e) => warn!("skipping unreadable index {name}: {e}"),
                    }
                }
            }
        }
        Ok(out)
    }

    /// Read and verify one index. A checksum mismatch is retried once
    /// under a shared lock (a writer may have been mid-rename) before it
    /// counts as corruption.
    fn read_index(&self, session_filename: &str) -> Result<Option<MetaIndex>> {
        let path = self.index_path(session_filename);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match MetaIndex::parse_verified(&bytes, Some(session_filename)) {
            Ok(index) => Ok(Some(index)),
            Err(first_err) => {
                debug!("index {session_filename} failed verification, re-reading under shared lock");
                let file = fs::File::open(&self.lock_path).or_else(|_| {
                    fs::OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(false)
                        .open(&self.lock_path)
                })?;
                file.lock_shared()?;
                let reread = fs::read(&path);
                let _ = file.unlock();
                match reread {
                    Ok(bytes) => MetaIndex::parse_verified(&bytes, Some(session_filename)).map(Some),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(_) => Err(first_err),
                }
            }
        }
    }

    // ---- writes -----------------------------------------------------

    /// Write one index and fold it into the local manifest.
    pub fn put_metadata(&self, mut index: MetaIndex) -> Result<()> {
        let _guard = self.lock_writer()?;
        index.upgrade()?;
        index.seal()?;

        self.write_document(&self.index_path(&index.filename), &index)?;

        let mut manifest = self.local_manifest()?.unwrap_or_default();
        manifest.upsert(index.manifest_entry());
        manifest.seal()?;
        self.write_document(&self.overall_meta_path, &manifest)?;

        self.refresh_cache_info(|_| {})?;
        self.invalidate_snapshot();
        Ok(())
    }

    /// Remove an index, its manifest entry, and any cached body.
    pub fn remove_metadata(&self, session_filename: &str) -> Result<()> {
        let _guard = self.lock_writer()?;
        remove_if_exists(&self.index_path(session_filename))?;
        remove_if_exists(&self.body_path(session_filename))?;

        if let Some(mut manifest) = self.local_manifest()? {
            if manifest.remove(session_filename).is_some() {
                manifest.seal()?;
                self.write_document(&self.overall_meta_path, &manifest)?;
            }
        }

        self.refresh_cache_info(|_| {})?;
        self.invalidate_snapshot();
        Ok(())
    }

    /// Write remote index bytes verbatim (already verified by the caller)
    /// so a later recovery can compare bit-for-bit with the remote.
    pub fn write_index_bytes(&self, session_filename: &str, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock_writer()?;
        self.atomic_write(&self.index_path(session_filename), bytes)?;
        self.invalidate_snapshot();
        Ok(())
    }

    /// Replace the local manifest with remote bytes verbatim.
    pub fn save_manifest_bytes(&self, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock_writer()?;
        self.atomic_write(&self.overall_meta_path, bytes)?;
        self.invalidate_snapshot();
        Ok(())
    }

    /// Persist a manifest document (sealing it first).
    pub fn save_manifest(&self, manifest: &mut Manifest) -> Result<()> {
        manifest.seal()?;
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.save_manifest_bytes(&bytes)
    }

    /// Drop an entry's cached index and body without touching the local
    /// manifest (the caller is about to replace the manifest wholesale).
    pub fn discard_entry(&self, session_filename: &str) -> Result<()> {
        let _guard = self.lock_writer()?;
        remove_if_exists(&self.index_path(session_filename))?;
        remove_if_exists(&self.body_path(session_filename))?;
        self.invalidate_snapshot();
        Ok(())
    }

    /// Stamp a completed sync into the cache info.
    pub fn finish_sync(&self) -> Result<()> {
        let _guard = self.lock_writer()?;
        self.refresh_cache_info(|info| {
            info.last_sync = Some(Utc::now());
        })
    }

    /// Remove all cached content. Idempotent: clearing an empty cache
    /// succeeds.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock_writer()?;
        for entry in fs::read_dir(&self.meta_indexes_dir)? {
            let entry = entry?;
            remove_if_exists(&entry.path())?;
        }
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            remove_if_exists(&entry.path())?;
        }
        remove_if_exists(&self.overall_meta_path)?;

        let mut info = CacheInfo::new();
        info.integrity_check.last_validated = Some(Utc::now());
        info.integrity_check.status = IntegrityStatus::Cleared;
        info.seal()?;
        self.write_document(&self.cache_info_path, &info)?;
        self.invalidate_snapshot();
        info!("cache cleared at {}", self.root.display());
        Ok(())
    }

    // ---- integrity --------------------------------------------------

    /// Recompute every on-disk document's checksum and cross-check the
    /// index set against the local manifest.
    ///
    /// The scan itself runs lock-free like any reader (read_index must be
    /// able to take the shared lock for its re-read); only the cache-info
    /// update at the end takes the writer lock.
    pub fn validate_integrity(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();

        let mut index_files: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.meta_indexes_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".meta.json") {
                index_files.push(name);
            }
        }
        index_files.sort();

        for name in &index_files {
            let Some(session_filename) = session_filename_of_index(name) else {
                continue;
            };
            match self.read_index(&session_filename) {
                Ok(Some(_)) => {}
                Ok(None) => {}
                Err(e) => {
                    debug!("integrity: {name}: {e}");
                    report.corrupted_files.push(name.clone());
                }
            }
        }

        match self.local_manifest() {
            Ok(Some(manifest)) => {
                if !manifest.checksum_valid() {
                    report.corrupted_files.push(OVERALL_META_FILE.to_string());
                }
                let local = self.local_filenames()?;
                for entry in &manifest.sessions {
                    if !local.contains(&entry.filename) {
                        report.missing_files.push(entry.filename.clone());
                    }
                }
                let listed = manifest.filenames();
                for name in &index_files {
                    if let Some(session) = session_filename_of_index(name) {
                        if !listed.contains(&session) {
                            report.orphaned_files.push(session);
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(_) => report.corrupted_files.push(OVERALL_META_FILE.to_string()),
        }

        if !self.load_cache_info().checksum_valid() {
            report.corrupted_files.push(CACHE_INFO_FILE.to_string());
        }

        report.status = if report.corrupted_files.is_empty() {
            IntegrityStatus::Valid
        } else {
            IntegrityStatus::Corrupted
        };

        let corrupted = report.corrupted_files.clone();
        let status = report.status;
        {
            let _guard = self.lock_writer()?;
            self.refresh_cache_info(|info| {
                info.integrity_check.last_validated = Some(Utc::now());
                info.integrity_check.status = status;
                info.integrity_check.corrupted_files = corrupted;
            })?;
        }

        info!(
            "integrity check: {} indexes, {} corrupted, {} missing, {} orphaned",
            index_files.len(),
            report.corrupted_files.len(),
            report.missing_files.len(),
            report.orphaned_files.len()
        );
        Ok(report)
    }

    /// Restore corrupted documents from the remote, or drop them when no
    /// remote is available. Ends in a state satisfying the cache
    /// invariants (each remaining document self-validates and the
    /// manifest covers exactly the cached indexes).
    pub fn recover_from_corruption(
        &self,
        store: Option<&dyn ObjectStore>,
    ) -> Result<RecoveryReport> {
        let report = self.validate_integrity()?;
        let mut recovery = RecoveryReport {
            method: if store.is_some() { "cloud_restore" } else { "clear_corrupted" },
            ..Default::default()
        };

        for name in &report.corrupted_files {
            if name == CACHE_INFO_FILE {
                let mut info = CacheInfo::new();
                info.seal()?;
                let _guard = self.lock_writer()?;
                self.write_document(&self.cache_info_path, &info)?;
                recovery.recovered.push(name.clone());
                continue;
            }

            if name == OVERALL_META_FILE {
                match self.recover_manifest(store) {
                    Ok(true) => recovery.recovered.push(name.clone()),
                    Ok(false) => recovery.removed.push(name.clone()),
                    Err(e) => recovery.errors.push(format!("{name}: {e}")),
                }
                continue;
            }

            let Some(session_filename) = session_filename_of_index(name) else {
                continue;
            };
            match self.recover_index(store, &session_filename) {
                Ok(true) => recovery.recovered.push(name.clone()),
                Ok(false) => recovery.removed.push(name.clone()),
                Err(e) => recovery.errors.push(format!("{name}: {e}")),
            }
        }

        self.invalidate_snapshot();
        let _ = self.validate_integrity()?;
        info!(
            "cache recovery ({}): {} restored, {} removed, {} errors",
            recovery.method,
            recovery.recovered.len(),
            recovery.removed.len(),
            recovery.errors.len()
        );
        Ok(recovery)
    }

    /// Returns true when the index was restored from remote, false when
    /// it was dropped.
    fn recover_index(
        &self,
        store: Option<&dyn ObjectStore>,
        session_filename: &str,
    ) -> Result<bool> {
        if let Some(store) = store {
            let key = format!("{}/{}", META_INDEXES_DIR, index_filename(session_filename));
            if let Some(body) = store.get(&key)? {
                MetaIndex::parse_verified(&body.data, Some(session_filename))?;
                self.write_index_bytes(session_filename, &body.data)?;
                return Ok(true);
            }
        }
        self.discard_entry(session_filename)?;
        Ok(false)
    }

    fn recover_manifest(&self, store: Option<&dyn ObjectStore>) -> Result<bool> {
        if let Some(store) = store {
            if let Some(body) = store.get(OVERALL_META_FILE)? {
                let manifest: Manifest = serde_json::from_slice(&body.data)
                    .map_err(|e| SnapError::SchemaMismatch(format!("remote manifest: {e}")))?;
                if manifest.checksum_valid() {
                    self.save_manifest_bytes(&body.data)?;
                    return Ok(true);
                }
                warn!("remote manifest also fails validation; rebuilding from local indexes");
            }
        }
        // Reconstruct from whatever indexes survived locally.
        let mut manifest = Manifest::new();
        let mut names: Vec<String> = self.local_filenames()?.into_iter().collect();
        names.sort();
        for name in names {
            if let Ok(Some(index)) = self.read_index(&name) {
                manifest.upsert(index.manifest_entry());
            }
        }
        self.save_manifest(&mut manifest)?;
        Ok(false)
    }

    // ---- body cache -------------------------------------------------

    pub fn cached_body(&self, session_filename: &str) -> Result<Option<Vec<u8>>> {
        let path = self.body_path(session_filename);
        match fs::read(&path) {
            Ok(bytes) => {
                touch_body(&path);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a body and evict least-recently-used bodies past the size
    /// cap. Bodies are immutable, so eviction is the only invalidation.
    pub fn cache_body(&self, session_filename: &str, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock_writer()?;
        self.atomic_write(&self.body_path(session_filename), bytes)?;
        self.evict_bodies()?;
        Ok(())
    }

    /// Drop bodies in least-recently-used order until the cache fits the
    /// cap. Recency is the file mtime: writes set it and every cache hit
    /// refreshes it via [`touch_body`].
    fn evict_bodies(&self) -> Result<()> {
        let mut bodies: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total: u64 = 0;
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                total += meta.len();
                bodies.push((
                    entry.path(),
                    meta.len(),
                    meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                ));
            }
        }
        if total <= self.max_body_bytes {
            return Ok(());
        }
        bodies.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, size, _) in bodies {
            if total <= self.max_body_bytes {
                break;
            }
            debug!("evicting cached body {}", path.display());
            remove_if_exists(&path)?;
            total = total.saturating_sub(size);
        }
        Ok(())
    }

    // ---- stats / info -----------------------------------------------

    pub fn stats(&self) -> Result<CacheStats> {
        let info = self.load_cache_info();
        let mut cached_bodies = 0usize;
        let mut body_bytes = 0u64;
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                cached_bodies += 1;
                body_bytes += meta.len();
            }
        }
        Ok(CacheStats {
            cache_size_bytes: self.cache_size_bytes() + body_bytes,
            total_meta_files: self.local_filenames()?.len(),
            cached_bodies,
            body_cache_bytes: body_bytes,
            last_sync: info.last_sync,
            integrity_status: info.integrity_check.status,
        })
    }

    fn load_cache_info(&self) -> CacheInfo {
        match fs::read(&self.cache_info_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => CacheInfo::default(),
        }
    }

    /// Reload, mutate, restamp sizes/counts, seal, persist. Callers hold
    /// the writer lock.
    fn refresh_cache_info(&self, mutate: impl FnOnce(&mut CacheInfo)) -> Result<()> {
        let mut info = self.load_cache_info();
        mutate(&mut info);
        info.total_meta_files = self.local_filenames()?.len();
        info.cache_size_bytes = self.cache_size_bytes();
        info.seal()?;
        self.write_document(&self.cache_info_path, &info)
    }

    fn cache_size_bytes(&self) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![self.root.join(META_CACHE_DIR)];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        total
    }

    fn write_document<T: Serialize>(&self, path: &Path, doc: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        self.atomic_write(path, &bytes)
    }

    /// Durable write: sibling tmp file, then rename over the target.
    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| SnapError::Fatal(format!("invalid cache path {}", path.display())))?
            .to_string_lossy()
            .into_owned();
        let tmp = path.with_file_name(format!("{file_name}.tmp"));
        fs::write(&tmp, bytes).map_err(map_disk_error)?;
        fs::rename(&tmp, path).map_err(map_disk_error)?;
        Ok(())
    }

    fn invalidate_snapshot(&self) {
        *self.snapshot.write().expect("snapshot lock") = None;
    }

    /// Drop tmp files left behind by a crash mid-write.
    fn sweep_tmp_files(&self) {
        for dir in [&self.meta_indexes_dir, &self.root.join(META_CACHE_DIR)] {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().ends_with(".tmp") {
                    debug!("removing stale tmp file {}", entry.path().display());
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

/// Refresh a body file's mtime after a cache hit so the eviction sort in
/// `evict_bodies` stays access-ordered. Failures never fail the read.
fn touch_body(path: &Path) {
    let touched = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(std::time::SystemTime::now()));
    if let Err(e) = touched {
        debug!("could not refresh access time for {}: {e}", path.display());
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(map_disk_error(e)),
    }
}

/// Disk-full and permission problems are fatal for the cache; everything
/// else stays an ordinary I/O error.
fn map_disk_error(e: std::io::Error) -> SnapError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            SnapError::Fatal(format!("cache directory not writable: {e}"))
        }
        std::io::ErrorKind::StorageFull => SnapError::Fatal(format!("disk full: {e}")),
        _ => SnapError::Io(e),
    }
}
