//! Remote reconciliation: smart sync, atomic publish, delete, rebuilds,
//! and structural repair against the object store.
//!
//! Remote key layout:
//!
//! ```text
//! sessions/<YYYYMMDDhhmmss_slug>.fastshot
//! meta_indexes/<YYYYMMDDhhmmss_slug>.meta.json
//! overall_meta.json
//! ```

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use snapvault_storage::ObjectStore;
use snapvault_types::{Result, SnapError};

use crate::artifact::{fallback_index, Codec};
use crate::cache::MetaCache;
use crate::config::OrphanPolicy;
use crate::meta::{index_filename, Manifest, MetaIndex};
use crate::ops::{CancelToken, ProgressSink};
use crate::session::{generate_filename, Session};

pub const SESSIONS_PREFIX: &str = "sessions/";
pub const META_INDEXES_PREFIX: &str = "meta_indexes/";
pub const OVERALL_META_KEY: &str = "overall_meta.json";

/// Backoff base for the manifest compare-and-swap loop.
const CAS_BACKOFF: Duration = Duration::from_millis(100);

/// Decision hook for orphaned cache entries under `OrphanPolicy::Prompt`.
/// Returns true to delete the entry.
pub type OrphanDecision = dyn Fn(&str) -> bool + Send + Sync;

pub fn session_key(filename: &str) -> String {
    format!("{SESSIONS_PREFIX}{filename}")
}

pub fn index_key(filename: &str) -> String {
    format!("{META_INDEXES_PREFIX}{}", index_filename(filename))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub remote_sessions: usize,
    pub cached_before: usize,
    pub fetched: Vec<String>,
    pub revalidated: Vec<String>,
    pub orphans_deleted: Vec<String>,
    pub orphans_kept: Vec<String>,
    pub errors: Vec<String>,
    pub manifest_rebuilt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub filename: String,
    pub file_size: u64,
    pub manifest_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    pub total: usize,
    pub rebuilt: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CloudIntegrityReport {
    pub sessions_checked: usize,
    pub indexes_checked: usize,
    pub missing_indexes: Vec<String>,
    pub orphaned_indexes: Vec<String>,
    pub manifest_valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub indexes_rebuilt: Vec<String>,
    pub bodies_restored: Vec<String>,
    pub entries_dropped: Vec<String>,
    pub errors: Vec<String>,
}

/// The synchronization engine, binding a store, the local cache, and the
/// artifact codec.
pub struct CloudSync<'a> {
    store: &'a dyn ObjectStore,
    cache: &'a MetaCache,
    codec: &'a Codec,
    /// Retry budget for the manifest CAS loop.
    retry_max: u32,
}

impl<'a> CloudSync<'a> {
    pub fn new(store: &'a dyn ObjectStore, cache: &'a MetaCache, codec: &'a Codec) -> Self {
        Self {
            store,
            cache,
            codec,
            retry_max: 5,
        }
    }

    pub fn with_retry_max(mut self, retry_max: u32) -> Self {
        self.retry_max = retry_max;
        self
    }

    /// Fetch and validate the remote manifest. `Ok(None)` means absent or
    /// failing its own checksum, which sends the caller down the rebuild
    /// path.
    pub fn fetch_manifest(&self) -> Result<Option<(Manifest, Vec<u8>, Option<String>)>> {
        let Some(body) = self.store.get(OVERALL_META_KEY)? else {
            debug!("remote manifest absent");
            return Ok(None);
        };
        let manifest: Manifest = match serde_json::from_slice(&body.data) {
            Ok(m) => m,
            Err(e) => {
                warn!("remote manifest unparseable: {e}");
                return Ok(None);
            }
        };
        if !manifest.checksum_valid() {
            warn!("remote manifest fails checksum validation");
            return Ok(None);
        }
        Ok(Some((manifest, body.data, body.etag)))
    }

    // ---- smart sync -------------------------------------------------

    /// Reconcile the local cache with the remote manifest without
    /// touching any session body. Filename set difference does the work:
    /// bodies are immutable, so presence is the whole story and checksum
    /// comparison only matters for the rare rewritten index.
    pub fn sync_with_remote(
        &self,
        policy: OrphanPolicy,
        orphan_hook: Option<&OrphanDecision>,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<SyncReport> {
        progress.report(0.0, "Loading remote manifest...");
        cancel.check()?;

        let mut report = SyncReport::default();

        let (manifest, manifest_bytes) = match self.fetch_manifest()? {
            Some((manifest, bytes, _)) => (manifest, bytes),
            None => {
                progress.report(0.05, "Manifest missing or invalid; rebuilding...");
                report.manifest_rebuilt = true;
                let manifest = self.rebuild_manifest(cancel, progress)?;
                let bytes = serde_json::to_vec_pretty(&manifest)?;
                (manifest, bytes)
            }
        };

        let remote_names = manifest.filenames();
        let local_names = self.cache.local_filenames()?;
        report.remote_sessions = remote_names.len();
        report.cached_before = local_names.len();

        let mut to_fetch: Vec<&String> = remote_names.difference(&local_names).collect();
        to_fetch.sort();
        let orphans: Vec<&String> = {
            let mut v: Vec<&String> = local_names.difference(&remote_names).collect();
            v.sort();
            v
        };

        // Indexes present on both sides only need a refresh when the
        // manifest disagrees with the cached document.
        let mut to_revalidate: Vec<&String> = Vec::new();
        for name in remote_names.intersection(&local_names) {
            let remote_sum = manifest.find(name).and_then(|e| e.checksum.clone());
            let local_sum = match self.cache.get_metadata(name) {
                Ok(index) => index.checksum,
                Err(_) => None,
            };
            if remote_sum != local_sum {
                to_revalidate.push(name);
            }
        }
        to_revalidate.sort();

        info!(
            "smart sync: {} remote, {} cached, {} to fetch, {} to revalidate, {} orphaned",
            remote_names.len(),
            local_names.len(),
            to_fetch.len(),
            to_revalidate.len(),
            orphans.len()
        );
        progress.report(
            0.1,
            &format!(
                "{} to fetch, {} to revalidate, {} orphaned",
                to_fetch.len(),
                to_revalidate.len(),
                orphans.len()
            ),
        );

        let fetch_total = to_fetch.len() + to_revalidate.len();
        for (i, filename) in to_fetch.iter().chain(to_revalidate.iter()).enumerate() {
            cancel.check()?;
            progress.report(
                0.1 + 0.6 * (i as f64 / fetch_total.max(1) as f64),
                &format!("Fetching metadata for {filename}..."),
            );
            match self.fetch_index_into_cache(filename, &manifest) {
                Ok(()) => {
                    if i < to_fetch.len() {
                        report.fetched.push((*filename).clone());
                    } else {
                        report.revalidated.push((*filename).clone());
                    }
                }
                Err(e) => {
                    warn!("failed to fetch index for {filename}: {e}");
                    report.errors.push(format!("{filename}: {e}"));
                }
            }
        }

        for (i, filename) in orphans.iter().enumerate() {
            cancel.check()?;
            progress.report(
                0.7 + 0.2 * (i as f64 / orphans.len().max(1) as f64),
                &format!("Resolving orphaned entry {filename}..."),
            );
            let delete = match policy {
                OrphanPolicy::Delete => true,
                OrphanPolicy::Keep => false,
                OrphanPolicy::Prompt => match orphan_hook {
                    Some(hook) => hook(filename),
                    // No hook registered: keep, never silently delete.
                    None => false,
                },
            };
            if delete {
                match self.cache.discard_entry(filename) {
                    Ok(()) => report.orphans_deleted.push((*filename).clone()),
                    Err(e) => report.errors.push(format!("{filename}: {e}")),
                }
            } else {
                report.orphans_kept.push((*filename).clone());
            }
        }

        progress.report(0.9, "Updating local manifest...");
        cancel.check()?;
        // An up-to-date cache performs zero disk writes: only touch the
        // local manifest and sync stamp when something actually changed.
        let unchanged = report.fetched.is_empty()
            && report.revalidated.is_empty()
            && report.orphans_deleted.is_empty()
            && self.cache.local_manifest_bytes()?.as_deref() == Some(manifest_bytes.as_slice());
        if !unchanged {
            self.cache.save_manifest_bytes(&manifest_bytes)?;
            self.cache.finish_sync()?;
        }

        progress.report(1.0, "Sync completed");
        Ok(report)
    }

    /// Download one remote index, verify it against itself and the
    /// manifest, and store the remote bytes verbatim.
    fn fetch_index_into_cache(&self, filename: &str, manifest: &Manifest) -> Result<()> {
        let key = index_key(filename);
        let Some(body) = self.store.get(&key)? else {
            // Manifest lists it but the index object is gone: synthesize a
            // placeholder from the manifest entry so the UI can show the
            // session; repair restores the real index later.
            let entry = manifest
                .find(filename)
                .ok_or_else(|| SnapError::NotFound(key.clone()))?;
            warn!("remote index missing for {filename}; writing placeholder");
            let mut index = fallback_index(filename, entry.file_size)?;
            index.metadata.created_at = Some(entry.created_at);
            index.seal()?;
            self.cache
                .write_index_bytes(filename, &serde_json::to_vec_pretty(&index)?)?;
            return Ok(());
        };
        MetaIndex::parse_verified(&body.data, Some(filename))?;
        self.cache.write_index_bytes(filename, &body.data)
    }

    // ---- publish / delete -------------------------------------------

    /// Upload a new session: body, then index, then the manifest via
    /// compare-and-swap. Any permanent failure rolls back the uploads so
    /// the remote never shows a partial publish.
    pub fn publish(
        &self,
        session: &Session,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<PublishReport> {
        let filename = generate_filename(
            &session.metadata.name,
            &session.metadata.desc,
            chrono::Utc::now(),
        );

        progress.report(0.05, "Encoding session artifact...");
        cancel.check()?;
        let body = self.codec.encode(session)?;

        let mut metadata = session.metadata.clone();
        metadata.file_size = body.len() as u64;
        metadata.image_count = session.windows.len() as u32;
        if metadata.created_at.is_none() {
            metadata.created_at = Some(session.created_at);
        }
        let mut index = MetaIndex::new(filename.clone(), metadata);
        index.seal()?;
        let index_bytes = serde_json::to_vec_pretty(&index)?;

        let mut uploaded: Vec<String> = Vec::new();
        let outcome = self.publish_steps(
            &filename,
            &body,
            &index,
            &index_bytes,
            &mut uploaded,
            cancel,
            progress,
        );

        match outcome {
            Ok(retries) => {
                progress.report(0.9, "Updating local cache...");
                self.cache.write_index_bytes(&filename, &index_bytes)?;
                let mut manifest = self.cache.local_manifest()?.unwrap_or_default();
                manifest.upsert(index.manifest_entry());
                self.cache.save_manifest(&mut manifest)?;
                self.cache.cache_body(&filename, &body)?;
                self.cache.finish_sync()?;
                progress.report(1.0, "Save completed");
                info!("published {filename} ({} bytes)", body.len());
                Ok(PublishReport {
                    filename,
                    file_size: body.len() as u64,
                    manifest_retries: retries,
                })
            }
            Err(e) => {
                warn!("publish of {filename} failed, rolling back: {e}");
                self.rollback(&uploaded);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_steps(
        &self,
        filename: &str,
        body: &[u8],
        index: &MetaIndex,
        index_bytes: &[u8],
        uploaded: &mut Vec<String>,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<u32> {
        progress.report(0.2, "Uploading session body...");
        cancel.check()?;
        let body_key = session_key(filename);
        self.store.put(&body_key, body, None)?;
        uploaded.push(body_key);

        progress.report(0.6, "Uploading metadata index...");
        cancel.check()?;
        let meta_key = index_key(filename);
        self.store.put(&meta_key, index_bytes, None)?;
        uploaded.push(meta_key);

        progress.report(0.8, "Updating overall manifest...");
        self.update_manifest_cas(cancel, |manifest| {
            manifest.upsert(index.manifest_entry());
        })
    }

    /// Remove a session everywhere: body, index, manifest entry, local
    /// cache. Concurrent create/delete of the same filename resolves
    /// last-writer-wins through the manifest CAS; relative ordering is
    /// undefined.
    pub fn delete_session(&self, filename: &str, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.store.delete(&session_key(filename))?;
        self.store.delete(&index_key(filename))?;

        let owned = filename.to_string();
        self.update_manifest_cas(cancel, move |manifest| {
            manifest.remove(&owned);
        })?;

        self.cache.remove_metadata(filename)?;
        info!("deleted session {filename}");
        Ok(())
    }

    /// Read-modify-write of the remote manifest with `If-Match`. A lost
    /// race re-reads and retries with bounded exponential backoff.
    /// Returns the number of retries that were needed.
    fn update_manifest_cas(
        &self,
        cancel: &CancelToken,
        mutate: impl Fn(&mut Manifest),
    ) -> Result<u32> {
        let mut delay = CAS_BACKOFF;
        let mut attempt: u32 = 0;
        loop {
            cancel.check()?;
            let (mut manifest, etag) = match self.fetch_manifest()? {
                Some((manifest, _, etag)) => (manifest, etag),
                None => (Manifest::new(), None),
            };
            mutate(&mut manifest);
            manifest.seal()?;
            let bytes = serde_json::to_vec_pretty(&manifest)?;

            match self.store.put(OVERALL_META_KEY, &bytes, etag.as_deref()) {
                Ok(_) => return Ok(attempt),
                Err(SnapError::PreconditionFailed(_)) if attempt < self.retry_max => {
                    attempt += 1;
                    debug!("manifest CAS lost (attempt {attempt}/{}), retrying", self.retry_max);
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort deletion of whatever a failed publish already
    /// uploaded. The manifest was never touched, so the remote returns
    /// to its pre-publish state.
    fn rollback(&self, uploaded: &[String]) {
        for key in uploaded {
            if let Err(e) = self.store.delete(key) {
                warn!("rollback: could not delete {key}: {e}");
            }
        }
    }

    // ---- body transfer ----------------------------------------------

    /// Fetch a session body, serving and feeding the local body cache.
    pub fn download_body(&self, filename: &str, use_cache: bool) -> Result<Vec<u8>> {
        if use_cache {
            if let Some(body) = self.cache.cached_body(filename)? {
                debug!("body cache hit for {filename}");
                return Ok(body);
            }
        }
        let key = session_key(filename);
        let body = self
            .store
            .get(&key)?
            .ok_or_else(|| SnapError::NotFound(key))?;
        if use_cache {
            self.cache.cache_body(filename, &body.data)?;
        }
        Ok(body.data)
    }

    /// Decode a session, transparently downloading (and caching) the
    /// body.
    pub fn load_session(&self, filename: &str) -> Result<Session> {
        let body = self.download_body(filename, true)?;
        self.codec.decode(&body)
    }

    // ---- rebuild / repair -------------------------------------------

    /// Reconstruct the manifest from the remote indexes and upload it
    /// unconditionally (the remote copy is absent or broken when this
    /// runs).
    pub fn rebuild_manifest(
        &self,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<Manifest> {
        let listing = self.store.list(META_INDEXES_PREFIX)?;
        let mut entries = Vec::new();
        let total = listing.len();
        for (i, obj) in listing.iter().enumerate() {
            cancel.check()?;
            progress.report(
                0.1 + 0.7 * (i as f64 / total.max(1) as f64),
                &format!("Reading index {}/{total}...", i + 1),
            );
            let Some(body) = self.store.get(&obj.key)? else {
                continue;
            };
            match serde_json::from_slice::<MetaIndex>(&body.data) {
                Ok(index) if index.checksum_valid() => entries.push(index.manifest_entry()),
                Ok(index) => {
                    warn!("skipping index with bad checksum during rebuild: {}", index.filename);
                }
                Err(e) => warn!("skipping unparseable index {}: {e}", obj.key),
            }
        }

        // Timestamped filenames sort chronologically; newest first to
        // match the publish-time prepend order.
        entries.sort_by(|a, b| b.filename.cmp(&a.filename));

        let mut manifest = Manifest::new();
        for entry in entries {
            manifest.sessions.push(entry);
        }
        manifest.seal()?;
        let bytes = serde_json::to_vec_pretty(&manifest)?;

        cancel.check()?;
        progress.report(0.9, "Uploading rebuilt manifest...");
        self.store.put(OVERALL_META_KEY, &bytes, None)?;
        self.cache.save_manifest_bytes(&bytes)?;
        info!("rebuilt manifest with {} sessions", manifest.total_sessions);
        Ok(manifest)
    }

    /// Re-derive and upload every session's index from its body, then
    /// rebuild the manifest. Cancellation between bodies leaves already
    /// uploaded indexes in place and skips the manifest rewrite.
    pub fn rebuild_all_indexes(
        &self,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<RebuildReport> {
        let listing = self.store.list(SESSIONS_PREFIX)?;
        let mut report = RebuildReport {
            total: listing.len(),
            ..Default::default()
        };

        for (i, obj) in listing.iter().enumerate() {
            let filename = obj.key.trim_start_matches(SESSIONS_PREFIX).to_string();
            progress.report(
                0.9 * (i as f64 / report.total.max(1) as f64),
                &format!("Processing {filename} ({}/{})...", i + 1, report.total),
            );
            cancel.check()?;

            let result = (|| -> Result<()> {
                let Some(body) = self.store.get(&obj.key)? else {
                    return Err(SnapError::NotFound(obj.key.clone()));
                };
                let index = match self.codec.derive_index(&body.data, &filename) {
                    Ok(index) => index,
                    Err(SnapError::Transient(e)) => return Err(SnapError::Transient(e)),
                    Err(e) => {
                        // Undecodable body (foreign key, pre-metadata era):
                        // publish a minimal index so the listing stays whole.
                        debug!("derive failed for {filename} ({e}); using fallback index");
                        fallback_index(&filename, body.data.len() as u64)?
                    }
                };
                self.store
                    .put(&index_key(&filename), &serde_json::to_vec_pretty(&index)?, None)?;
                Ok(())
            })();

            match result {
                Ok(()) => report.rebuilt += 1,
                Err(SnapError::Cancelled) => return Err(SnapError::Cancelled),
                Err(e) => report.errors.push(format!("{filename}: {e}")),
            }
        }

        cancel.check()?;
        progress.report(0.9, "Rebuilding manifest...");
        self.rebuild_manifest(cancel, progress)?;
        progress.report(1.0, "Index rebuild completed");
        Ok(report)
    }

    /// Structural audit of the remote: does every body have an index,
    /// every index a body, and does the manifest validate?
    pub fn verify_cloud_integrity(
        &self,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<CloudIntegrityReport> {
        progress.report(0.1, "Listing remote sessions...");
        cancel.check()?;
        let sessions: Vec<String> = self
            .store
            .list(SESSIONS_PREFIX)?
            .into_iter()
            .map(|o| o.key.trim_start_matches(SESSIONS_PREFIX).to_string())
            .filter(|k| k.ends_with(".fastshot"))
            .collect();

        progress.report(0.3, "Listing remote indexes...");
        cancel.check()?;
        let indexes: Vec<String> = self
            .store
            .list(META_INDEXES_PREFIX)?
            .into_iter()
            .filter_map(|o| {
                crate::meta::session_filename_of_index(
                    o.key.trim_start_matches(META_INDEXES_PREFIX),
                )
            })
            .collect();

        let session_set: std::collections::HashSet<&String> = sessions.iter().collect();
        let index_set: std::collections::HashSet<&String> = indexes.iter().collect();

        progress.report(0.6, "Checking manifest...");
        cancel.check()?;
        let manifest_valid = self.fetch_manifest()?.is_some();

        let report = CloudIntegrityReport {
            sessions_checked: sessions.len(),
            indexes_checked: indexes.len(),
            missing_indexes: sessions
                .iter()
                .filter(|s| !index_set.contains(s))
                .cloned()
                .collect(),
            orphaned_indexes: indexes
                .iter()
                .filter(|s| !session_set.contains(s))
                .cloned()
                .collect(),
            manifest_valid,
            errors: Vec::new(),
        };
        progress.report(1.0, "Cloud integrity verification completed");
        Ok(report)
    }

    /// Restore the body/index/manifest invariant: derive indexes for
    /// bodies that lack one, re-upload bodies cached locally for
    /// dangling indexes, drop what cannot be restored, and finish with a
    /// manifest rebuild.
    pub fn repair_cloud_structure(
        &self,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> Result<RepairReport> {
        let audit = self.verify_cloud_integrity(cancel, progress)?;
        let mut report = RepairReport::default();

        let work = audit.missing_indexes.len() + audit.orphaned_indexes.len();
        let mut done = 0usize;

        for filename in &audit.missing_indexes {
            cancel.check()?;
            done += 1;
            progress.report(
                0.1 + 0.7 * (done as f64 / work.max(1) as f64),
                &format!("Rebuilding index for {filename}..."),
            );
            let result = (|| -> Result<()> {
                let body = self
                    .store
                    .get(&session_key(filename))?
                    .ok_or_else(|| SnapError::NotFound(session_key(filename)))?;
                let index = self
                    .codec
                    .derive_index(&body.data, filename)
                    .or_else(|_| fallback_index(filename, body.data.len() as u64))?;
                self.store
                    .put(&index_key(filename), &serde_json::to_vec_pretty(&index)?, None)?;
                Ok(())
            })();
            match result {
                Ok(()) => report.indexes_rebuilt.push(filename.clone()),
                Err(e) => report.errors.push(format!("{filename}: {e}")),
            }
        }

        for filename in &audit.orphaned_indexes {
            cancel.check()?;
            done += 1;
            progress.report(
                0.1 + 0.7 * (done as f64 / work.max(1) as f64),
                &format!("Resolving dangling index {filename}..."),
            );
            match self.cache.cached_body(filename)? {
                Some(body) => {
                    match self.store.put(&session_key(filename), &body, None) {
                        Ok(_) => report.bodies_restored.push(filename.clone()),
                        Err(e) => report.errors.push(format!("{filename}: {e}")),
                    }
                }
                None => match self.store.delete(&index_key(filename)) {
                    Ok(()) => report.entries_dropped.push(filename.clone()),
                    Err(e) => report.errors.push(format!("{filename}: {e}")),
                },
            }
        }

        progress.report(0.9, "Rebuilding manifest...");
        cancel.check()?;
        self.rebuild_manifest(cancel, progress)?;
        progress.report(1.0, "Repair completed");
        Ok(report)
    }

    /// Derive indexes for legacy bodies sitting in the local body cache
    /// with no cached index, so they show up in listings.
    pub fn adopt_legacy_bodies(&self) -> Result<usize> {
        let known = self.cache.local_filenames()?;
        let mut adopted = 0usize;
        let mut manifest = self.cache.local_manifest()?.unwrap_or_default();
        let mut dirty = false;
        for name in self.cache.cached_body_filenames()? {
            if known.contains(&name) {
                continue;
            }
            let Some(body) = self.cache.cached_body(&name)? else {
                continue;
            };
            match self.codec.derive_index(&body, &name) {
                Ok(index) => {
                    self.cache
                        .write_index_bytes(&name, &serde_json::to_vec_pretty(&index)?)?;
                    manifest.upsert(index.manifest_entry());
                    dirty = true;
                    adopted += 1;
                }
                Err(e) => debug!("cannot derive index for legacy body {name}: {e}"),
            }
        }
        if dirty {
            self.cache.save_manifest(&mut manifest)?;
        }
        Ok(adopted)
    }
}
