//! End-to-end scenarios against an in-memory object store and a real
//! on-disk cache directory.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use snapvault_core::artifact::{thumbnail, Codec};
use snapvault_core::cache::MetaCache;
use snapvault_core::config::{CacheConfig, OrphanPolicy};
use snapvault_core::meta::{IntegrityStatus, Manifest};
use snapvault_core::ops::{CancelToken, OpKind, OpManager, OpState, ProgressSink};
use snapvault_core::session::{Session, SessionWindow, WindowGeometry};
use snapvault_core::sync::{index_key, session_key, CloudSync, OVERALL_META_KEY};
use snapvault_core::SnapError;
use snapvault_storage::memory::MemoryStore;
use snapvault_storage::ObjectStore;

const KEY: &str = "integration-passphrase";

fn temp_cache() -> (TempDir, MetaCache) {
    let dir = tempfile::tempdir().unwrap();
    let cache = MetaCache::open(&CacheConfig {
        root_dir: Some(dir.path().to_path_buf()),
        max_body_bytes: 100 * 1024 * 1024,
    })
    .unwrap();
    (dir, cache)
}

fn session_with_images(name: &str, images: usize) -> Session {
    let mut session = Session::new(snapvault_core::meta::SessionMeta {
        name: name.to_string(),
        tags: vec!["t1".into()],
        ..Default::default()
    });
    for i in 0..images {
        let png = thumbnail::encode_png(&image::DynamicImage::ImageRgb8(
            image::RgbImage::from_pixel(48, 36, image::Rgb([(40 * i) as u8, 90, 160])),
        ))
        .unwrap();
        session.windows.push(SessionWindow {
            geometry: WindowGeometry {
                x: 0,
                y: 0,
                width: 48,
                height: 36,
            },
            scale: 1.0,
            image_png: Some(png),
            draw_history: Vec::new(),
        });
    }
    session
}

fn seeded_remote(n: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let codec = Codec::new(KEY);
    let mut manifest = Manifest::new();
    for i in 0..n {
        let filename = format!("202503150910{i:02}_seed{i}.fastshot");
        let body = codec.encode(&session_with_images(&format!("seed{i}"), 1)).unwrap();
        let index = codec.derive_index(&body, &filename).unwrap();
        store.put(&session_key(&filename), &body, None).unwrap();
        store
            .put(
                &index_key(&filename),
                &serde_json::to_vec_pretty(&index).unwrap(),
                None,
            )
            .unwrap();
        manifest.upsert(index.manifest_entry());
    }
    manifest.seal().unwrap();
    store
        .put(
            OVERALL_META_KEY,
            &serde_json::to_vec_pretty(&manifest).unwrap(),
            None,
        )
        .unwrap();
    store.get_calls.store(0, Ordering::SeqCst);
    store.put_calls.store(0, Ordering::SeqCst);
    store
}

/// Cold start against a populated remote: one manifest read, one read per
/// index, no body downloads, and the cache ends fully mirrored.
#[test]
fn cold_start_against_populated_remote() {
    let store = seeded_remote(8);
    let (dir, cache) = temp_cache();
    let codec = Codec::new(KEY);
    let sync = CloudSync::new(&store, &cache, &codec);

    let report = sync
        .sync_with_remote(
            OrphanPolicy::Prompt,
            None,
            &CancelToken::new(),
            &ProgressSink::detached(),
        )
        .unwrap();

    assert_eq!(report.fetched.len(), 8);
    assert_eq!(store.get_calls.load(Ordering::SeqCst), 9);

    let meta_dir = dir.path().join("meta_cache/meta_indexes");
    let count = std::fs::read_dir(&meta_dir).unwrap().count();
    assert_eq!(count, 8);
    assert!(dir.path().join("meta_cache/overall_meta.json").exists());

    let stats = cache.stats().unwrap();
    assert_eq!(stats.total_meta_files, 8);
    assert_eq!(stats.cached_bodies, 0);
}

/// Save a new session and find it leading the local listing.
#[test]
fn save_new_session_end_to_end() {
    let store = seeded_remote(2);
    let (_dir, cache) = temp_cache();
    let codec = Codec::new(KEY);
    let sync = CloudSync::new(&store, &cache, &codec);
    sync.sync_with_remote(
        OrphanPolicy::Prompt,
        None,
        &CancelToken::new(),
        &ProgressSink::detached(),
    )
    .unwrap();

    let session = session_with_images("Test", 3);
    let report = sync
        .publish(&session, &CancelToken::new(), &ProgressSink::detached())
        .unwrap();
    assert_eq!(report.manifest_retries, 0);

    let listed = cache.list_metadata().unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].filename, report.filename);
    assert_eq!(listed[0].metadata.name, "Test");

    // Round-trip the published artifact.
    let loaded = sync.load_session(&report.filename).unwrap();
    assert_eq!(loaded.windows.len(), 3);
    assert_eq!(loaded.metadata.name, "Test");
}

/// Two processes publish distinct sessions; the manifest CAS keeps both.
#[test]
fn concurrent_publish_converges() {
    let store = Arc::new(seeded_remote(0));
    let handles: Vec<_> = (0..3)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let (_dir, cache) = temp_cache();
                let codec = Codec::new(KEY);
                let sync = CloudSync::new(store.as_ref(), &cache, &codec);
                sync.publish(
                    &session_with_images(&format!("w{i}"), 1),
                    &CancelToken::new(),
                    &ProgressSink::detached(),
                )
                .map(|r| r.filename)
            })
        })
        .collect();

    let published: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    let manifest: Manifest =
        serde_json::from_slice(&store.get(OVERALL_META_KEY).unwrap().unwrap().data).unwrap();
    assert!(manifest.checksum_valid());
    assert_eq!(manifest.total_sessions, 3);
    for filename in &published {
        assert!(manifest.find(filename).is_some());
    }
}

/// Byte-flip corruption is detected, restored from remote bit-identical,
/// and the next validation is clean.
#[test]
fn corruption_recovery_round_trip() {
    let store = seeded_remote(3);
    let (dir, cache) = temp_cache();
    let codec = Codec::new(KEY);
    let sync = CloudSync::new(&store, &cache, &codec);
    sync.sync_with_remote(
        OrphanPolicy::Prompt,
        None,
        &CancelToken::new(),
        &ProgressSink::detached(),
    )
    .unwrap();

    let meta_dir = dir.path().join("meta_cache/meta_indexes");
    let victim = std::fs::read_dir(&meta_dir).unwrap().next().unwrap().unwrap();
    let mut bytes = std::fs::read(victim.path()).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x20;
    std::fs::write(victim.path(), &bytes).unwrap();

    let report = cache.validate_integrity().unwrap();
    assert_eq!(report.status, IntegrityStatus::Corrupted);
    assert_eq!(report.corrupted_files.len(), 1);

    cache.recover_from_corruption(Some(&store)).unwrap();

    let restored = std::fs::read(victim.path()).unwrap();
    let index_name = victim.file_name().to_string_lossy().into_owned();
    let session_name = index_name.replace(".meta.json", ".fastshot");
    let remote = store.get(&index_key(&session_name)).unwrap().unwrap().data;
    assert_eq!(restored, remote);
    assert_eq!(
        cache.validate_integrity().unwrap().status,
        IntegrityStatus::Valid
    );
}

/// A background sync through the operation manager reports progress and
/// completes.
#[test]
fn background_sync_through_op_manager() {
    let store = Arc::new(seeded_remote(5));
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        MetaCache::open(&CacheConfig {
            root_dir: Some(dir.path().to_path_buf()),
            max_body_bytes: u64::MAX,
        })
        .unwrap(),
    );

    let manager = OpManager::new(3, 5, Duration::from_secs(3600), usize::MAX);
    let store_in_job = Arc::clone(&store);
    let cache_in_job = Arc::clone(&cache);

    let id = manager.submit(
        OpKind::SyncMetadata,
        Box::new(move |token, sink| {
            let codec = Codec::new(KEY);
            let sync = CloudSync::new(store_in_job.as_ref(), &cache_in_job, &codec);
            let report = sync.sync_with_remote(OrphanPolicy::Prompt, None, token, sink)?;
            Ok(json!({"fetched": report.fetched.len()}))
        }),
        None,
    );

    let record = manager.wait(&id, Duration::from_secs(30)).unwrap();
    assert_eq!(record.state, OpState::Completed);
    assert_eq!(record.result, Some(json!({"fetched": 5})));
    assert_eq!(cache.stats().unwrap().total_meta_files, 5);
}

/// Cancelling a rebuild through the manager leaves no partial manifest.
#[test]
fn cancelled_rebuild_leaves_consistent_remote() {
    let store = Arc::new(seeded_remote(10));
    for i in 0..10 {
        let filename = format!("202503150910{i:02}_seed{i}.fastshot");
        store.delete(&index_key(&filename)).unwrap();
    }
    store.delete(OVERALL_META_KEY).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        MetaCache::open(&CacheConfig {
            root_dir: Some(dir.path().to_path_buf()),
            max_body_bytes: u64::MAX,
        })
        .unwrap(),
    );

    let manager = OpManager::new(1, 0, Duration::from_secs(3600), usize::MAX);
    let store_in_job = Arc::clone(&store);
    let cache_in_job = Arc::clone(&cache);

    // The rebuild watches this token alongside the manager's: the
    // progress callback trips it deterministically mid-run.
    let token = CancelToken::new();
    let token_in_job = token.clone();
    let token_in_callback = token.clone();

    let id = manager.submit(
        OpKind::RebuildIndexes,
        Box::new(move |_token, sink| {
            let codec = Codec::new(KEY);
            let sync = CloudSync::new(store_in_job.as_ref(), &cache_in_job, &codec);
            let report = sync.rebuild_all_indexes(&token_in_job, sink)?;
            Ok(serde_json::to_value(report)?)
        }),
        Some(Arc::new(move |_fraction: f64, message: &str| {
            // Three bodies fully processed; cancel before the fourth.
            if message.contains("(4/10)") {
                token_in_callback.cancel();
            }
        })),
    );

    let record = manager.wait(&id, Duration::from_secs(30)).unwrap();
    assert_eq!(record.state, OpState::Cancelled);
    // The three finished index uploads remain; the manifest was never
    // rewritten.
    assert_eq!(
        store.list("meta_indexes/").unwrap().len(),
        3,
        "exactly the pre-cancel uploads should remain"
    );
    assert!(store.head(OVERALL_META_KEY).unwrap().is_none());
}

/// Local-only mode: missing credentials degrade to NotConfigured while
/// the cache keeps serving reads.
#[test]
fn unconfigured_remote_degrades_to_local_reads() {
    let cfg = snapvault_core::config::SnapConfig::default();
    let err = snapvault_storage::from_config(&cfg.object_store).unwrap_err();
    assert!(matches!(err, SnapError::NotConfigured(_)));

    let (_dir, cache) = temp_cache();
    cache
        .put_metadata(snapvault_core::meta::MetaIndex::new(
            "20250101000000_local.fastshot",
            snapvault_core::meta::SessionMeta::default(),
        ))
        .unwrap();
    assert_eq!(cache.list_metadata().unwrap().len(), 1);
}
