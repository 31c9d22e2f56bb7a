use tempfile::TempDir;

use snapvault_storage::memory::MemoryStore;
use snapvault_storage::ObjectStore;

use crate::artifact::{thumbnail, Codec};
use crate::cache::MetaCache;
use crate::config::CacheConfig;
use crate::meta::{Manifest, MetaIndex, SessionMeta};
use crate::session::{Session, SessionWindow, WindowGeometry};
use crate::sync::{index_key, session_key, OVERALL_META_KEY};

pub const TEST_KEY: &str = "test-passphrase";

pub fn temp_cache() -> (TempDir, MetaCache) {
    temp_cache_with_body_cap(500 * 1024 * 1024)
}

pub fn temp_cache_with_body_cap(max_body_bytes: u64) -> (TempDir, MetaCache) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = MetaCache::open(&CacheConfig {
        root_dir: Some(dir.path().to_path_buf()),
        max_body_bytes,
    })
    .expect("open cache");
    (dir, cache)
}

pub fn sample_meta(name: &str) -> SessionMeta {
    SessionMeta {
        name: name.to_string(),
        desc: format!("{name} session"),
        tags: vec!["t1".into()],
        color: "blue".into(),
        ..Default::default()
    }
}

pub fn sample_index(filename: &str) -> MetaIndex {
    let mut index = MetaIndex::new(filename, sample_meta("Test"));
    index.seal().expect("seal");
    index
}

pub fn sample_session(name: &str, images: usize) -> Session {
    let mut session = Session::new(sample_meta(name));
    for i in 0..images {
        let png = thumbnail::encode_png(&image::DynamicImage::ImageRgb8(
            image::RgbImage::from_pixel(32, 24, image::Rgb([(i * 50) as u8, 100, 150])),
        ))
        .expect("png");
        session.windows.push(SessionWindow {
            geometry: WindowGeometry {
                x: 0,
                y: 0,
                width: 32,
                height: 24,
            },
            scale: 1.0,
            image_png: Some(png),
            draw_history: Vec::new(),
        });
    }
    session
}

pub fn test_filename(i: usize) -> String {
    format!("202501010000{i:02}_s{i}.fastshot")
}

/// Populate a memory store with `n` complete sessions: body, index, and a
/// manifest listing all of them.
pub fn seeded_remote(n: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let codec = Codec::new(TEST_KEY);
    let mut manifest = Manifest::new();

    for i in 0..n {
        let filename = test_filename(i);
        let body = codec.encode(&sample_session(&format!("s{i}"), 1)).expect("encode");
        let index = codec.derive_index(&body, &filename).expect("derive");

        store
            .put(&session_key(&filename), &body, None)
            .expect("put body");
        store
            .put(
                &index_key(&filename),
                &serde_json::to_vec_pretty(&index).expect("json"),
                None,
            )
            .expect("put index");
        manifest.upsert(index.manifest_entry());
    }

    manifest.seal().expect("seal");
    store
        .put(
            OVERALL_META_KEY,
            &serde_json::to_vec_pretty(&manifest).expect("json"),
            None,
        )
        .expect("put manifest");
    // Seeding traffic shouldn't count toward the call counts tests assert.
    store.get_calls.store(0, std::sync::atomic::Ordering::SeqCst);
    store.put_calls.store(0, std::sync::atomic::Ordering::SeqCst);
    store
}
