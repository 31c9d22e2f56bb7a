use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use snapvault_types::error::{Result, SnapError};

use crate::{ObjectBody, ObjectMeta, ObjectStore};

/// In-memory object store for testing. Thread-safe via Mutex.
///
/// Etags are monotonic per-store counters, so `if_match` behaves as a
/// real compare-and-swap; tests can also inject failures per key and
/// inspect call counters.
#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    etag_counter: AtomicU64,
    /// Keys whose next operation should fail with a transient error.
    fail_keys: Mutex<HashMap<String, u32>>,
    pub get_calls: AtomicU64,
    pub put_calls: AtomicU64,
}

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            etag_counter: AtomicU64::new(1),
            fail_keys: Mutex::new(HashMap::new()),
            get_calls: AtomicU64::new(0),
            put_calls: AtomicU64::new(0),
        }
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.etag_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Make the next `count` operations touching keys under `prefix`
    /// fail transiently.
    pub fn fail_next(&self, prefix: &str, count: u32) {
        self.fail_keys
            .lock()
            .unwrap()
            .insert(prefix.to_string(), count);
    }

    fn check_injected_failure(&self, key: &str) -> Result<()> {
        let mut failures = self.fail_keys.lock().unwrap();
        let prefix = failures
            .keys()
            .find(|prefix| key.starts_with(prefix.as_str()))
            .cloned();
        if let Some(prefix) = prefix {
            if let Some(remaining) = failures.get_mut(&prefix) {
                if *remaining > 0 {
                    *remaining -= 1;
                    if *remaining == 0 {
                        failures.remove(&prefix);
                    }
                    return Err(SnapError::Transient(format!("injected failure for {key}")));
                }
            }
        }
        Ok(())
    }

    pub fn key_count(&self, prefix: &str) -> usize {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<ObjectBody>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_injected_failure(key)?;
        let map = self.objects.lock().unwrap();
        Ok(map.get(key).map(|obj| ObjectBody {
            data: obj.data.clone(),
            etag: Some(obj.etag.clone()),
        }))
    }

    fn put(&self, key: &str, data: &[u8], if_match: Option<&str>) -> Result<Option<String>> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_injected_failure(key)?;
        let mut map = self.objects.lock().unwrap();
        if let Some(expected) = if_match {
            match map.get(key) {
                Some(obj) if obj.etag == expected => {}
                _ => return Err(SnapError::PreconditionFailed(key.to_string())),
            }
        }
        let etag = self.next_etag();
        map.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                etag: etag.clone(),
            },
        );
        Ok(Some(etag))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_injected_failure(key)?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        self.check_injected_failure(key)?;
        let map = self.objects.lock().unwrap();
        Ok(map.get(key).map(|obj| ObjectMeta {
            key: key.to_string(),
            size: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
        }))
    }

    fn list_page(
        &self,
        prefix: &str,
        _token: Option<&str>,
    ) -> Result<(Vec<ObjectMeta>, Option<String>)> {
        let map = self.objects.lock().unwrap();
        let page = map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, obj)| ObjectMeta {
                key: k.clone(),
                size: obj.data.len() as u64,
                etag: Some(obj.etag.clone()),
            })
            .collect();
        Ok((page, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_succeeds_with_current_etag() {
        let store = MemoryStore::new();
        let etag = store.put("overall_meta.json", b"v1", None).unwrap().unwrap();
        let new_etag = store
            .put("overall_meta.json", b"v2", Some(&etag))
            .unwrap()
            .unwrap();
        assert_ne!(etag, new_etag);
    }

    #[test]
    fn cas_fails_after_concurrent_write() {
        let store = MemoryStore::new();
        let etag = store.put("overall_meta.json", b"v1", None).unwrap().unwrap();
        // Another writer gets in between.
        store.put("overall_meta.json", b"v2", None).unwrap();
        let err = store
            .put("overall_meta.json", b"v3", Some(&etag))
            .unwrap_err();
        assert!(matches!(err, SnapError::PreconditionFailed(_)));
    }

    #[test]
    fn cas_against_missing_key_fails() {
        let store = MemoryStore::new();
        let err = store
            .put("overall_meta.json", b"v1", Some("etag-0"))
            .unwrap_err();
        assert!(matches!(err, SnapError::PreconditionFailed(_)));
    }

    #[test]
    fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.put("k", b"v", None).unwrap();
        store.fail_next("k", 2);
        assert!(store.get("k").is_err());
        assert!(store.get("k").is_err());
        assert!(store.get("k").unwrap().is_some());
    }

    #[test]
    fn list_respects_prefix() {
        let store = MemoryStore::new();
        store.put("sessions/a.fastshot", b"1", None).unwrap();
        store.put("meta_indexes/a.meta.json", b"2", None).unwrap();
        let keys = store.list("sessions/").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "sessions/a.fastshot");
    }
}
