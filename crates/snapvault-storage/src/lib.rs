pub mod http_util;
pub mod local;
pub mod memory;
pub mod retry;
pub mod s3;

use serde::{Deserialize, Serialize};

use snapvault_types::error::{Result, SnapError};

pub use retry::RetryPolicy;

/// Metadata for one remote object, as returned by `head` and `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// `/`-separated key relative to the store root.
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// An object body together with the etag it was read at.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub data: Vec<u8>,
    pub etag: Option<String>,
}

/// Abstract key-value object store.
/// Keys are `/`-separated string paths (e.g. "meta_indexes/x.meta.json").
///
/// Implementations must be safe for concurrent calls: one instance is
/// shared across all worker threads.
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Read an object by key. Returns `None` if not found.
    fn get(&self, key: &str) -> Result<Option<ObjectBody>>;

    /// Write an object, returning the new etag when the backend reports one.
    ///
    /// With `if_match = Some(etag)` the write only succeeds if the remote
    /// object still carries that etag; a lost race surfaces as
    /// `SnapError::PreconditionFailed`. This is the compare-and-swap used
    /// to serialize manifest writers across processes.
    fn put(&self, key: &str, data: &[u8], if_match: Option<&str>) -> Result<Option<String>>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Metadata-only probe. Returns `None` if not found.
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Fetch one page of keys under a prefix.
    ///
    /// `token` is the continuation token from the previous page; the
    /// returned token is `None` on the last page. Backends without native
    /// pagination return everything in one page.
    fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<(Vec<ObjectMeta>, Option<String>)>;

    /// List all keys under a prefix, draining pages.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let (mut page, next) = self.list_page(prefix, token.as_deref())?;
            out.append(&mut page);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(out)
    }
}

/// Connection settings for the remote object store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Endpoint URL, e.g. "https://s3.us-east-1.amazonaws.com".
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Optional HTTP(S) proxy for corporate environments.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// TLS certificate verification. Disable only behind TLS-intercepting
    /// proxies; a warning is logged when off.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_tls_verify() -> bool {
    true
}

impl ObjectStoreConfig {
    /// Whether enough settings are present to reach a remote at all.
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.bucket.is_empty()
            && !self.access_key.is_empty()
            && !self.secret_key.is_empty()
    }
}

/// Build the remote store from configuration.
///
/// Missing credentials degrade to `NotConfigured` so callers can fall back
/// to local-only mode instead of failing on every remote call.
pub fn from_config(cfg: &ObjectStoreConfig) -> Result<Box<dyn ObjectStore>> {
    from_config_with_timeout(cfg, std::time::Duration::from_secs(30))
}

/// Like [`from_config`], with an explicit per-call deadline.
pub fn from_config_with_timeout(
    cfg: &ObjectStoreConfig,
    op_timeout: std::time::Duration,
) -> Result<Box<dyn ObjectStore>> {
    if !cfg.is_configured() {
        let mut missing = Vec::new();
        if cfg.endpoint.is_empty() {
            missing.push("endpoint");
        }
        if cfg.bucket.is_empty() {
            missing.push("bucket");
        }
        if cfg.access_key.is_empty() {
            missing.push("access_key");
        }
        if cfg.secret_key.is_empty() {
            missing.push("secret_key");
        }
        return Err(SnapError::NotConfigured(format!(
            "missing object_store settings: {}",
            missing.join(", ")
        )));
    }
    Ok(Box::new(s3::S3Store::with_timeout(cfg, op_timeout)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_store_reports_missing_fields() {
        let cfg = ObjectStoreConfig::default();
        let err = from_config(&cfg).unwrap_err();
        match err {
            SnapError::NotConfigured(msg) => {
                assert!(msg.contains("endpoint"));
                assert!(msg.contains("bucket"));
                assert!(msg.contains("access_key"));
                assert!(msg.contains("secret_key"));
            }
            other => panic!("expected NotConfigured, got {other:?}"),
        }
    }

    #[test]
    fn partially_configured_store_is_not_configured() {
        let cfg = ObjectStoreConfig {
            endpoint: "https://minio.local:9000".into(),
            bucket: "snapvault".into(),
            ..Default::default()
        };
        assert!(!cfg.is_configured());
    }

    #[test]
    fn list_drains_pages() {
        let store = memory::MemoryStore::new();
        for i in 0..7 {
            store
                .put(&format!("meta_indexes/{i}.meta.json"), b"{}", None)
                .unwrap();
        }
        let keys = store.list("meta_indexes/").unwrap();
        assert_eq!(keys.len(), 7);
    }
}
