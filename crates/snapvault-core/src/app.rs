//! Application facade: wires configuration into the store, cache, codec,
//! and operation manager, and exposes the background entry points the UI
//! consumes.
//!
//! Construction order: config first, then the store (optional: missing
//! credentials mean local-only mode), then the cache (takes no lock until
//! a write), then the worker pool.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use snapvault_storage::ObjectStore;
use snapvault_types::{Result, SnapError};

use crate::artifact::Codec;
use crate::cache::{CacheStats, IntegrityReport, MetaCache, RecoveryReport};
use crate::config::SnapConfig;
use crate::meta::MetaIndex;
use crate::ops::{OpKind, OpManager, OpRecord};
use crate::session::Session;
use crate::sync::CloudSync;

pub struct SnapVault {
    config: SnapConfig,
    store: Option<Arc<dyn ObjectStore>>,
    cache: Arc<MetaCache>,
    codec: Arc<Codec>,
    ops: OpManager,
}

impl SnapVault {
    pub fn open(config: SnapConfig) -> Result<Self> {
        let store = match snapvault_storage::from_config_with_timeout(
            &config.object_store,
            Duration::from_secs(config.sync.op_timeout_s),
        ) {
            Ok(store) => Some(Arc::from(store)),
            Err(SnapError::NotConfigured(reason)) => {
                info!("running local-only: {reason}");
                None
            }
            Err(e) => return Err(e),
        };
        let cache = Arc::new(MetaCache::open(&config.cache)?);
        let codec = Arc::new(Codec::new(&config.security.encryption_key));
        let ops = OpManager::new(
            config.sync.workers,
            config.sync.retry_max,
            Duration::from_secs(config.sync.op_retention_s),
            config.sync.result_memory_cap_bytes,
        );
        Ok(Self {
            config,
            store,
            cache,
            codec,
            ops,
        })
    }

    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    pub fn ops(&self) -> &OpManager {
        &self.ops
    }

    pub fn is_remote_configured(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.store.clone().ok_or_else(|| {
            SnapError::NotConfigured("remote operations need object store credentials".into())
        })
    }

    // ---- synchronous read API (no network) --------------------------

    pub fn list_metadata(&self) -> Result<Vec<MetaIndex>> {
        self.cache.list_metadata()
    }

    pub fn get_metadata(&self, filename: &str) -> Result<MetaIndex> {
        self.cache.get_metadata(filename)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        self.cache.stats()
    }

    pub fn validate_integrity(&self) -> Result<IntegrityReport> {
        self.cache.validate_integrity()
    }

    pub fn recover_from_corruption(&self) -> Result<RecoveryReport> {
        match &self.store {
            Some(store) => self.cache.recover_from_corruption(Some(store.as_ref())),
            None => self.cache.recover_from_corruption(None),
        }
    }

    // ---- background operations --------------------------------------

    /// Reconcile the cache with the remote manifest in the background.
    pub fn submit_sync(&self) -> Result<String> {
        let store = self.store()?;
        let cache = Arc::clone(&self.cache);
        let codec = Arc::clone(&self.codec);
        let policy = self.config.sync.orphan_policy;
        let retry_max = self.config.sync.retry_max;
        Ok(self.ops.submit(
            OpKind::SyncMetadata,
            Box::new(move |token, sink| {
                let sync = CloudSync::new(store.as_ref(), &cache, &codec).with_retry_max(retry_max);
                let report = sync.sync_with_remote(policy, None, token, sink)?;
                Ok(serde_json::to_value(report)?)
            }),
            None,
        ))
    }

    /// Publish a session (body, index, manifest) in the background.
    pub fn submit_publish(&self, session: Session) -> Result<String> {
        let store = self.store()?;
        let cache = Arc::clone(&self.cache);
        let codec = Arc::clone(&self.codec);
        let retry_max = self.config.sync.retry_max;
        Ok(self.ops.submit(
            OpKind::Publish,
            Box::new(move |token, sink| {
                let sync = CloudSync::new(store.as_ref(), &cache, &codec).with_retry_max(retry_max);
                let report = sync.publish(&session, token, sink)?;
                Ok(serde_json::to_value(report)?)
            }),
            None,
        ))
    }

    pub fn submit_delete(&self, filename: String) -> Result<String> {
        let store = self.store()?;
        let cache = Arc::clone(&self.cache);
        let codec = Arc::clone(&self.codec);
        Ok(self.ops.submit(
            OpKind::DeleteSession,
            Box::new(move |token, _sink| {
                let sync = CloudSync::new(store.as_ref(), &cache, &codec);
                sync.delete_session(&filename, token)?;
                Ok(serde_json::Value::Null)
            }),
            None,
        ))
    }

    pub fn submit_rebuild_indexes(&self) -> Result<String> {
        let store = self.store()?;
        let cache = Arc::clone(&self.cache);
        let codec = Arc::clone(&self.codec);
        Ok(self.ops.submit(
            OpKind::RebuildIndexes,
            Box::new(move |token, sink| {
                let sync = CloudSync::new(store.as_ref(), &cache, &codec);
                let report = sync.rebuild_all_indexes(token, sink)?;
                Ok(serde_json::to_value(report)?)
            }),
            None,
        ))
    }

    pub fn submit_repair(&self) -> Result<String> {
        let store = self.store()?;
        let cache = Arc::clone(&self.cache);
        let codec = Arc::clone(&self.codec);
        Ok(self.ops.submit(
            OpKind::Repair,
            Box::new(move |token, sink| {
                let sync = CloudSync::new(store.as_ref(), &cache, &codec);
                let report = sync.repair_cloud_structure(token, sink)?;
                Ok(serde_json::to_value(report)?)
            }),
            None,
        ))
    }

    pub fn submit_download(&self, filename: String) -> Result<String> {
        let store = self.store()?;
        let cache = Arc::clone(&self.cache);
        let codec = Arc::clone(&self.codec);
        Ok(self.ops.submit(
            OpKind::DownloadBody,
            Box::new(move |token, _sink| {
                token.check()?;
                let sync = CloudSync::new(store.as_ref(), &cache, &codec);
                let body = sync.download_body(&filename, true)?;
                Ok(serde_json::json!({"filename": filename, "bytes": body.len()}))
            }),
            None,
        ))
    }

    pub fn cancel(&self, op_id: &str) -> bool {
        self.ops.cancel(op_id)
    }

    pub fn status(&self, op_id: &str) -> Option<OpRecord> {
        self.ops.status(op_id)
    }
}
