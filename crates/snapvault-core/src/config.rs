use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use snapvault_storage::ObjectStoreConfig;

/// Top-level configuration for the cache/sync core.
///
/// The application is responsible for loading this from wherever it keeps
/// settings; the core only consumes the parsed structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapConfig {
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local cache root. Default: `~/.snapvault`.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    /// Soft cap on the on-demand session body cache.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Background worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-call deadline for remote operations.
    #[serde(default = "default_op_timeout_s")]
    pub op_timeout_s: u64,
    /// Retry budget for transient failures inside a worker.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    /// How long completed operation records are retained.
    #[serde(default = "default_op_retention_s")]
    pub op_retention_s: u64,
    /// Soft cap on memory held by retained operation results.
    #[serde(default = "default_result_memory_cap_bytes")]
    pub result_memory_cap_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            op_timeout_s: default_op_timeout_s(),
            retry_max: default_retry_max(),
            orphan_policy: OrphanPolicy::default(),
            op_retention_s: default_op_retention_s(),
            result_memory_cap_bytes: default_result_memory_cap_bytes(),
        }
    }
}

/// What to do with a cached entry whose filename the remote manifest no
/// longer lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Retain the entry and flag it in the sync report.
    Keep,
    /// Remove the cached index and, if present, the cached body.
    Delete,
    /// Ask the registered decision hook per entry; without a hook the
    /// entry is kept and flagged.
    #[default]
    Prompt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Passphrase for the artifact keystream. Empty disables the
    /// keystream (payload still framed behind the sentinel).
    #[serde(default)]
    pub encryption_key: String,
}

fn default_max_body_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_workers() -> usize {
    3
}

fn default_op_timeout_s() -> u64 {
    30
}

fn default_retry_max() -> u32 {
    5
}

fn default_op_retention_s() -> u64 {
    3600
}

fn default_result_memory_cap_bytes() -> usize {
    8 * 1024 * 1024
}
