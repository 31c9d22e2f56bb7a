use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapError>;

/// Error taxonomy for the cache/sync core.
///
/// Every public operation returns either a value or one of these kinds;
/// `is_transient()` is the single source of truth for retry policy.
#[derive(Debug, Error)]
pub enum SnapError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("access denied: {0}")]
    AuthDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed on '{0}': remote changed underneath us")]
    PreconditionFailed(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),

    #[error("decryption failed: wrong passphrase or corrupted payload")]
    DecryptionFailed,

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("cloud sync not configured: {0}")]
    NotConfigured(String),

    #[error("cache is locked by another process ({0})")]
    Locked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported object store: '{0}'")]
    UnsupportedStore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl SnapError {
    /// Whether a retry with backoff may succeed.
    ///
    /// `PreconditionFailed` counts as transient: the manifest CAS loop
    /// re-reads and retries on it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SnapError::Transient(_) | SnapError::PreconditionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SnapError::Transient("timeout".into()).is_transient());
        assert!(SnapError::PreconditionFailed("overall_meta.json".into()).is_transient());

        assert!(!SnapError::AuthDenied("403".into()).is_transient());
        assert!(!SnapError::NotFound("key".into()).is_transient());
        assert!(!SnapError::DecryptionFailed.is_transient());
        assert!(!SnapError::Cancelled.is_transient());
        assert!(!SnapError::Fatal("disk full".into()).is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = SnapError::Locked("pid:4242".into());
        assert!(err.to_string().contains("pid:4242"));
    }
}
