use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snapvault_types::{Checksum, Result, SnapError};

pub const DOCUMENT_VERSION: &str = "1.0";
/// Version stamped onto indexes that predate the `version` field.
pub const LEGACY_VERSION: &str = "0.9";

fn legacy_version() -> String {
    LEGACY_VERSION.to_string()
}

fn document_version() -> String {
    DOCUMENT_VERSION.to_string()
}

fn canonical_json<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(doc)?)
}

/// The user-facing metadata block shared by the session JSON and the
/// per-session index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub image_count: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file_size: u64,
}

/// The lightweight per-session index stored under `meta_indexes/`.
///
/// `checksum` is the document's own digest: SHA-256 over the canonical
/// serialization with `checksum` set to null. The manifest entry for the
/// same filename carries the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaIndex {
    #[serde(default = "legacy_version")]
    pub version: String,
    pub filename: String,
    #[serde(default)]
    pub metadata: SessionMeta,
    #[serde(default)]
    pub checksum: Option<Checksum>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl MetaIndex {
    /// Build an index for a session filename. Sealed before persisting.
    pub fn new(filename: impl Into<String>, metadata: SessionMeta) -> Self {
        let now = Utc::now();
        Self {
            version: document_version(),
            filename: filename.into(),
            metadata,
            checksum: None,
            created_at: now,
            last_updated: now,
        }
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut doc = self.clone();
        doc.checksum = None;
        canonical_json(&doc)
    }

    pub fn compute_checksum(&self) -> Result<Checksum> {
        Ok(Checksum::of_bytes(&self.canonical_bytes()?))
    }

    /// Stamp the document checksum (recomputed from current content).
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = Some(self.compute_checksum()?);
        Ok(())
    }

    /// True when the stored checksum matches the document content.
    pub fn checksum_valid(&self) -> bool {
        match (&self.checksum, self.compute_checksum()) {
            (Some(stored), Ok(computed)) => *stored == computed,
            _ => false,
        }
    }

    /// Whether this index predates the current document version.
    pub fn is_legacy(&self) -> bool {
        self.version != DOCUMENT_VERSION
    }

    /// Upgrade a legacy document in place: current version, refreshed
    /// `last_updated`, resealed checksum. No-op for current documents.
    pub fn upgrade(&mut self) -> Result<()> {
        if self.is_legacy() {
            self.version = document_version();
            self.last_updated = Utc::now();
            self.seal()?;
        }
        Ok(())
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            filename: self.filename.clone(),
            created_at: self.metadata.created_at.unwrap_or(self.created_at),
            file_size: self.metadata.file_size,
            checksum: self.checksum.clone(),
        }
    }

    /// Parse index bytes and verify internal consistency: document
    /// checksum and, when given, the expected session filename.
    pub fn parse_verified(bytes: &[u8], expect_filename: Option<&str>) -> Result<Self> {
        let index: MetaIndex = serde_json::from_slice(bytes)
            .map_err(|e| SnapError::SchemaMismatch(format!("meta index: {e}")))?;
        if index.filename.is_empty() {
            return Err(SnapError::SchemaMismatch(
                "meta index missing filename".into(),
            ));
        }
        if let Some(expected) = expect_filename {
            if index.filename != expected {
                return Err(SnapError::Integrity(format!(
                    "meta index filename mismatch: expected '{expected}', found '{}'",
                    index.filename
                )));
            }
        }
        if index.checksum.is_some() && !index.checksum_valid() {
            return Err(SnapError::Integrity(format!(
                "meta index checksum mismatch for '{}'",
                index.filename
            )));
        }
        Ok(index)
    }
}

/// One entry in the overall manifest's session list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub file_size: u64,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

/// The single `overall_meta.json` listing every session in the remote
/// namespace. Rewritten via etag CAS on every create/delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "document_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub total_sessions: usize,
    #[serde(default)]
    pub sessions: Vec<ManifestEntry>,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: document_version(),
            last_updated: Utc::now(),
            total_sessions: 0,
            sessions: Vec::new(),
            checksum: None,
        }
    }

    pub fn find(&self, filename: &str) -> Option<&ManifestEntry> {
        self.sessions.iter().find(|e| e.filename == filename)
    }

    /// Insert or replace an entry. New filenames are prepended so the
    /// freshest session lists first; an existing filename is replaced in
    /// place (idempotent publish).
    pub fn upsert(&mut self, entry: ManifestEntry) {
        if let Some(existing) = self
            .sessions
            .iter_mut()
            .find(|e| e.filename == entry.filename)
        {
            *existing = entry;
        } else {
            self.sessions.insert(0, entry);
        }
        self.touch();
    }

    /// Remove an entry by filename. Returns the removed entry, if any.
    pub fn remove(&mut self, filename: &str) -> Option<ManifestEntry> {
        let pos = self.sessions.iter().position(|e| e.filename == filename)?;
        let removed = self.sessions.remove(pos);
        self.touch();
        Some(removed)
    }

    pub fn filenames(&self) -> HashSet<String> {
        self.sessions.iter().map(|e| e.filename.clone()).collect()
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
        self.total_sessions = self.sessions.len();
        self.checksum = None;
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut doc = self.clone();
        doc.checksum = None;
        canonical_json(&doc)
    }

    /// Stamp the manifest's own checksum. Called before every persist.
    pub fn seal(&mut self) -> Result<()> {
        self.total_sessions = self.sessions.len();
        self.checksum = Some(Checksum::of_bytes(&self.canonical_bytes()?));
        Ok(())
    }

    pub fn checksum_valid(&self) -> bool {
        match (&self.checksum, self.canonical_bytes()) {
            (Some(stored), Ok(bytes)) => *stored == Checksum::of_bytes(&bytes),
            _ => false,
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of an integrity validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    #[default]
    Unknown,
    Valid,
    Corrupted,
    Cleared,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityCheck {
    #[serde(default)]
    pub last_validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: IntegrityStatus,
    #[serde(default)]
    pub corrupted_files: Vec<String>,
}

/// Bookkeeping document at `meta_cache/cache_info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    #[serde(default = "document_version")]
    pub version: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cache_size_bytes: u64,
    #[serde(default)]
    pub total_meta_files: usize,
    #[serde(default)]
    pub integrity_check: IntegrityCheck,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

impl CacheInfo {
    pub fn new() -> Self {
        Self {
            version: document_version(),
            last_sync: None,
            cache_size_bytes: 0,
            total_meta_files: 0,
            integrity_check: IntegrityCheck::default(),
            checksum: None,
        }
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut doc = self.clone();
        doc.checksum = None;
        canonical_json(&doc)
    }

    pub fn seal(&mut self) -> Result<()> {
        self.checksum = Some(Checksum::of_bytes(&self.canonical_bytes()?));
        Ok(())
    }

    pub fn checksum_valid(&self) -> bool {
        match (&self.checksum, self.canonical_bytes()) {
            (Some(stored), Ok(bytes)) => *stored == Checksum::of_bytes(&bytes),
            _ => false,
        }
    }
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a session filename to its index filename and back.
pub fn index_filename(session_filename: &str) -> String {
    let base = session_filename
        .strip_suffix(".fastshot")
        .unwrap_or(session_filename);
    format!("{base}.meta.json")
}

pub fn session_filename_of_index(index_filename: &str) -> Option<String> {
    index_filename
        .strip_suffix(".meta.json")
        .map(|base| format!("{base}.fastshot"))
}
