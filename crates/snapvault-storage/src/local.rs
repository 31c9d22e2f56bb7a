use std::fs;
use std::path::{Component, PathBuf};

use sha2::{Digest, Sha256};

use snapvault_types::error::{Result, SnapError};

use crate::{ObjectBody, ObjectMeta, ObjectStore};

/// Object store backend on the local filesystem.
///
/// Used for tests and for fully offline setups. Etags are content digests,
/// so `if_match` works the same way as against a remote store, though the
/// read-compare-write sequence is not atomic across processes (the cache
/// writer lock already serializes writers on the same machine).
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at the given directory path.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root_path: PathBuf = root.into();
        // Canonicalize if the path already exists for clearer errors and
        // correct strip_prefix behavior with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            fs::create_dir_all(&root_path)?;
            fs::canonicalize(&root_path)?
        };
        Ok(Self { root })
    }

    /// Reject storage keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(SnapError::Config("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(SnapError::Config(format!("unsafe storage key: '{key}'")));
        }
        for component in std::path::Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(SnapError::Config(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn content_etag(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn list_recursive(&self, dir: &std::path::Path, out: &mut Vec<ObjectMeta>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    let size = entry.metadata()?.len();
                    out.push(ObjectMeta {
                        key,
                        size,
                        etag: None,
                    });
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalStore {
    fn get(&self, key: &str) -> Result<Option<ObjectBody>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => {
                let etag = Some(Self::content_etag(&data));
                Ok(Some(ObjectBody { data, etag }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8], if_match: Option<&str>) -> Result<Option<String>> {
        let path = self.resolve(key)?;
        if let Some(expected) = if_match {
            let current = match fs::read(&path) {
                Ok(bytes) => Self::content_etag(&bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SnapError::PreconditionFailed(key.to_string()));
                }
                Err(e) => return Err(e.into()),
            };
            if current != expected {
                return Err(SnapError::PreconditionFailed(key.to_string()));
            }
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(Some(Self::content_etag(data)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: data.len() as u64,
                etag: Some(Self::content_etag(&data)),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_page(
        &self,
        prefix: &str,
        _token: Option<&str>,
    ) -> Result<(Vec<ObjectMeta>, Option<String>)> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        let mut out = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&dir, &mut out)?,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok((out, None))
    }
}
