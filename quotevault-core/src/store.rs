//! Key-value store abstraction over the cache directory tree.
//!
//! Every cache layer persists through this interface instead of touching
//! paths directly, so the backing store can be swapped without touching
//! cache logic. The filesystem backend enforces the one shared-resource
//! discipline this system needs: per-key atomic replace (write to `.tmp`,
//! rename into place), which makes same-key write races safe (last writer
//! wins) and guarantees readers never observe a torn file.

use crate::error::DataError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Minimal key-value contract used by all caches. Keys are relative
/// `/`-separated paths, e.g. `min/p5/stock/600000/20240301.csv`.
pub trait KvStore: Send + Sync {
    /// Read a value. Absent keys and unreadable values both return `None`;
    /// read failures are logged, never propagated.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Atomically replace the value for a key.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), DataError>;

    fn exists(&self, key: &str) -> bool;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), DataError>;

    /// List keys under a prefix, sorted. An empty prefix lists every key.
    /// Used by cache status reporting and backup.
    fn list(&self, prefix: &str) -> Vec<String>;
}

/// Copy every key from one store into another. Keys are re-validated by the
/// destination's `put`, so a hostile tree cannot escape the target root.
/// Returns the number of keys copied.
pub fn copy_tree(src: &dyn KvStore, dst: &dyn KvStore) -> Result<usize, DataError> {
    let mut copied = 0;
    for key in src.list("") {
        let value = src
            .get(&key)
            .ok_or_else(|| DataError::CacheIo(format!("unreadable source key {key}")))?;
        dst.put(&key, &value)?;
        copied += 1;
    }
    Ok(copied)
}

/// Filesystem-backed store rooted at a single directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, DataError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(DataError::CacheIo(format!("invalid store key: {key:?}")));
        }
        Ok(self.root.join(key))
    }
}

impl KvStore for FsStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.resolve(key).ok()?;
        if !path.exists() {
            return None;
        }
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DataError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DataError::CacheIo(format!("create dir for {key}: {e}")))?;
        }

        let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.tmp"),
            None => "tmp".to_string(),
        });
        fs::write(&tmp, value).map_err(|e| DataError::CacheIo(format!("write {key}: {e}")))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            DataError::CacheIo(format!("atomic rename for {key}: {e}"))
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve(key).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove(&self, key: &str) -> Result<(), DataError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DataError::CacheIo(format!("remove {key}: {e}"))),
        }
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            match self.resolve(prefix) {
                Ok(p) => p,
                Err(_) => return Vec::new(),
            }
        };
        let mut keys = Vec::new();
        collect_files(&base, &self.root, &mut keys);
        keys.sort();
        keys
    }
}

fn collect_files(dir: &Path, root: &Path, keys: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, root, keys);
        } else if let Ok(rel) = path.strip_prefix(root) {
            // Skip leftovers from interrupted writes.
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            keys.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_exists_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        assert!(store.get("a/b.csv").is_none());
        assert!(!store.exists("a/b.csv"));

        store.put("a/b.csv", b"hello").unwrap();
        assert!(store.exists("a/b.csv"));
        assert_eq!(store.get("a/b.csv").unwrap(), b"hello");

        store.remove("a/b.csv").unwrap();
        assert!(!store.exists("a/b.csv"));
        // Removing again is a no-op.
        store.remove("a/b.csv").unwrap();
    }

    #[test]
    fn put_replaces_whole_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.put("k.json", b"first version, longer").unwrap();
        store.put("k.json", b"second").unwrap();
        assert_eq!(store.get("k.json").unwrap(), b"second");
    }

    #[test]
    fn put_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.put("x/y.csv", b"data").unwrap();
        assert!(!dir.path().join("x/y.csv.tmp").exists());
    }

    #[test]
    fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        assert!(store.put("../escape", b"x").is_err());
        assert!(store.put("/abs", b"x").is_err());
        assert!(store.put("", b"x").is_err());
    }

    #[test]
    fn list_returns_sorted_keys_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.put("p5/stock/600000/20240301.csv", b"x").unwrap();
        store.put("p5/stock/600000/20240229.csv", b"x").unwrap();
        store.put("p5/index/000300/20240301.csv", b"x").unwrap();

        let keys = store.list("p5/stock");
        assert_eq!(
            keys,
            vec![
                "p5/stock/600000/20240229.csv".to_string(),
                "p5/stock/600000/20240301.csv".to_string(),
            ]
        );

        // An empty prefix walks the whole tree.
        assert_eq!(store.list("").len(), 3);
    }

    #[test]
    fn copy_tree_replicates_every_key() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = FsStore::new(src_dir.path());
        let dst = FsStore::new(dst_dir.path());

        src.put("history/000300.parquet", b"table").unwrap();
        src.put("min/p5/stock/600000/20240301.csv", b"bars").unwrap();
        src.put("names/map.json", b"{}").unwrap();

        let copied = copy_tree(&src, &dst).unwrap();
        assert_eq!(copied, 3);
        assert_eq!(dst.get("history/000300.parquet").unwrap(), b"table");
        assert_eq!(dst.get("min/p5/stock/600000/20240301.csv").unwrap(), b"bars");
        assert_eq!(dst.list(""), src.list(""));
    }

    #[test]
    fn copy_tree_restores_over_existing_values() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = FsStore::new(src_dir.path());
        let dst = FsStore::new(dst_dir.path());

        src.put("names/map.json", b"backup").unwrap();
        dst.put("names/map.json", b"current").unwrap();

        copy_tree(&src, &dst).unwrap();
        assert_eq!(dst.get("names/map.json").unwrap(), b"backup");
    }
}
