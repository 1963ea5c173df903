//! Content-addressed build cache.
//!
//! Layout under the cache directory:
//! - `entries/<key>.json`: one manifest per rule signature, naming the blobs
//!   of every output (and the depfile) plus the command's captured output.
//! - `objects/<hash>`: file contents, keyed by the blake3 of their bytes.
//! - `tmp/`: staging area; everything is written there first and renamed
//!   into place, so readers never observe a partial entry or object.

use crate::error::Error;
use crate::hash::{hash_bytes, Hash};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const ENTRIES_DIR: &str = "entries";
const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub path: String,
    pub blob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub outputs: Vec<CachedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depfile: Option<CachedFile>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

pub struct Cache {
    dir: PathBuf,
    index: DashMap<Hash, Arc<Entry>>,
    tmp_counter: AtomicU64,
}

fn invalid_data(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

impl Cache {
    pub fn open(dir: &Path) -> Result<Cache, Error> {
        for sub in [ENTRIES_DIR, OBJECTS_DIR, TMP_DIR] {
            std::fs::create_dir_all(dir.join(sub)).map_err(Error::CacheIo)?;
        }
        Ok(Cache {
            dir: dir.to_path_buf(),
            index: DashMap::new(),
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn entry_path(&self, key: &Hash) -> PathBuf {
        self.dir.join(ENTRIES_DIR).join(format!("{}.json", key.to_hex()))
    }

    fn object_path(&self, blob: &str) -> PathBuf {
        self.dir.join(OBJECTS_DIR).join(blob)
    }

    /// Write `data` to `dest` atomically through the staging directory.
    fn write_atomic(&self, dest: &Path, data: &[u8]) -> std::io::Result<()> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(TMP_DIR)
            .join(format!("{}-{}", std::process::id(), n));
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, dest) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        Ok(())
    }

    /// Find the entry stored under `key`.  Any failure to read it is a miss.
    pub fn lookup(&self, key: &Hash) -> Option<Arc<Entry>> {
        if let Some(entry) = self.index.get(key) {
            return Some(entry.value().clone());
        }
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!("{}", Error::CacheIo(err));
                return None;
            }
        };
        match serde_json::from_slice::<Entry>(&bytes) {
            Ok(entry) => {
                let entry = Arc::new(entry);
                self.index.insert(*key, entry.clone());
                Some(entry)
            }
            Err(err) => {
                tracing::warn!("{}: {}", path.display(), err);
                None
            }
        }
    }

    /// Copy an entry's files back into the workspace.
    pub fn restore(&self, root: &Path, entry: &Entry) -> Result<(), Error> {
        for file in entry.outputs.iter().chain(entry.depfile.iter()) {
            let data = std::fs::read(self.object_path(&file.blob)).map_err(Error::CacheIo)?;
            if hash_bytes(&data).to_hex() != file.blob {
                return Err(Error::CacheIo(invalid_data(format!(
                    "object {} is corrupt",
                    file.blob
                ))));
            }
            let dest = root.join(&file.path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(Error::CacheIo)?;
            }
            // Stage next to the destination so the rename stays on one device.
            let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
            let tmp = dest.with_file_name(format!(
                ".{}.falcon-{}",
                dest.file_name().and_then(|f| f.to_str()).unwrap_or("out"),
                n
            ));
            std::fs::write(&tmp, &data)
                .and_then(|_| std::fs::rename(&tmp, &dest))
                .map_err(|err| {
                    let _ = std::fs::remove_file(&tmp);
                    Error::CacheIo(err)
                })?;
        }
        Ok(())
    }

    fn store_file(&self, root: &Path, path: &str) -> std::io::Result<CachedFile> {
        let data = std::fs::read(root.join(path))?;
        let blob = hash_bytes(&data).to_hex();
        let object = self.object_path(&blob);
        if !object.exists() {
            self.write_atomic(&object, &data)?;
        }
        Ok(CachedFile {
            path: path.to_string(),
            blob,
        })
    }

    /// Capture the named files from the workspace under `key`.
    /// Storing a key that already exists is a no-op.
    pub fn store(
        &self,
        key: &Hash,
        root: &Path,
        outputs: &[String],
        depfile: Option<&str>,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), Error> {
        let path = self.entry_path(key);
        if self.index.contains_key(key) || path.exists() {
            return Ok(());
        }
        let entry = Entry {
            outputs: outputs
                .iter()
                .map(|out| self.store_file(root, out))
                .collect::<std::io::Result<_>>()
                .map_err(Error::CacheIo)?,
            depfile: depfile
                .map(|d| self.store_file(root, d))
                .transpose()
                .map_err(Error::CacheIo)?,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        let json = serde_json::to_vec_pretty(&entry).map_err(|e| Error::CacheIo(invalid_data(e)))?;
        self.write_atomic(&path, &json).map_err(Error::CacheIo)?;
        self.index.insert(*key, Arc::new(entry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn store_then_restore() -> anyhow::Result<()> {
        let state = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let cache = Cache::open(state.path())?;
        let key = hash_bytes(b"key");
        assert!(cache.lookup(&key).is_none());

        fs::create_dir(root.path().join("sub"))?;
        fs::write(root.path().join("sub/out"), "12")?;
        fs::write(root.path().join("deps"), "sub/out: a b\n")?;
        cache.store(
            &key,
            root.path(),
            &["sub/out".to_string()],
            Some("deps"),
            "hello\n",
            "",
        )?;

        fs::remove_dir_all(root.path().join("sub"))?;
        fs::write(root.path().join("deps"), "stale")?;

        // A fresh handle reads the manifest from disk.
        let cache = Cache::open(state.path())?;
        let entry = cache.lookup(&key).expect("hit");
        assert_eq!(entry.stdout, "hello\n");
        cache.restore(root.path(), &entry)?;
        assert_eq!(fs::read_to_string(root.path().join("sub/out"))?, "12");
        assert_eq!(fs::read_to_string(root.path().join("deps"))?, "sub/out: a b\n");
        Ok(())
    }

    #[test]
    fn identical_content_shares_objects() -> anyhow::Result<()> {
        let state = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let cache = Cache::open(state.path())?;
        fs::write(root.path().join("a"), "same")?;
        fs::write(root.path().join("b"), "same")?;
        cache.store(&hash_bytes(b"1"), root.path(), &["a".into()], None, "", "")?;
        cache.store(&hash_bytes(b"2"), root.path(), &["b".into()], None, "", "")?;
        assert_eq!(fs::read_dir(state.path().join(OBJECTS_DIR))?.count(), 1);
        assert_eq!(fs::read_dir(state.path().join(ENTRIES_DIR))?.count(), 2);
        Ok(())
    }

    #[test]
    fn second_store_is_noop() -> anyhow::Result<()> {
        let state = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let cache = Cache::open(state.path())?;
        let key = hash_bytes(b"k");
        fs::write(root.path().join("out"), "first")?;
        cache.store(&key, root.path(), &["out".into()], None, "", "")?;
        fs::write(root.path().join("out"), "second")?;
        cache.store(&key, root.path(), &["out".into()], None, "", "")?;
        let entry = cache.lookup(&key).expect("hit");
        assert_eq!(entry.outputs[0].blob, hash_bytes(b"first").to_hex());
        Ok(())
    }

    #[test]
    fn corrupt_manifest_is_a_miss() -> anyhow::Result<()> {
        let state = tempfile::tempdir()?;
        let cache = Cache::open(state.path())?;
        let key = hash_bytes(b"k");
        fs::write(cache.entry_path(&key), "{not json")?;
        assert!(cache.lookup(&key).is_none());
        Ok(())
    }

    #[test]
    fn missing_output_fails_store() -> anyhow::Result<()> {
        let state = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let cache = Cache::open(state.path())?;
        let key = hash_bytes(b"k");
        let result = cache.store(&key, root.path(), &["nope".into()], None, "", "");
        assert!(matches!(result, Err(Error::CacheIo(_))));
        assert!(cache.lookup(&key).is_none());
        Ok(())
    }
}
