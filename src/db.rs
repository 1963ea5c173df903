//! The falcon database stores the hash each target had after its last
//! successful build, for determining which targets are up to date across
//! daemon restarts.
//!
//! The file is an append-only log of records.  Each record starts with a u16:
//! - high bit clear: a name record, the u16 is the byte length of the name
//!   that follows.  Names are assigned ids sequentially.
//! - `HASH_RECORD`: followed by a u32 name id and a 32-byte hash.
//! - `FORGET_RECORD`: followed by a u32 name id; drops the recorded hash.
//!
//! Opening the database replays the log and then rewrites it compactly.

use crate::hash::Hash;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const HASH_RECORD: u16 = 0x8000;
const FORGET_RECORD: u16 = 0x8001;
const MAX_NAME_LEN: usize = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Id(u32);

pub struct Db {
    path: PathBuf,
    ids: FxHashMap<String, Id>,
    /// Recorded hash per id; the index is the id.
    hashes: Vec<Option<Hash>>,
    w: BufWriter<File>,
}

struct Reader<R: Read> {
    r: R,
}

impl<R: Read> Reader<R> {
    fn read_u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0u8; 2];
        self.r.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_id(&mut self) -> std::io::Result<Id> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(Id(u32::from_le_bytes(buf)))
    }

    fn read_hash(&mut self) -> std::io::Result<Hash> {
        let mut buf = [0u8; 32];
        self.r.read_exact(&mut buf)?;
        Ok(Hash(buf))
    }

    fn read_str(&mut self, len: usize) -> anyhow::Result<String> {
        let mut buf = vec![0; len];
        self.r.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Replay the log into a name -> hash map.  A truncated final record (from a
/// crash mid-write) ends the log.
fn read(path: &Path) -> anyhow::Result<FxHashMap<String, Hash>> {
    let mut live = FxHashMap::default();
    let f = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(live),
        Err(err) => bail!("open {}: {}", path.display(), err),
    };
    let mut r = Reader {
        r: BufReader::new(f),
    };
    let mut names: Vec<String> = Vec::new();
    let mut replay = || -> anyhow::Result<()> {
        loop {
            let tag = match r.read_u16() {
                Ok(tag) => tag,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            match tag {
                HASH_RECORD => {
                    let id = r.read_id()?;
                    let hash = r.read_hash()?;
                    let name = names
                        .get(id.0 as usize)
                        .ok_or_else(|| anyhow!("bad id {}", id.0))?;
                    live.insert(name.clone(), hash);
                }
                FORGET_RECORD => {
                    let id = r.read_id()?;
                    if let Some(name) = names.get(id.0 as usize) {
                        live.remove(name);
                    }
                }
                len if len & HASH_RECORD == 0 => names.push(r.read_str(len as usize)?),
                tag => bail!("unknown record tag {:#x}", tag),
            }
        }
    };
    match replay() {
        Ok(()) => {}
        Err(err)
            if err
                .downcast_ref::<std::io::Error>()
                .map_or(false, |e| e.kind() == std::io::ErrorKind::UnexpectedEof) =>
        {
            tracing::warn!("{}: truncated record, ignoring rest of log", path.display());
        }
        Err(err) => bail!("{}: {}", path.display(), err),
    }
    Ok(live)
}

impl Db {
    /// Open (or create) the database at `path`, compacting it.
    pub fn open(path: &Path) -> anyhow::Result<Db> {
        let live = read(path)?;

        let tmp = path.with_extension("tmp");
        let file = File::create(&tmp).map_err(|err| anyhow!("create {}: {}", tmp.display(), err))?;
        let mut db = Db {
            path: path.to_path_buf(),
            ids: FxHashMap::default(),
            hashes: Vec::new(),
            w: BufWriter::new(file),
        };
        let mut entries: Vec<(String, Hash)> = live.into_iter().collect();
        entries.sort();
        for (name, hash) in entries {
            db.record(&name, hash)?;
        }
        db.w.flush()?;
        std::fs::rename(&tmp, path)?;

        // Reopen for appending; the writer still points at the renamed file.
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        db.w = BufWriter::new(file);
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<Hash> {
        let id = self.ids.get(name)?;
        self.hashes[id.0 as usize]
    }

    /// Number of targets with a recorded hash.
    pub fn len(&self) -> usize {
        self.hashes.iter().filter(|h| h.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_id(&mut self, name: &str) -> std::io::Result<Id> {
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("can't record target name of length {}", name.len()),
            ));
        }
        let id = Id(self.hashes.len() as u32);
        self.w.write_all(&(name.len() as u16).to_le_bytes())?;
        self.w.write_all(name.as_bytes())?;
        self.ids.insert(name.to_string(), id);
        self.hashes.push(None);
        Ok(id)
    }

    /// Record the hash of a successfully built target.
    pub fn record(&mut self, name: &str, hash: Hash) -> std::io::Result<()> {
        let id = self.ensure_id(name)?;
        if self.hashes[id.0 as usize] == Some(hash) {
            return Ok(());
        }
        self.w.write_all(&HASH_RECORD.to_le_bytes())?;
        self.w.write_all(&id.0.to_le_bytes())?;
        self.w.write_all(&hash.0)?;
        self.w.flush()?;
        self.hashes[id.0 as usize] = Some(hash);
        Ok(())
    }

    /// Drop the recorded hash, so the target is dirty until rebuilt.
    pub fn forget(&mut self, name: &str) -> std::io::Result<()> {
        let id = match self.ids.get(name) {
            Some(&id) if self.hashes[id.0 as usize].is_some() => id,
            _ => return Ok(()),
        };
        self.w.write_all(&FORGET_RECORD.to_le_bytes())?;
        self.w.write_all(&id.0.to_le_bytes())?;
        self.w.flush()?;
        self.hashes[id.0 as usize] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    #[test]
    fn persists_across_open() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let mut db = Db::open(&path)?;
            assert!(db.is_empty());
            db.record("out", hash_bytes(b"1"))?;
            db.record("out", hash_bytes(b"2"))?;
            db.record("src", hash_bytes(b"3"))?;
            db.forget("src")?;
            db.forget("never")?;
        }
        let db = Db::open(&path)?;
        assert_eq!(db.get("out"), Some(hash_bytes(b"2")));
        assert_eq!(db.get("src"), None);
        assert_eq!(db.len(), 1);
        Ok(())
    }

    #[test]
    fn compacts_on_open() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let mut db = Db::open(&path)?;
            for i in 0..100u8 {
                db.record("out", hash_bytes(&[i]))?;
            }
        }
        let before = std::fs::metadata(&path)?.len();
        drop(Db::open(&path)?);
        let after = std::fs::metadata(&path)?.len();
        assert!(after < before);
        // One name record plus one hash record.
        assert_eq!(after, (2 + 3) + (2 + 4 + 32));
        Ok(())
    }

    #[test]
    fn truncated_tail_is_ignored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let mut db = Db::open(&path)?;
            db.record("a", hash_bytes(b"a"))?;
            db.record("b", hash_bytes(b"b"))?;
        }
        let len = std::fs::metadata(&path)?.len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_len(len - 10)?;
        let db = Db::open(&path)?;
        assert_eq!(db.get("a"), Some(hash_bytes(b"a")));
        assert_eq!(db.get("b"), None);
        Ok(())
    }

    #[test]
    fn garbage_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        std::fs::write(&path, [0xFF, 0xFF, 0, 0])?;
        assert!(Db::open(&path).is_err());
        Ok(())
    }
}
