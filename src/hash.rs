//! Content fingerprints and build signatures.
//!
//! Sources are hashed by path and content.  A rule's signature hashes its
//! command and the hashes of its inputs, and a derived target hashes its path,
//! its producing rule's signature and its own content.  Hashes are therefore
//! Merkle-like: any byte change anywhere upstream changes the hash of every
//! target downstream of it, without looking at timestamps.
//!
//! The rule signature doubles as the build cache key.

use std::fmt;
use std::path::Path;

/// A blake3 digest.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Hash> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Hash(out))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

/// What we know about the bytes of a target on disk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Content {
    /// Output of an aggregation rule; never a file.
    Phony,
    Missing,
    File(Hash),
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Hasher used for all signatures, length-prefixing strings so that
/// concatenations can't collide.
#[derive(Default)]
struct TerseHash(blake3::Hasher);

impl TerseHash {
    fn write_string(&mut self, string: &str) {
        self.0.update(&(string.len() as u64).to_le_bytes());
        self.0.update(string.as_bytes());
    }

    fn write_hash(&mut self, hash: &Hash) {
        self.0.update(&hash.0);
    }

    fn write_content(&mut self, content: &Content) {
        match content {
            Content::Phony => self.0.update(b"p"),
            Content::Missing => self.0.update(b"m"),
            Content::File(hash) => self.0.update(b"f").update(&hash.0),
        };
    }

    fn write_separator(&mut self) {
        self.0.update(&[UNIT_SEPARATOR]);
    }

    fn finish(&self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash {
    Hash(*blake3::hash(bytes).as_bytes())
}

/// Hash the content of a file, returning Content::Missing if it doesn't exist.
pub fn hash_file(path: &Path) -> std::io::Result<Content> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                return Ok(Content::Missing);
            }
            return Err(err);
        }
    };
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(Content::File(Hash(*hasher.finalize().as_bytes())))
}

pub fn source_hash(name: &str, content: &Content) -> Hash {
    let mut hasher = TerseHash::default();
    hasher.write_string(name);
    hasher.write_separator();
    hasher.write_content(content);
    hasher.finish()
}

/// Compute a rule's signature from its command and inputs.
/// Inputs are sorted and deduplicated so the result doesn't depend on
/// declaration or discovery order.
pub fn rule_signature<'a>(
    command: Option<&str>,
    inputs: impl IntoIterator<Item = (&'a str, Hash)>,
) -> Hash {
    let mut inputs: Vec<(&str, Hash)> = inputs.into_iter().collect();
    inputs.sort();
    inputs.dedup();

    let mut hasher = TerseHash::default();
    match command {
        Some(cmd) => hasher.write_string(cmd),
        None => {
            hasher.0.update(b"phony");
        }
    }
    hasher.write_separator();
    for (name, hash) in &inputs {
        hasher.write_string(name);
        hasher.write_hash(hash);
    }
    hasher.write_separator();
    hasher.finish()
}

pub fn derived_hash(name: &str, signature: &Hash, content: &Content) -> Hash {
    let mut hasher = TerseHash::default();
    hasher.write_string(name);
    hasher.write_separator();
    hasher.write_hash(signature);
    hasher.write_content(content);
    hasher.finish()
}
