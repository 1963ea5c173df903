//! Path canonicalization.
//!
//! Targets are identified by their normalized path string, so every name that
//! enters the graph (build description, depfiles, watch events, RPC queries)
//! goes through canon_path first.

use std::path::Path;

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar" and "foo/../bar" => "bar".
/// Leading ".." components that cannot be resolved are kept.
pub fn canon_path<T: AsRef<str>>(inpath: T) -> String {
    let path = inpath.as_ref();
    let absolute = path.starts_with('/');
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                // "/.." is "/".
                _ if absolute => {}
                _ => components.push(".."),
            },
            _ => components.push(component),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&components.join("/"));
    if out.is_empty() && !path.is_empty() {
        out.push('.');
    }
    out
}

/// Map a path reported by the filesystem to the target name it would have
/// in a graph rooted at `root`.  Returns None for paths outside of root.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_str()?;
    if rel.is_empty() {
        return None;
    }
    Some(canon_path(rel))
}
