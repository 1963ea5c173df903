//! Hashes propagate from changed sources to everything downstream.

use super::*;
use std::collections::HashMap;

const ALL: [&str; 8] = [
    "source1", "source2", "source3", "source4", "node1", "node2", "output", "all",
];

fn hashes(space: &TestSpace) -> anyhow::Result<HashMap<&'static str, String>> {
    let mut map = HashMap::new();
    for name in ALL {
        map.insert(name, space.daemon().hash_of(name)?);
    }
    Ok(map)
}

/// Edit `source`, then check exactly `changed` got new hashes.
fn edit_and_check(space: &TestSpace, source: &str, content: &str, changed: &[&str]) -> anyhow::Result<()> {
    let before = hashes(space)?;
    space.write(source, content)?;
    space.changed(&[source]);
    let after = hashes(space)?;
    for name in ALL {
        assert_eq!(
            before[name] != after[name],
            changed.contains(&name),
            "hash of {} after editing {}",
            name,
            source
        );
    }
    Ok(())
}

#[test]
fn hashes_propagate() -> anyhow::Result<()> {
    let space = tree_space()?;
    assert!(space.build()?.success);

    edit_and_check(&space, "source2", "3", &["source2", "node1", "output", "all"])?;
    assert_eq!(
        space.dirty_targets(),
        names(&["source2", "node1", "output", "all"])
    );

    edit_and_check(&space, "source1", "5", &["source1", "node1", "output", "all"])?;
    assert_eq!(
        space.dirty_targets(),
        names(&["source1", "source2", "node1", "output", "all"])
    );

    edit_and_check(&space, "source3", "6", &["source3", "node2", "output", "all"])?;
    assert_eq!(
        space.dirty_targets(),
        names(&["source1", "source2", "source3", "node1", "node2", "output", "all"])
    );
    Ok(())
}

#[test]
fn hash_is_hex() -> anyhow::Result<()> {
    let space = tree_space()?;
    let hash = space.daemon().hash_of("source1")?;
    assert_eq!(hash.len(), 64);
    assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(space.daemon().hash_of("nope").is_err());
    Ok(())
}
