//! Restoring outputs from the build cache.

use super::*;

fn set_version(space: &TestSpace, v1: &str, v2: &str) -> anyhow::Result<()> {
    space.write("source1", v1)?;
    space.write("source2", v2)?;
    space.changed(&["source1", "source2"]);
    Ok(())
}

#[test]
fn cache_hits_restore_outputs() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(DEPFILE_MAKEFILE)?;
    space.write("source1", "1")?;
    space.write("source2", "2")?;
    space.start()?;

    assert!(space.build()?.success);
    assert_eq!(space.read("output")?, "12");

    set_version(&space, "2", "3")?;
    assert_eq!(
        space.dirty_targets(),
        names(&["source1", "source2", "output"])
    );
    let build = space.build()?;
    assert!(build.success);
    assert!(build.cmds()[0]["cmd"].is_string());
    assert_eq!(space.read("output")?, "23");

    // Back to the first version: served from the cache.
    set_version(&space, "1", "2")?;
    assert_eq!(
        space.dirty_targets(),
        names(&["source1", "source2", "output"])
    );
    let build = space.build()?;
    assert!(build.success);
    assert_eq!(build.cmds(), &[serde_json::json!({"cache": "output"})]);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "12");
    assert_eq!(space.read("deps")?.trim(), "output: source1 source2");

    set_version(&space, "2", "3")?;
    let build = space.build()?;
    assert_eq!(build.cmds(), &[serde_json::json!({"cache": "output"})]);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "23");
    Ok(())
}

#[test]
fn cache_survives_restart() -> anyhow::Result<()> {
    let mut space = concat_space()?;
    assert!(space.build()?.success);

    space.shutdown();
    space.remove("output")?;
    space.start()?;
    let build = space.build()?;
    assert!(build.success);
    assert_eq!(build.cmds(), &[serde_json::json!({"cache": "output"})]);
    assert_eq!(space.read("output")?, "12");
    Ok(())
}
