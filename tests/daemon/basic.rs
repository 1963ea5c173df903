//! Building, rebuilding, and the dirty state around it.

use super::*;

#[test]
fn builds_tree() -> anyhow::Result<()> {
    let space = tree_space()?;
    assert_eq!(
        space.dirty_sources(),
        names(&["source1", "source2", "source3", "source4"])
    );

    let build = space.build()?;
    assert!(build.success);
    assert_eq!(build.doc["result"], "SUCCEEDED");
    assert_eq!(build.cmds().len(), 3);
    assert!(space.dirty_sources().is_empty());
    assert!(space.dirty_targets().is_empty());

    assert_eq!(space.read("node1")?, "12");
    assert_eq!(space.read("node2")?, "34");
    assert_eq!(space.read("output")?, "1234");
    Ok(())
}

#[test]
fn nothing_to_do_twice() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);

    let build = space.build()?;
    assert!(build.success);
    assert!(build.cmds().is_empty());
    Ok(())
}

#[test]
fn restart_sees_offline_edits() -> anyhow::Result<()> {
    let mut space = concat_space()?;
    assert_eq!(
        space.dirty_targets(),
        names(&["source1", "source2", "output"])
    );
    assert!(space.build()?.success);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "12");

    space.shutdown();
    space.write("source2", "3")?;
    space.start()?;
    assert_eq!(space.dirty_targets(), names(&["source2", "output"]));

    assert!(space.build()?.success);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "13");
    Ok(())
}

#[test]
fn restart_without_edits_is_clean() -> anyhow::Result<()> {
    let mut space = tree_space()?;
    assert!(space.build()?.success);
    space.start()?;
    assert!(space.dirty_targets().is_empty());
    Ok(())
}

#[test]
fn timestamps_are_ignored() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);

    let later = filetime::FileTime::from_unix_time(2_000_000_000, 0);
    filetime::set_file_mtime(space.path().join("source1"), later)?;
    space.changed(&["source1"]);
    assert!(space.dirty_targets().is_empty());

    // Same bytes rewritten: still clean.
    space.write("source2", "2")?;
    space.changed(&["source2"]);
    assert!(space.dirty_targets().is_empty());
    Ok(())
}

#[test]
fn edit_and_revert_before_build() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);

    space.write("source1", "9")?;
    space.changed(&["source1"]);
    assert_eq!(space.dirty_targets(), names(&["source1", "output"]));
    space.write("source1", "1")?;
    space.changed(&["source1"]);
    assert!(space.dirty_targets().is_empty());
    Ok(())
}

#[test]
fn build_failure_keeps_everything_dirty() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(
        r#"{"rules": [{"inputs": ["source1", "source2"], "outputs": ["output"], "cmd": "echo oops >&2; exit 1"}]}"#,
    )?;
    space.write("source1", "1")?;
    space.write("source2", "2")?;
    space.start()?;

    let build = space.build()?;
    assert!(!build.success);
    assert_eq!(build.doc["result"], "FAILED");
    assert_eq!(build.cmds().len(), 1);
    assert_eq!(build.cmds()[0]["stderr"], "oops\n");
    assert_eq!(
        space.dirty_targets(),
        names(&["source1", "source2", "output"])
    );
    assert!(space.error_log().unwrap_or_default().contains("output"));
    Ok(())
}

#[test]
fn missing_source_fails_build() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);
    assert_eq!(space.read("output")?, "12");

    space.remove("source1")?;
    space.changed(&["source1"]);
    assert_eq!(space.dirty_targets(), names(&["source1", "output"]));

    assert!(!space.build()?.success);
    let log = space.error_log().unwrap_or_default();
    assert!(log.contains("MissingSourceError"));
    assert!(log.contains("source1"));
    assert!(space.dirty_targets().contains(&"output".to_string()));

    // Fails again until the source is back.
    assert!(!space.build()?.success);

    space.write("source1", "1")?;
    space.changed(&["source1"]);
    assert!(space.build()?.success);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "12");
    Ok(())
}

#[test]
fn missing_output_rebuilt() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);

    space.remove("output")?;
    space.changed(&["output"]);
    assert_eq!(space.dirty_targets(), names(&["output"]));

    assert!(space.build()?.success);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "12");
    Ok(())
}

#[test]
fn command_that_writes_nothing_fails() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(r#"{"rules": [{"inputs": ["in"], "outputs": ["out"], "cmd": "true"}]}"#)?;
    space.write("in", "x")?;
    space.start()?;

    assert!(!space.build()?.success);
    assert_eq!(space.dirty_targets(), names(&["in", "out"]));
    Ok(())
}

#[test]
fn builds_only_requested_goal() -> anyhow::Result<()> {
    let space = tree_space()?;
    let build = space.build_targets(&["node1"])?;
    assert!(build.success);
    assert_eq!(build.cmds().len(), 1);
    assert_eq!(space.read("node1")?, "12");
    assert!(space.read("node2").is_err());
    assert_eq!(
        space.dirty_targets(),
        names(&["source3", "source4", "node2", "output", "all"])
    );
    Ok(())
}

#[test]
fn queries_follow_the_graph() -> anyhow::Result<()> {
    let space = tree_space()?;
    let d = space.daemon();
    assert!(d.inputs_of("source1")?.is_empty());
    assert_eq!(d.inputs_of("node1")?, names(&["source1", "source2"]));
    assert_eq!(d.inputs_of("node2")?, names(&["source3", "source4"]));
    assert_eq!(d.inputs_of("output")?, names(&["node1", "node2"]));
    assert_eq!(d.outputs_of("source3")?, names(&["node2"]));
    assert_eq!(d.outputs_of("node1")?, names(&["output"]));
    assert_eq!(d.outputs_of("output")?, names(&["all"]));
    assert!(d.outputs_of("all")?.is_empty());
    assert!(matches!(
        d.inputs_of("nope"),
        Err(falcon::Error::TargetNotFound(_))
    ));
    assert!(d.graphviz().starts_with("digraph"));
    Ok(())
}

#[test]
fn failure_spares_independent_rules() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(
        r#"{"rules": [
            {"inputs": ["a", "b"], "outputs": ["all"]},
            {"inputs": ["in"], "outputs": ["a"], "cmd": "exit 3"},
            {"inputs": ["in"], "outputs": ["b"], "cmd": "cp in b"}
        ]}"#,
    )?;
    space.write("in", "x")?;
    space.start()?;

    assert!(!space.build()?.success);
    assert_eq!(space.read("b")?, "x");
    assert_eq!(space.dirty_targets(), names(&["a", "all"]));
    Ok(())
}
