//! Implicit inputs discovered through depfiles.

use super::*;

#[test]
fn depfile_adds_inputs() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(DEPFILE_MAKEFILE)?;
    space.write("source1", "1")?;
    space.write("source2", "2")?;
    space.start()?;

    assert_eq!(space.dirty_targets(), names(&["source1", "output"]));
    assert!(space.build()?.success);
    assert!(space.dirty_targets().is_empty());
    assert_eq!(space.read("output")?, "12");
    let d = space.daemon();
    assert_eq!(d.inputs_of("output")?, names(&["source1", "source2"]));
    assert_eq!(d.outputs_of("source2")?, names(&["output"]));

    // Changing the implicit input dirties the output.
    space.write("source2", "3")?;
    space.changed(&["source2"]);
    assert_eq!(space.dirty_targets(), names(&["source2", "output"]));
    assert!(space.build()?.success);
    assert_eq!(space.read("output")?, "13");
    Ok(())
}

#[test]
fn depfile_survives_restart() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(DEPFILE_MAKEFILE)?;
    space.write("source1", "1")?;
    space.write("source2", "2")?;
    space.start()?;
    assert!(space.build()?.success);

    space.start()?;
    let d = space.daemon();
    assert_eq!(d.inputs_of("output")?, names(&["source1", "source2"]));
    assert_eq!(d.outputs_of("source2")?, names(&["output"]));
    assert!(space.dirty_targets().is_empty());
    Ok(())
}

#[test]
fn bad_depfile_fails_rule() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(
        r#"{"rules": [{"inputs": ["in"], "outputs": ["out"],
            "cmd": "cp in out && echo 'elsewhere: in' > deps", "depfile": "deps"}]}"#,
    )?;
    space.write("in", "x")?;
    space.start()?;

    assert!(!space.build()?.success);
    assert!(space.dirty_targets().contains(&"out".to_string()));
    assert!(space.error_log().is_some());
    Ok(())
}
