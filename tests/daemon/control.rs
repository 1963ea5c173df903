//! The control surface: interrupting, marking dirty, reloading, and the
//! TCP servers.

use super::*;
use falcon::rpc::{self, Client, RemoteError, Request};
use falcon::{StartResult, Status};
use serde_json::json;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

const SLOW_MAKEFILE: &str = r#"
{
  "rules": [
    {"inputs": ["in"], "outputs": ["out"], "cmd": "sleep 30 && cp in out"}
  ]
}
"#;

fn slow_space() -> anyhow::Result<TestSpace> {
    let mut space = TestSpace::new()?;
    space.create_makefile(SLOW_MAKEFILE)?;
    space.write("in", "x")?;
    space.start()?;
    Ok(space)
}

#[test]
fn set_dirty_forces_rebuild() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);

    space.daemon().set_dirty("source1")?;
    assert_eq!(space.dirty_targets(), names(&["source1", "output"]));
    let build = space.build()?;
    assert!(build.success);
    // Same inputs as before, so the outputs come back from the cache.
    assert_eq!(build.cmds().len(), 1);
    assert_eq!(build.cmds()[0]["cache"], "output");
    assert!(space.dirty_targets().is_empty());

    assert!(matches!(
        space.daemon().set_dirty("nope"),
        Err(falcon::Error::TargetNotFound(_))
    ));
    Ok(())
}

#[test]
fn set_dirty_persists() -> anyhow::Result<()> {
    let mut space = concat_space()?;
    assert!(space.build()?.success);
    space.daemon().set_dirty("output")?;
    space.start()?;
    assert_eq!(space.dirty_targets(), names(&["output"]));
    Ok(())
}

#[test]
fn interrupt_stops_build() -> anyhow::Result<()> {
    let space = slow_space()?;
    let daemon = space.daemon();
    let start = Instant::now();
    assert_eq!(daemon.start_build(&[], None)?, StartResult::Ok);
    assert_eq!(daemon.status(), Status::Building);
    assert_eq!(
        daemon.start_build(&[], None)?,
        StartResult::AlreadyBuilding
    );

    std::thread::sleep(Duration::from_millis(300));
    // The running command doesn't hold up queries.
    assert_eq!(space.dirty_targets(), names(&["in", "out"]));
    daemon.interrupt_build();
    assert_eq!(daemon.wait_build(), Some(false));
    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(daemon.status(), Status::Idle);
    assert_eq!(space.dirty_targets(), names(&["in", "out"]));

    let stream = daemon.streams().latest().expect("stream");
    let doc: serde_json::Value = serde_json::from_slice(&stream.contents())?;
    assert_eq!(doc["result"], "FAILED");
    Ok(())
}

#[test]
fn unknown_goal_starts_nothing() -> anyhow::Result<()> {
    let space = concat_space()?;
    let result = space.daemon().start_build(&["nope".to_string()], None);
    assert!(matches!(result, Err(falcon::Error::TargetNotFound(_))));
    assert_eq!(space.daemon().status(), Status::Idle);
    Ok(())
}

#[test]
fn cycle_is_logged() -> anyhow::Result<()> {
    let mut space = TestSpace::new()?;
    space.create_makefile(
        r#"{"rules": [
            {"inputs": ["input0"], "outputs": ["input1"]},
            {"inputs": ["input1"], "outputs": ["input2"]},
            {"inputs": ["input2"], "outputs": ["input3"], "cmd": "echo r2"},
            {"inputs": ["input2"], "outputs": ["input4"], "cmd": "echo r3"},
            {"inputs": ["input4"], "outputs": ["input0"], "cmd": "echo r2"}
        ]}"#,
    )?;
    assert!(space.start().is_err());
    assert!(space.error_log().unwrap_or_default().contains("cycle"));
    Ok(())
}

#[test]
fn description_change_reloads() -> anyhow::Result<()> {
    let space = concat_space()?;
    assert!(space.build()?.success);

    space.create_makefile(
        r#"{"rules": [
            {"inputs": ["source1", "source2"], "outputs": ["output"],
             "cmd": "cat source1 > output && cat source2 >> output"},
            {"inputs": ["output"], "outputs": ["copy"], "cmd": "cp output copy"}
        ]}"#,
    )?;
    space.changed(&["makefile.json"]);
    assert_eq!(space.dirty_targets(), names(&["copy"]));
    assert!(space.build()?.success);
    assert_eq!(space.read("copy")?, "12");

    // A broken description keeps the current graph.
    space.create_makefile("{not json")?;
    space.changed(&["makefile.json"]);
    assert!(space.error_log().is_some());
    assert_eq!(space.daemon().inputs_of("copy")?, names(&["output"]));
    Ok(())
}

#[test]
fn reload_waits_for_build() -> anyhow::Result<()> {
    let space = slow_space()?;
    let daemon = space.daemon();
    daemon.start_build(&[], None)?;
    space.create_makefile(r#"{"rules": [{"inputs": ["in"], "outputs": ["other"], "cmd": "cp in other"}]}"#)?;
    space.changed(&["makefile.json"]);
    // Still the old graph while building.
    assert!(daemon.inputs_of("out").is_ok());

    daemon.interrupt_build();
    daemon.wait_build();
    assert!(daemon.inputs_of("out").is_err());
    assert_eq!(daemon.inputs_of("other")?, names(&["in"]));
    Ok(())
}

#[test]
fn rpc_and_stream_over_tcp() -> anyhow::Result<()> {
    let space = concat_space()?;
    let daemon = space.daemon();
    let rpc_server = rpc::serve(TcpListener::bind("127.0.0.1:0")?, daemon.clone())?;
    let stream_server =
        falcon::stream_server::serve(TcpListener::bind("127.0.0.1:0")?, daemon.streams())?;

    let mut client = Client::connect(rpc_server.local_addr())?;
    assert_eq!(client.call(&Request::GetStatus)?, json!("IDLE"));
    assert_eq!(client.call(&Request::GetPid)?, json!(std::process::id()));
    assert_eq!(
        client.call(&Request::GetDirtySources)?,
        json!(["source1", "source2"])
    );

    let started = client.call(&Request::StartBuild {
        targets: vec!["output".into()],
        num_threads: Some(1),
    })?;
    assert_eq!(started, json!(0));
    let stream = TcpStream::connect(stream_server.local_addr())?;
    let mut printed = Vec::new();
    assert!(falcon::run::report_stream(stream, &mut printed)?);
    assert!(String::from_utf8(printed)?.contains("cat source1 > output"));

    daemon.wait_build();
    assert_eq!(client.call(&Request::GetDirtyTargets)?, json!([]));
    assert_eq!(
        client.call(&Request::GetInputsOf {
            target: "output".into()
        })?,
        json!(["source1", "source2"])
    );

    let err = client
        .call(&Request::GetHashOf {
            target: "nope".into(),
        })
        .unwrap_err();
    let remote = err.downcast_ref::<RemoteError>().expect("remote error");
    assert_eq!(remote.kind, "TargetNotFound");

    assert_eq!(client.call(&Request::Shutdown)?, json!(null));
    assert!(daemon.wait_shutdown(Duration::from_secs(5)));
    Ok(())
}
