//! Support code for daemon tests, which drive a falcon::Daemon over a
//! temporary workspace.

mod basic;
mod cache;
mod control;
mod depfile;
mod hash;

use falcon::{Config, Daemon};
use serde_json::Value;
use std::path::Path;

/// The outcome of one build, with its progress document.
pub struct Build {
    pub success: bool,
    pub doc: Value,
}

impl Build {
    pub fn cmds(&self) -> &[Value] {
        self.doc["cmds"].as_array().map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Sorted owned names, for comparing against query results.
pub fn names(list: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = list.iter().map(|s| s.to_string()).collect();
    names.sort();
    names
}

/// Manages a temporary workspace and the daemon serving it.
pub struct TestSpace {
    dir: tempfile::TempDir,
    daemon: Option<Daemon>,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir, daemon: None })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.dir.path().join(path))
    }

    pub fn remove(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.dir.path().join(path))
    }

    pub fn create_makefile(&self, json: &str) -> std::io::Result<()> {
        self.write("makefile.json", json)
    }

    /// Start (or restart) the daemon on the workspace.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.shutdown();
        self.daemon = Some(Daemon::open(Config::for_workspace(self.dir.path()))?);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown();
            daemon.wait_build();
        }
    }

    pub fn daemon(&self) -> &Daemon {
        self.daemon.as_ref().expect("daemon not started")
    }

    /// Build the given targets (everything if empty) and wait for the end.
    pub fn build_targets(&self, targets: &[&str]) -> anyhow::Result<Build> {
        let daemon = self.daemon();
        let targets: Vec<String> = targets.iter().map(|s| s.to_string()).collect();
        if daemon.start_build(&targets, Some(2))? != falcon::StartResult::Ok {
            anyhow::bail!("a build is already running");
        }
        let stream = daemon
            .streams()
            .latest()
            .ok_or_else(|| anyhow::anyhow!("build has no progress stream"))?;
        let success = daemon.wait_build() == Some(true);
        let doc = serde_json::from_slice(&stream.contents())?;
        Ok(Build { success, doc })
    }

    pub fn build(&self) -> anyhow::Result<Build> {
        self.build_targets(&[])
    }

    /// Tell the daemon files changed, as the watcher would.
    pub fn changed(&self, files: &[&str]) {
        self.daemon().files_changed(files);
    }

    pub fn dirty_targets(&self) -> Vec<String> {
        self.daemon().dirty_targets()
    }

    pub fn dirty_sources(&self) -> Vec<String> {
        self.daemon().dirty_sources()
    }

    /// Contents of the error log, if anything was recorded.
    pub fn error_log(&self) -> Option<String> {
        self.read("error.log").ok()
    }
}

impl Drop for TestSpace {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub const CONCAT_MAKEFILE: &str = r#"
{
  "rules": [
    {
      "inputs": ["source1", "source2"],
      "outputs": ["output"],
      "cmd": "cat source1 > output && cat source2 >> output"
    }
  ]
}
"#;

pub const TREE_MAKEFILE: &str = r#"
{
  "rules": [
    {"inputs": ["output"], "outputs": ["all"]},
    {
      "inputs": ["node1", "node2"],
      "outputs": ["output"],
      "cmd": "cat node1 > output && cat node2 >> output"
    },
    {
      "inputs": ["source1", "source2"],
      "outputs": ["node1"],
      "cmd": "cat source1 > node1 && cat source2 >> node1"
    },
    {
      "inputs": ["source3", "source4"],
      "outputs": ["node2"],
      "cmd": "cat source3 > node2 && cat source4 >> node2"
    }
  ]
}
"#;

pub const DEPFILE_MAKEFILE: &str = r#"
{
  "rules": [
    {
      "inputs": ["source1"],
      "outputs": ["output"],
      "cmd": "cat source1 > output && cat source2 >> output && echo 'output: source1 source2' > deps",
      "depfile": "deps"
    }
  ]
}
"#;

/// Workspace with TREE_MAKEFILE and its four sources.
pub fn tree_space() -> anyhow::Result<TestSpace> {
    let mut space = TestSpace::new()?;
    space.create_makefile(TREE_MAKEFILE)?;
    for (i, content) in ["1", "2", "3", "4"].iter().enumerate() {
        space.write(&format!("source{}", i + 1), content)?;
    }
    space.start()?;
    Ok(space)
}

/// Workspace with CONCAT_MAKEFILE, sources "1" and "2".
pub fn concat_space() -> anyhow::Result<TestSpace> {
    let mut space = TestSpace::new()?;
    space.create_makefile(CONCAT_MAKEFILE)?;
    space.write("source1", "1")?;
    space.write("source2", "2")?;
    space.start()?;
    Ok(space)
}
