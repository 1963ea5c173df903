//! Daemon configuration: defaults, then an optional TOML file, then
//! command-line overrides applied by the caller.

use anyhow::{anyhow, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Build description, a JSON rule list.
    pub graph: PathBuf,
    /// Root of the workspace; commands run here and target names are
    /// relative to it.
    pub working_directory: PathBuf,
    pub api_port: u16,
    pub stream_port: u16,
    /// Build database and cache.
    pub state_dir: PathBuf,
    pub error_log: PathBuf,
    /// Commands to run in parallel when a build doesn't ask for a number.
    pub jobs: usize,
    pub log_level: String,
    /// Whether to watch the workspace for changes.
    pub watch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            graph: PathBuf::from("makefile.json"),
            working_directory: PathBuf::from("."),
            api_port: 4242,
            stream_port: 4343,
            state_dir: PathBuf::from(".falcon"),
            error_log: PathBuf::from("error.log"),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            log_level: "info".to_string(),
            watch: true,
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(content).map_err(|e| anyhow!("{}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("read {}: {}", path.display(), err))?;
        Config::from_toml(&content).map_err(|err| anyhow!("{}: {}", path.display(), err))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.graph.as_os_str().is_empty() {
            bail!("graph must name a file");
        }
        Ok(())
    }

    /// Resolve `path` against the working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_directory.join(path)
        }
    }

    pub fn graph_path(&self) -> PathBuf {
        self.resolve(&self.graph)
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.resolve(&self.error_log)
    }

    /// Config for a workspace rooted at `dir`, with ephemeral ports and no
    /// file watching; what tests and embedders usually want.
    pub fn for_workspace(dir: &Path) -> Config {
        Config {
            working_directory: dir.to_path_buf(),
            api_port: 0,
            stream_port: 0,
            watch: false,
            ..Config::default()
        }
    }
}
