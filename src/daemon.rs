//! The long-lived daemon: owns the build state between builds, runs at most
//! one build at a time on a background thread, and answers queries.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{Error, ErrorLog};
use crate::graph::TargetId;
use crate::json_progress::JsonProgress;
use crate::load::{self, State};
use crate::progress::LogProgress;
use crate::rpc::Request;
use crate::stream_server::{StreamHub, StreamWriter};
use crate::work::{Context, Work};
use crate::{canon, detect};
use anyhow::anyhow;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Reply to a build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    Ok = 0,
    AlreadyBuilding = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Idle,
    Building,
}

#[derive(Default)]
struct Session {
    next_id: u64,
    /// Cancel flag of the running build, if any.
    running: Option<Arc<AtomicBool>>,
    /// Id and outcome of the last finished build.
    last: Option<(u64, bool)>,
    shutting_down: bool,
}

struct Inner {
    config: Config,
    root: PathBuf,
    graph_path: PathBuf,
    /// The description's name relative to root, if it lives inside it.
    graph_name: Option<String>,
    state: Mutex<State>,
    cache: Cache,
    errors: ErrorLog,
    streams: Arc<StreamHub>,
    session: Mutex<Session>,
    session_changed: Condvar,
    reload_pending: AtomicBool,
}

/// Handle to a running daemon; clones share it.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload the graph from the description, keeping the database.  A bad
    /// description is recorded and leaves the current graph in place.
    fn reload_now(&self) -> Result<(), Error> {
        let mut graph = match load::load_graph(&self.graph_path, &self.root, &self.errors) {
            Ok(graph) => graph,
            Err(err) => {
                self.errors.record(&err);
                return Err(err);
            }
        };
        let mut state = self.state();
        detect::scan(&mut graph, &state.db, &self.root);
        state.graph = graph;
        tracing::info!("reloaded {}", self.graph_path.display());
        Ok(())
    }

    fn run_build(&self, id: u64, goals: Vec<TargetId>, jobs: usize, stream: StreamWriter, cancel: Arc<AtomicBool>) {
        let mut progress = (LogProgress, JsonProgress::new(id, stream));
        let ctx = Context {
            state: &self.state,
            root: &self.root,
            cache: &self.cache,
            errors: &self.errors,
        };
        let success = Work::new(ctx, &goals, jobs, &mut progress, &cancel).run();
        // Completes the progress document.
        drop(progress);

        if self.reload_pending.swap(false, Ordering::SeqCst) {
            let _ = self.reload_now();
        }

        let mut session = self.session();
        session.running = None;
        session.last = Some((id, success));
        self.session_changed.notify_all();
    }
}

impl Daemon {
    /// Load the workspace described by `config`.  Fails if the build
    /// description can't be loaded; the reason is also in the error log.
    pub fn open(config: Config) -> anyhow::Result<Daemon> {
        let root = std::fs::canonicalize(&config.working_directory).map_err(|err| {
            anyhow!("{}: {}", config.working_directory.display(), err)
        })?;
        let config = Config {
            working_directory: root.clone(),
            ..config
        };
        let graph_path = config.graph_path();
        let graph_name = canon::relative_name(&root, &graph_path);
        let errors = ErrorLog::new(config.error_log_path());
        let state_dir = config.state_path();
        let state = load::read(&graph_path, &root, &state_dir, &errors)?;
        let cache = Cache::open(&state_dir.join("cache"))?;
        Ok(Daemon {
            inner: Arc::new(Inner {
                config,
                root,
                graph_path,
                graph_name,
                state: Mutex::new(state),
                cache,
                errors,
                streams: StreamHub::new(),
                session: Mutex::default(),
                session_changed: Condvar::new(),
                reload_pending: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Absolute workspace root.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn error_log(&self) -> &Path {
        self.inner.errors.path()
    }

    pub fn streams(&self) -> Arc<StreamHub> {
        self.inner.streams.clone()
    }

    /// Start building `targets` (everything if empty) in the background.
    /// Unknown targets are an error and nothing starts.
    pub fn start_build(&self, targets: &[String], num_threads: Option<usize>) -> Result<StartResult, Error> {
        let mut session = self.inner.session();
        if session.running.is_some() || session.shutting_down {
            return Ok(StartResult::AlreadyBuilding);
        }
        let goals = {
            let state = self.inner.state();
            targets
                .iter()
                .map(|name| {
                    state
                        .graph
                        .lookup(name)
                        .ok_or_else(|| Error::TargetNotFound(name.clone()))
                })
                .collect::<Result<Vec<_>, Error>>()?
        };

        let id = session.next_id;
        session.next_id += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        session.running = Some(cancel.clone());
        // Begin the stream now, so a reader connecting as soon as this
        // returns sees this build and not the previous one.
        let stream = self.inner.streams.begin();
        let jobs = num_threads.unwrap_or(self.inner.config.jobs).max(1);
        tracing::info!("build {} started: {:?}", id, targets);

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("build-{}", id))
            .spawn(move || inner.run_build(id, goals, jobs, stream, cancel));
        if let Err(err) = spawned {
            session.running = None;
            return Err(err.into());
        }
        Ok(StartResult::Ok)
    }

    /// Start a build and wait for it.  Returns None if another build was
    /// already running.
    pub fn build(&self, targets: &[String], num_threads: Option<usize>) -> Result<Option<bool>, Error> {
        match self.start_build(targets, num_threads)? {
            StartResult::AlreadyBuilding => Ok(None),
            StartResult::Ok => Ok(self.wait_build()),
        }
    }

    /// Wait until no build is running; returns the last build's outcome.
    pub fn wait_build(&self) -> Option<bool> {
        let mut session = self.inner.session();
        while session.running.is_some() {
            session = self
                .inner
                .session_changed
                .wait(session)
                .unwrap_or_else(|e| e.into_inner());
        }
        session.last.map(|(_, success)| success)
    }

    /// Ask the running build, if any, to stop.  Running commands are
    /// terminated and their targets stay dirty.
    pub fn interrupt_build(&self) {
        if let Some(cancel) = &self.inner.session().running {
            tracing::info!("interrupting build");
            cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Interrupt any build and refuse new ones; wait_shutdown() callers
    /// wake once the build has wound down.
    pub fn shutdown(&self) {
        self.inner.session().shutting_down = true;
        self.interrupt_build();
        self.inner.session_changed.notify_all();
    }

    /// Wait up to `timeout` for shutdown to be requested and any build to
    /// end.  Returns whether that happened.
    pub fn wait_shutdown(&self, timeout: Duration) -> bool {
        let session = self.inner.session();
        let (session, _) = self
            .inner
            .session_changed
            .wait_timeout_while(session, timeout, |s| !s.shutting_down || s.running.is_some())
            .unwrap_or_else(|e| e.into_inner());
        session.shutting_down && session.running.is_none()
    }

    pub fn status(&self) -> Status {
        if self.inner.session().running.is_some() {
            Status::Building
        } else {
            Status::Idle
        }
    }

    pub fn pid(&self) -> u32 {
        std::process::id()
    }

    fn lookup(state: &State, name: &str) -> Result<TargetId, Error> {
        state
            .graph
            .lookup(name)
            .ok_or_else(|| Error::TargetNotFound(name.to_string()))
    }

    /// Forget a target's last build so it and its dependents rebuild.
    pub fn set_dirty(&self, target: &str) -> Result<(), Error> {
        let mut guard = self.inner.state();
        let state = &mut *guard;
        let id = Self::lookup(state, target)?;
        detect::set_dirty(&mut state.graph, &mut state.db, id)?;
        Ok(())
    }

    pub fn dirty_sources(&self) -> Vec<String> {
        detect::dirty_sources(&self.inner.state().graph)
    }

    pub fn dirty_targets(&self) -> Vec<String> {
        detect::dirty_targets(&self.inner.state().graph)
    }

    pub fn inputs_of(&self, target: &str) -> Result<Vec<String>, Error> {
        self.inner.state().graph.inputs_of(target)
    }

    pub fn outputs_of(&self, target: &str) -> Result<Vec<String>, Error> {
        self.inner.state().graph.outputs_of(target)
    }

    /// Current hash of a target, as hex.
    pub fn hash_of(&self, target: &str) -> Result<String, Error> {
        let state = self.inner.state();
        let id = Self::lookup(&state, target)?;
        Ok(state.graph.target(id).hash.to_hex())
    }

    pub fn graphviz(&self) -> String {
        self.inner.state().graph.to_graphviz()
    }

    /// Note that files under the root changed.  `names` are relative to
    /// the root; a change to the build description reloads the graph.
    pub fn files_changed<S: AsRef<str>>(&self, names: &[S]) {
        if let Some(graph_name) = &self.inner.graph_name {
            if names.iter().any(|n| n.as_ref() == graph_name) {
                if let Err(err) = self.reload() {
                    tracing::warn!("reload: {}", err);
                }
            }
        }
        let mut state = self.inner.state();
        let changed = detect::files_changed(&mut state.graph, &self.inner.root, names);
        if changed > 0 {
            tracing::debug!("{} files changed", changed);
        }
    }

    /// Reload the build description.  During a build, the reload happens
    /// once the build ends.
    pub fn reload(&self) -> Result<(), Error> {
        // Holding the session keeps a build from starting mid-reload.
        let session = self.inner.session();
        if session.running.is_some() {
            self.inner.reload_pending.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let result = self.inner.reload_now();
        drop(session);
        result
    }

    /// Answer a control API request.
    pub fn handle(&self, request: Request) -> Result<Value, Error> {
        Ok(match request {
            Request::StartBuild {
                targets,
                num_threads,
            } => json!(self.start_build(&targets, num_threads)? as i32),
            Request::InterruptBuild => {
                self.interrupt_build();
                Value::Null
            }
            Request::Shutdown => {
                self.shutdown();
                Value::Null
            }
            Request::GetPid => json!(self.pid()),
            Request::GetStatus => json!(self.status()),
            Request::SetDirty { target } => {
                self.set_dirty(&target)?;
                Value::Null
            }
            Request::GetDirtySources => json!(self.dirty_sources()),
            Request::GetDirtyTargets => json!(self.dirty_targets()),
            Request::GetInputsOf { target } => json!(self.inputs_of(&target)?),
            Request::GetOutputsOf { target } => json!(self.outputs_of(&target)?),
            Request::GetHashOf { target } => json!(self.hash_of(&target)?),
            Request::GetGraphviz => json!(self.graphviz()),
        })
    }
}
