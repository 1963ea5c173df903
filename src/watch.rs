//! File watching: feeds change notifications under the workspace root to
//! the daemon, in batches.

use crate::canon;
use crate::daemon::Daemon;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Events arriving this close together are handled as one batch.
const BATCH_WINDOW: Duration = Duration::from_millis(20);

/// Watches the daemon's root until dropped.
pub struct FileWatcher {
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn start(daemon: Daemon) -> anyhow::Result<FileWatcher> {
        let root = daemon.root().to_path_buf();
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let ignored = vec![
            daemon.config().state_path(),
            daemon.error_log().to_path_buf(),
        ];
        tracing::info!("watching {}", root.display());
        let thread = std::thread::Builder::new()
            .name("watch".into())
            .spawn(move || watch_loop(&daemon, &root, &ignored, rx))?;
        Ok(FileWatcher {
            watcher: Some(watcher),
            thread: Some(thread),
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        // Dropping the watcher drops the sender, ending the loop.
        self.watcher.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Names under `root` that an event touched, skipping our own files.
fn event_names(root: &Path, ignored: &[PathBuf], event: &Event) -> Vec<String> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| !ignored.iter().any(|dir| p.starts_with(dir)))
        .filter_map(|p| canon::relative_name(root, p))
        .collect()
}

fn watch_loop(daemon: &Daemon, root: &Path, ignored: &[PathBuf], rx: mpsc::Receiver<notify::Result<Event>>) {
    let mut batch: Vec<String> = Vec::new();
    let add = |batch: &mut Vec<String>, res: notify::Result<Event>| match res {
        Ok(event) => batch.extend(event_names(root, ignored, &event)),
        Err(err) => tracing::warn!("watch: {}", err),
    };
    while let Ok(res) = rx.recv() {
        add(&mut batch, res);
        loop {
            match rx.recv_timeout(BATCH_WINDOW) {
                Ok(res) => add(&mut batch, res),
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if batch.is_empty() {
            continue;
        }
        batch.sort();
        batch.dedup();
        tracing::debug!("changed: {:?}", batch);
        daemon.files_changed(&batch);
        batch.clear();
    }
}
