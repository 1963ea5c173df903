//! Runs build tasks, potentially in parallel.
//! Unaware of the build graph beyond carrying a RuleId through; just command
//! execution.  Each task gets a thread that blocks on its subprocess.

use crate::graph::RuleId;
use crate::process::{self, CommandOutput, Termination};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished tasks in different
    /// tracks in a performance trace.
    pub tid: usize,
    pub rule: RuleId,
    pub span: (Instant, Instant),
    pub result: CommandOutput,
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}
impl ThreadIds {
    fn new() -> Self {
        ThreadIds { slots: Vec::new() }
    }

    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

/// Pids of running commands, keyed by tid, plus the flag that stops new ones.
#[derive(Default)]
struct Running {
    cancelled: AtomicBool,
    pids: Mutex<FxHashMap<usize, u32>>,
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    pub running: usize,
    tids: ThreadIds,
    parallelism: usize,
    dir: PathBuf,
    live: Arc<Running>,
}

impl Runner {
    pub fn new(parallelism: usize, dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::new(),
            parallelism: parallelism.max(1),
            dir,
            live: Arc::default(),
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, rule: RuleId, cmdline: String) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        let dir = self.dir.clone();
        let live = self.live.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = if live.cancelled.load(Ordering::SeqCst) {
                CommandOutput {
                    termination: Termination::Interrupted,
                    status: "interrupted".into(),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }
            } else {
                process::run_command(&cmdline, &dir, |pid| {
                    let mut pids = live.pids.lock().unwrap_or_else(|e| e.into_inner());
                    pids.insert(tid, pid);
                    // kill_all() may have run between the check above and now.
                    if live.cancelled.load(Ordering::SeqCst) {
                        process::kill_group(pid);
                    }
                })
                .unwrap_or_else(|err| CommandOutput {
                    termination: Termination::Failure,
                    status: "failed to start".into(),
                    stdout: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                })
            };
            live.pids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&tid);
            let finish = Instant::now();

            let task = FinishedTask {
                tid,
                rule,
                span: (start, finish),
                result,
            };
            // The send will only fail if the receiver disappeared, e.g. due to shutting down.
            let _ = tx.send(task);
        });
        self.running += 1;
    }

    /// Terminate every running command and refuse to start new ones.
    /// Their results still arrive through wait(), as Interrupted.
    pub fn kill_all(&self) {
        self.live.cancelled.store(true, Ordering::SeqCst);
        let pids = self.live.pids.lock().unwrap_or_else(|e| e.into_inner());
        for &pid in pids.values() {
            process::kill_group(pid);
        }
    }

    /// Wait for a task to complete, with a timeout.
    /// If the timeout elapses return None.
    pub fn wait(&mut self, dur: Duration) -> Option<FinishedTask> {
        if !self.is_running() {
            return None;
        }
        let task = match self.finished_recv.recv_timeout(dur) {
            Ok(task) => task,
            // We hold a sender ourselves, so the channel can't disconnect.
            Err(_) => return None,
        };
        self.tids.release(task.tid);
        self.running -= 1;
        Some(task)
    }
}
