//! Build runner, choosing and executing tasks as determined by out of date inputs.
//!
//! One coordinator (the thread calling Work::run) owns all decisions; it takes
//! the state lock only briefly, to start a rule or to apply a finished task's
//! result, so queries and file notifications interleave with a build.  Tasks
//! run on the Runner's threads and report back through its channel.

use crate::cache::{Cache, Entry};
use crate::error::{Error, ErrorLog};
use crate::graph::{Graph, RuleId, TargetId};
use crate::hash::{Content, Hash};
use crate::load::State;
use crate::process::Termination;
use crate::progress::Progress;
use crate::task::{FinishedTask, Runner};
use crate::{depfile, detect, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// What a build needs from the daemon.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub state: &'a Mutex<State>,
    pub root: &'a Path,
    pub cache: &'a Cache,
    pub errors: &'a ErrorLog,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// The rules a build must bring up to date, and their ordering constraints.
struct Plan {
    /// Every rule the build wants, in discovery order.
    wanted: Vec<RuleId>,
    /// Number of wanted rules each rule is still waiting on.
    pending: FxHashMap<RuleId, usize>,
    /// Rules waiting on each rule.
    waiting: FxHashMap<RuleId, Vec<RuleId>>,
    /// Rules whose inputs are all up to date, in the order they became so.
    ready: VecDeque<RuleId>,
    /// Dirty sources requested as goals; no rule will mark them built.
    goal_sources: Vec<TargetId>,
    done: usize,
}

impl Plan {
    fn new(graph: &Graph, goals: &[TargetId]) -> Plan {
        let mut wanted = Vec::new();
        let mut wanted_set = FxHashSet::default();
        let mut goal_sources = Vec::new();
        for &goal in goals {
            let target = graph.target(goal);
            if target.is_source() && target.dirty {
                goal_sources.push(goal);
            }
        }

        // Clean targets have clean inputs, so the walk stops at them.
        let mut seen = vec![false; graph.len()];
        let mut stack: Vec<TargetId> = goals.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let target = graph.target(id);
            if !target.dirty {
                continue;
            }
            if let Some(rule) = target.producer {
                if wanted_set.insert(rule) {
                    wanted.push(rule);
                    let inputs: Vec<TargetId> = graph.rule(rule).inputs().collect();
                    stack.extend(inputs.into_iter().rev());
                }
            }
        }

        let mut pending = FxHashMap::default();
        let mut waiting: FxHashMap<RuleId, Vec<RuleId>> = FxHashMap::default();
        let mut ready = VecDeque::new();
        for &rule in &wanted {
            let mut deps: Vec<RuleId> = graph
                .rule(rule)
                .inputs()
                .filter_map(|input| graph.target(input).producer)
                .filter(|dep| wanted_set.contains(dep))
                .collect();
            deps.sort();
            deps.dedup();
            for &dep in &deps {
                waiting.entry(dep).or_default().push(rule);
            }
            pending.insert(rule, deps.len());
        }
        // Most recently discovered (deepest) rules first.
        for &rule in wanted.iter().rev() {
            if pending[&rule] == 0 {
                ready.push_back(rule);
            }
        }

        Plan {
            wanted,
            pending,
            waiting,
            ready,
            goal_sources,
            done: 0,
        }
    }

    /// Plan a build of everything: every target nothing depends on.  A
    /// source only becomes a goal this way if no rule reads it.
    fn everything(graph: &Graph) -> Plan {
        let roots: Vec<TargetId> = graph
            .target_ids()
            .filter(|&id| graph.target(id).dependents.is_empty())
            .collect();
        Plan::new(graph, &roots)
    }

    /// Note that a rule's outputs are up to date, readying its waiters.
    fn rule_done(&mut self, rule: RuleId) {
        self.done += 1;
        for waiter in self.waiting.remove(&rule).unwrap_or_default() {
            if let Some(count) = self.pending.get_mut(&waiter) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(waiter);
                }
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.done == self.wanted.len()
    }
}

/// Mark a rule's dirty source inputs and then its outputs as built.
fn mark_rule_built(state: &mut State, rule: RuleId) -> Result<(), Error> {
    let graph = &mut state.graph;
    let inputs: Vec<TargetId> = graph.rule(rule).inputs().collect();
    for input in inputs {
        let target = graph.target(input);
        if target.is_source() && target.dirty {
            detect::mark_built(graph, &mut state.db, input)?;
        }
    }
    for out in graph.rule(rule).outs().to_vec() {
        detect::mark_built(graph, &mut state.db, out)?;
    }
    Ok(())
}

/// Re-read the content of a rule's outputs from disk.
fn reread_outputs(graph: &mut Graph, root: &Path, rule: RuleId) -> Vec<TargetId> {
    let outs = graph.rule(rule).outs().to_vec();
    for &out in &outs {
        if graph.target(out).content != Content::Phony {
            let content = detect::read_content(root, &graph.target(out).name);
            graph.target_mut(out).content = content;
        }
    }
    outs
}

/// Re-read a rule's depfile, hashing any inputs it introduced.
fn reingest(graph: &mut Graph, root: &Path, rule: RuleId) -> Result<Vec<TargetId>, Error> {
    let created = depfile::ingest(graph, root, rule)?.unwrap_or_default();
    for &id in &created {
        let content = detect::read_content(root, &graph.target(id).name);
        graph.target_mut(id).content = content;
    }
    Ok(created)
}

fn first_missing_output(graph: &Graph, rule: RuleId) -> Option<String> {
    graph
        .rule(rule)
        .outs()
        .iter()
        .map(|&out| graph.target(out))
        .find(|t| t.is_missing())
        .map(|t| t.name.clone())
}

fn rule_name(graph: &Graph, rule: RuleId) -> String {
    graph
        .rule(rule)
        .outs()
        .first()
        .map(|&out| graph.target(out).name.clone())
        .unwrap_or_default()
}

pub struct Work<'a> {
    ctx: Context<'a>,
    plan: Plan,
    runner: Runner,
    progress: &'a mut dyn Progress,
    cancel: &'a AtomicBool,
    /// Signature and command line of every running rule, as launched.
    launched: FxHashMap<RuleId, (Hash, String)>,
    /// Rules already rerun once because their inputs changed under them.
    retried: FxHashSet<RuleId>,
    failed: bool,
    interrupted: bool,
}

impl<'a> Work<'a> {
    /// Plan a build of `goals`, or of everything if there are none.
    /// Goals must name targets in the graph.
    pub fn new(
        ctx: Context<'a>,
        goals: &[TargetId],
        parallelism: usize,
        progress: &'a mut dyn Progress,
        cancel: &'a AtomicBool,
    ) -> Self {
        let plan = {
            let state = lock(ctx.state);
            trace::scope("work::plan", || {
                if goals.is_empty() {
                    Plan::everything(&state.graph)
                } else {
                    Plan::new(&state.graph, goals)
                }
            })
        };
        tracing::debug!("planned {} rules", plan.wanted.len());
        Work {
            ctx,
            plan,
            runner: Runner::new(parallelism, ctx.root.to_path_buf()),
            progress,
            cancel,
            launched: FxHashMap::default(),
            retried: FxHashSet::default(),
            failed: false,
            interrupted: false,
        }
    }

    fn fail(&mut self, err: &Error) {
        self.ctx.errors.record(err);
        self.progress.log(&err.to_string());
        self.failed = true;
    }

    /// Run the build to completion.  Returns whether it succeeded.
    pub fn run(mut self) -> bool {
        trace::scope("work::run", || self.run_loop())
    }

    fn run_loop(&mut self) -> bool {
        self.check_goal_sources();
        loop {
            if !self.interrupted && self.cancel.load(Ordering::SeqCst) {
                self.interrupted = true;
                self.runner.kill_all();
                self.progress.log("interrupted");
            }
            while !self.interrupted && self.runner.can_start_more() {
                match self.plan.ready.pop_front() {
                    Some(rule) => self.start(rule),
                    None => break,
                }
            }
            if !self.runner.is_running() {
                break;
            }
            if let Some(task) = self.runner.wait(Duration::from_millis(100)) {
                self.finish_task(task);
            }
        }
        let success = !self.failed && !self.interrupted && self.plan.is_complete();
        self.progress.finish(success);
        success
    }

    /// Goals that are sources have no rule; they only need to exist.
    fn check_goal_sources(&mut self) {
        let state_mutex = self.ctx.state;
        let mut guard = lock(state_mutex);
        let state = &mut *guard;
        for id in std::mem::take(&mut self.plan.goal_sources) {
            let name = state.graph.target(id).name.clone();
            if state.graph.target(id).is_missing() {
                self.fail(&Error::MissingSource(name));
            } else if let Err(err) = detect::mark_built(&mut state.graph, &mut state.db, id) {
                self.fail(&err.into());
            }
        }
    }

    /// Bring one ready rule up to date: skip it, satisfy it from the cache,
    /// or launch its command.  The cache is consulted without the state
    /// lock held.
    fn start(&mut self, rule: RuleId) {
        let state_mutex = self.ctx.state;
        let (key, cmdline) = {
            let mut guard = lock(state_mutex);
            let state = &mut *guard;

            let missing = state
                .graph
                .rule(rule)
                .inputs()
                .map(|input| state.graph.target(input))
                .find(|t| t.is_source() && t.is_missing())
                .map(|t| t.name.clone());
            if let Some(name) = missing {
                self.fail(&Error::MissingSource(name));
                return;
            }

            // Inputs may have changed since planning; fold that in first.
            let outs = state.graph.rule(rule).outs().to_vec();
            detect::update(&mut state.graph, outs);
            let up_to_date = !state
                .graph
                .rule(rule)
                .outs()
                .iter()
                .any(|&out| state.graph.target(out).dirty);
            if up_to_date || state.graph.rule(rule).is_phony() {
                match mark_rule_built(state, rule) {
                    Ok(()) => self.plan.rule_done(rule),
                    Err(err) => self.fail(&err),
                }
                return;
            }
            let r = state.graph.rule(rule);
            (r.signature, r.command.clone().unwrap_or_default())
        };

        if let Some(entry) = self.ctx.cache.lookup(&key) {
            match self.apply_cached(rule, &key, &entry) {
                Ok(true) => {
                    self.plan.rule_done(rule);
                    return;
                }
                Ok(false) => {
                    // Inputs changed during the restore; look again.
                    self.plan.ready.push_back(rule);
                    return;
                }
                Err(err) => tracing::warn!("{}: {}", cmdline, err),
            }
        }

        self.progress.task_started(&cmdline);
        self.launched.insert(rule, (key, cmdline.clone()));
        self.runner.start(rule, cmdline);
    }

    /// Restore a rule's outputs (and depfile) from the cache entry for
    /// `key`.  Returns false if the rule's signature moved away from `key`
    /// meanwhile, leaving the rule dirty.
    fn apply_cached(&mut self, rule: RuleId, key: &Hash, entry: &Entry) -> Result<bool, Error> {
        let root = self.ctx.root;
        self.ctx.cache.restore(root, entry)?;

        let state_mutex = self.ctx.state;
        let mut guard = lock(state_mutex);
        let state = &mut *guard;
        let mut touched = reread_outputs(&mut state.graph, root, rule);
        touched.extend(reingest(&mut state.graph, root, rule)?);
        detect::update(&mut state.graph, touched);
        if state.graph.rule(rule).signature != *key {
            return Ok(false);
        }
        if let Some(name) = first_missing_output(&state.graph, rule) {
            return Err(Error::CacheIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cache entry lacks {}", name),
            )));
        }
        mark_rule_built(state, rule)?;
        for &out in state.graph.rule(rule).outs() {
            self.progress.cached(&state.graph.target(out).name);
        }
        Ok(true)
    }

    fn finish_task(&mut self, task: FinishedTask) {
        let rule = task.rule;
        let (launch_signature, cmdline) = match self.launched.remove(&rule) {
            Some(launched) => launched,
            None => return,
        };
        trace::write_complete(&cmdline, task.tid + 1, task.span.0, task.span.1);
        self.progress.task_finished(&cmdline, &task.result);

        let built = match self.record_finished(&task, launch_signature) {
            Some(built) => built,
            None => return,
        };

        // Outside the state lock: this copies every output.
        let root = self.ctx.root;
        if let Err(err) = self.ctx.cache.store(
            &built.signature,
            root,
            &built.outputs,
            built.depfile.as_deref(),
            &String::from_utf8_lossy(&task.result.stdout),
            &String::from_utf8_lossy(&task.result.stderr),
        ) {
            tracing::warn!("{}", err);
        }

        self.plan.rule_done(rule);
    }

    /// Fold a finished command's effects into the graph.  Returns what to
    /// cache if the rule is now built.
    fn record_finished(&mut self, task: &FinishedTask, launch_signature: Hash) -> Option<Built> {
        let rule = task.rule;
        let root = self.ctx.root;
        let state_mutex = self.ctx.state;
        let mut guard = lock(state_mutex);
        let state = &mut *guard;

        // Whatever happened, the outputs on disk may have changed.
        let outs = reread_outputs(&mut state.graph, root, rule);
        detect::update(&mut state.graph, outs);

        match task.result.termination {
            Termination::Success => {}
            Termination::Interrupted => {
                self.interrupted = true;
                return None;
            }
            Termination::Failure => {
                let target = rule_name(&state.graph, rule);
                self.fail(&Error::CommandFailure {
                    target,
                    status: task.result.status.clone(),
                });
                return None;
            }
        }

        if state.graph.rule(rule).signature != launch_signature {
            let target = rule_name(&state.graph, rule);
            if self.retried.insert(rule) {
                tracing::warn!("inputs of {} changed while building, running again", target);
                self.plan.ready.push_back(rule);
            } else {
                self.fail(&Error::CommandFailure {
                    target,
                    status: "inputs changed while building".into(),
                });
            }
            return None;
        }

        match reingest(&mut state.graph, root, rule) {
            Ok(created) => {
                let mut touched = created;
                touched.extend(state.graph.rule(rule).outs().iter().copied());
                detect::update(&mut state.graph, touched);
            }
            Err(err) => {
                self.fail(&err);
                return None;
            }
        }

        if let Some(name) = first_missing_output(&state.graph, rule) {
            self.fail(&Error::CommandFailure {
                target: name,
                status: format!("{}, but output is missing", task.result.status),
            });
            return None;
        }

        if let Err(err) = mark_rule_built(state, rule) {
            self.fail(&err);
            return None;
        }

        let graph = &state.graph;
        Some(Built {
            signature: graph.rule(rule).signature,
            outputs: graph
                .rule(rule)
                .outs()
                .iter()
                .map(|&out| graph.target(out).name.clone())
                .collect(),
            depfile: graph
                .rule(rule)
                .depfile
                .clone()
                .filter(|d| root.join(d).exists()),
        })
    }
}

/// A rule just built by its command, as the cache records it.
struct Built {
    signature: Hash,
    outputs: Vec<String>,
    depfile: Option<String>,
}
