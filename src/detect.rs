//! Change detection: keeps every target's hash and dirty flag current.
//!
//! A full scan establishes the state at startup; afterwards file changes and
//! build completions are applied incrementally by recomputing the touched
//! targets and walking forward through their dependents until nothing else
//! changes.

use crate::db::Db;
use crate::graph::{Graph, RuleId, TargetId};
use crate::hash::{self, Content};
use rayon::prelude::*;
use std::collections::VecDeque;
use std::path::Path;

/// Read a target's content from disk.  Unreadable files count as missing.
pub fn read_content(root: &Path, name: &str) -> Content {
    let path = root.join(name);
    match hash::hash_file(&path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!("hash {}: {}", path.display(), err);
            Content::Missing
        }
    }
}

/// Hash everything on disk and compute all dirty flags from scratch.
pub fn scan(graph: &mut Graph, db: &Db, root: &Path) {
    let files: Vec<(TargetId, String)> = graph
        .target_ids()
        .filter(|&id| graph.target(id).content != Content::Phony)
        .map(|id| (id, graph.target(id).name.clone()))
        .collect();
    let contents: Vec<Content> = files
        .par_iter()
        .map(|(_, name)| read_content(root, name))
        .collect();
    for ((id, _), content) in files.into_iter().zip(contents) {
        graph.target_mut(id).content = content;
    }

    for id in graph.target_ids().collect::<Vec<_>>() {
        let target = graph.target_mut(id);
        target.last_built = db.get(&target.name);
    }

    let mut done = vec![false; graph.rule_ids().count()];
    for id in graph.order().to_vec() {
        match graph.target(id).producer {
            None => {
                refresh_source(graph, id);
            }
            Some(rule) if !done[rule.index()] => {
                done[rule.index()] = true;
                refresh_rule(graph, rule);
            }
            Some(_) => {}
        }
    }
}

fn set_state(graph: &mut Graph, id: TargetId, hash: hash::Hash, dirty: bool) -> bool {
    let target = graph.target_mut(id);
    let changed = target.hash != hash || target.dirty != dirty;
    target.hash = hash;
    target.dirty = dirty;
    changed
}

fn refresh_source(graph: &mut Graph, id: TargetId) -> bool {
    let target = graph.target(id);
    let hash = hash::source_hash(&target.name, &target.content);
    let dirty = target.last_built != Some(hash);
    set_state(graph, id, hash, dirty)
}

/// Recompute a rule's signature from its inputs, then the hashes and dirty
/// flags of its outputs.  Returns the outputs that changed.
pub fn refresh_rule(graph: &mut Graph, id: RuleId) -> Vec<TargetId> {
    let rule = graph.rule(id);
    let signature = hash::rule_signature(
        rule.command.as_deref(),
        rule.inputs().map(|input| {
            let target = graph.target(input);
            (target.name.as_str(), target.hash)
        }),
    );
    let inputs_dirty = rule.inputs().any(|input| graph.target(input).dirty);
    graph.rule_mut(id).signature = signature;

    let mut changed = Vec::new();
    for out in graph.rule(id).outs().to_vec() {
        let target = graph.target(out);
        let hash = hash::derived_hash(&target.name, &signature, &target.content);
        let dirty = inputs_dirty || target.is_missing() || target.last_built != Some(hash);
        if set_state(graph, out, hash, dirty) {
            changed.push(out);
        }
    }
    changed
}

fn refresh(graph: &mut Graph, id: TargetId) -> Vec<TargetId> {
    match graph.target(id).producer {
        None => {
            if refresh_source(graph, id) {
                vec![id]
            } else {
                Vec::new()
            }
        }
        Some(rule) => refresh_rule(graph, rule),
    }
}

/// Recompute the given targets and everything downstream of a change.
pub fn update(graph: &mut Graph, seeds: impl IntoIterator<Item = TargetId>) {
    let mut queue: VecDeque<TargetId> = seeds.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        for changed in refresh(graph, id) {
            for &rule in &graph.target(changed).dependents {
                queue.extend(graph.rule(rule).outs().iter().copied());
            }
        }
    }
}

/// Re-hash the named files and propagate.  Unknown names and aggregation
/// targets are ignored, and a file whose bytes didn't change is a no-op.
/// Returns the number of targets whose content changed.
pub fn files_changed<S: AsRef<str>>(graph: &mut Graph, root: &Path, names: &[S]) -> usize {
    let mut seeds = Vec::new();
    for name in names {
        let id = match graph.lookup(name.as_ref()) {
            Some(id) => id,
            None => continue,
        };
        if graph.target(id).content == Content::Phony || seeds.contains(&id) {
            continue;
        }
        let content = read_content(root, &graph.target(id).name);
        if content != graph.target(id).content {
            graph.target_mut(id).content = content;
            seeds.push(id);
        }
    }
    let count = seeds.len();
    update(graph, seeds);
    count
}

/// Record the target's current hash as its last successful build.
pub fn mark_built(graph: &mut Graph, db: &mut Db, id: TargetId) -> std::io::Result<()> {
    let target = graph.target_mut(id);
    target.last_built = Some(target.hash);
    db.record(&target.name, target.hash)?;
    update(graph, [id]);
    Ok(())
}

/// Forget the target's last build, making it and its dependents dirty.
pub fn set_dirty(graph: &mut Graph, db: &mut Db, id: TargetId) -> std::io::Result<()> {
    let target = graph.target_mut(id);
    target.last_built = None;
    db.forget(&target.name)?;
    update(graph, [id]);
    Ok(())
}

pub fn dirty_sources(graph: &Graph) -> Vec<String> {
    let mut names: Vec<String> = graph
        .targets()
        .filter(|t| t.dirty && t.is_source())
        .map(|t| t.name.clone())
        .collect();
    names.sort();
    names
}

pub fn dirty_targets(graph: &Graph) -> Vec<String> {
    let mut names: Vec<String> = graph
        .targets()
        .filter(|t| t.dirty)
        .map(|t| t.name.clone())
        .collect();
    names.sort();
    names
}
