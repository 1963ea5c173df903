//! The build graph, a graph between targets and the rules that produce them.
//!
//! Targets and rules live in arenas and refer to each other by index; the
//! reverse edges (`dependents`) are plain ids looked up through the graph.

use crate::canon::canon_path;
use crate::error::Error;
use crate::hash::{Content, Hash};
use rustc_hash::FxHashMap;
use std::fmt::Write;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TargetId(usize);
impl TargetId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RuleId(usize);
impl RuleId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A rule as written in the build description.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDesc {
    #[serde(default)]
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, rename = "cmd")]
    pub command: Option<String>,
    #[serde(default)]
    pub depfile: Option<String>,
}

#[derive(Debug)]
pub struct Target {
    pub name: String,
    /// The rule that produces this target; None for sources.
    pub producer: Option<RuleId>,
    /// Rules that take this target as an explicit or implicit input.
    pub dependents: Vec<RuleId>,
    /// Last observed state of the file on disk.
    pub content: Content,
    /// Current hash, see hash.rs.
    pub hash: Hash,
    /// Hash recorded by the last successful build of this target.
    pub last_built: Option<Hash>,
    pub dirty: bool,
}

impl Target {
    pub fn is_source(&self) -> bool {
        self.producer.is_none()
    }

    /// A file we expected on disk isn't there.
    pub fn is_missing(&self) -> bool {
        self.content == Content::Missing
    }
}

#[derive(Debug)]
pub struct Rule {
    pub command: Option<String>,
    pub depfile: Option<String>,
    explicit_ins: Vec<TargetId>,
    /// Inputs discovered through the depfile; never overlaps explicit_ins.
    implicit_ins: Vec<TargetId>,
    outs: Vec<TargetId>,
    /// Signature over command and input hashes; also the cache key.
    pub signature: Hash,
}

impl Rule {
    /// A rule without a command only groups its inputs.
    pub fn is_phony(&self) -> bool {
        self.command.is_none()
    }

    pub fn explicit_ins(&self) -> &[TargetId] {
        &self.explicit_ins
    }

    pub fn implicit_ins(&self) -> &[TargetId] {
        &self.implicit_ins
    }

    /// All inputs that must be clean before the rule may run.
    pub fn inputs(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.explicit_ins
            .iter()
            .chain(self.implicit_ins.iter())
            .copied()
    }

    fn input_at(&self, i: usize) -> Option<TargetId> {
        if i < self.explicit_ins.len() {
            Some(self.explicit_ins[i])
        } else {
            self.implicit_ins.get(i - self.explicit_ins.len()).copied()
        }
    }

    pub fn outs(&self) -> &[TargetId] {
        &self.outs
    }
}

pub struct Graph {
    targets: Vec<Target>,
    rules: Vec<Rule>,
    by_name: FxHashMap<String, TargetId>,
    /// All targets, inputs before the targets built from them.
    order: Vec<TargetId>,
}

#[derive(Copy, Clone, PartialEq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

impl Graph {
    /// Construct the graph from a rule list.  Fails if an output is produced
    /// by two rules, a rule has no outputs, or the rules form a cycle.
    pub fn new(descs: Vec<RuleDesc>) -> Result<Graph, Error> {
        let mut graph = Graph {
            targets: Vec::new(),
            rules: Vec::new(),
            by_name: FxHashMap::default(),
            order: Vec::new(),
        };
        for (i, desc) in descs.into_iter().enumerate() {
            graph.add_rule(i, desc)?;
        }
        graph.order = graph.topo_order()?;
        Ok(graph)
    }

    fn add_target(&mut self, name: String) -> TargetId {
        let id = TargetId(self.targets.len());
        self.by_name.insert(name.clone(), id);
        self.targets.push(Target {
            name,
            producer: None,
            dependents: Vec::new(),
            content: Content::Missing,
            hash: Hash([0; 32]),
            last_built: None,
            dirty: true,
        });
        id
    }

    fn target_id(&mut self, name: &str) -> TargetId {
        let canon = canon_path(name);
        match self.by_name.get(&canon) {
            Some(&id) => id,
            None => self.add_target(canon),
        }
    }

    fn add_rule(&mut self, index: usize, desc: RuleDesc) -> Result<(), Error> {
        let location = format!("rule #{}", index);
        if desc.outputs.is_empty() {
            return Err(Error::parse(location, "rule has no outputs"));
        }
        let id = RuleId(self.rules.len());

        let mut outs = Vec::new();
        for name in &desc.outputs {
            let out = self.target_id(name);
            if outs.contains(&out) {
                continue;
            }
            let target = &mut self.targets[out.index()];
            if target.producer.is_some() {
                return Err(Error::parse(
                    location,
                    format!("{} is produced by more than one rule", target.name),
                ));
            }
            target.producer = Some(id);
            if desc.command.is_none() {
                target.content = Content::Phony;
            }
            outs.push(out);
        }

        let mut ins = Vec::new();
        for name in &desc.inputs {
            let input = self.target_id(name);
            if !ins.contains(&input) {
                ins.push(input);
                self.targets[input.index()].dependents.push(id);
            }
        }

        self.rules.push(Rule {
            command: desc.command,
            depfile: desc.depfile.map(canon_path),
            explicit_ins: ins,
            implicit_ins: Vec::new(),
            outs,
            signature: Hash([0; 32]),
        });
        Ok(())
    }

    /// Depth-first walk from every target into its producer's inputs,
    /// returning targets in dependency order.
    fn topo_order(&self) -> Result<Vec<TargetId>, Error> {
        let mut marks = vec![Mark::Unvisited; self.targets.len()];
        let mut order = Vec::with_capacity(self.targets.len());
        let mut stack: Vec<(TargetId, usize)> = Vec::new();
        for start in 0..self.targets.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            marks[start] = Mark::Visiting;
            stack.push((TargetId(start), 0));
            while let Some(&(id, next)) = stack.last() {
                let input = self.targets[id.index()]
                    .producer
                    .and_then(|rule| self.rules[rule.index()].input_at(next));
                match input {
                    Some(input) => {
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                        match marks[input.index()] {
                            Mark::Unvisited => {
                                marks[input.index()] = Mark::Visiting;
                                stack.push((input, 0));
                            }
                            Mark::Visiting => {
                                return Err(Error::Cycle {
                                    from: self.targets[input.index()].name.clone(),
                                    to: self.targets[id.index()].name.clone(),
                                });
                            }
                            Mark::Done => {}
                        }
                    }
                    None => {
                        marks[id.index()] = Mark::Done;
                        order.push(id);
                        stack.pop();
                    }
                }
            }
        }
        Ok(order)
    }

    pub fn lookup(&self, name: &str) -> Option<TargetId> {
        self.by_name.get(&canon_path(name)).copied()
    }

    fn lookup_or_err(&self, name: &str) -> Result<TargetId, Error> {
        self.lookup(name)
            .ok_or_else(|| Error::TargetNotFound(name.to_string()))
    }

    pub fn target(&self, id: TargetId) -> &Target {
        &self.targets[id.index()]
    }

    pub fn target_mut(&mut self, id: TargetId) -> &mut Target {
        &mut self.targets[id.index()]
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.index()]
    }

    pub fn rule_mut(&mut self, id: RuleId) -> &mut Rule {
        &mut self.rules[id.index()]
    }

    pub fn target_ids(&self) -> impl Iterator<Item = TargetId> {
        (0..self.targets.len()).map(TargetId)
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = RuleId> {
        (0..self.rules.len()).map(RuleId)
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets in dependency order: every input precedes its outputs.
    pub fn order(&self) -> &[TargetId] {
        &self.order
    }

    /// Inputs (explicit and implicit) of the rule producing `name`.
    /// Sources have no inputs.
    pub fn inputs_of(&self, name: &str) -> Result<Vec<String>, Error> {
        let id = self.lookup_or_err(name)?;
        let mut names: Vec<String> = match self.target(id).producer {
            None => Vec::new(),
            Some(rule) => self
                .rule(rule)
                .inputs()
                .map(|input| self.target(input).name.clone())
                .collect(),
        };
        names.sort();
        Ok(names)
    }

    /// Outputs of every rule that takes `name` as an input.
    pub fn outputs_of(&self, name: &str) -> Result<Vec<String>, Error> {
        let id = self.lookup_or_err(name)?;
        let mut names: Vec<String> = self
            .target(id)
            .dependents
            .iter()
            .flat_map(|&rule| self.rule(rule).outs())
            .map(|&out| self.target(out).name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Replace a rule's implicit inputs, creating targets for unseen paths.
    /// Returns the newly created targets.  If the new edges would form a
    /// cycle the graph is left unchanged.
    pub fn set_implicit_inputs(
        &mut self,
        id: RuleId,
        names: &[String],
    ) -> Result<Vec<TargetId>, Error> {
        let first_new = self.targets.len();
        let mut ins = Vec::new();
        for name in names {
            let input = self.target_id(name);
            if !self.rules[id.index()].explicit_ins.contains(&input) && !ins.contains(&input) {
                ins.push(input);
            }
        }
        if ins == self.rules[id.index()].implicit_ins {
            return Ok(Vec::new());
        }

        let old = std::mem::replace(&mut self.rules[id.index()].implicit_ins, ins.clone());
        self.relink_implicit(id, &old, &ins);
        match self.topo_order() {
            Ok(order) => {
                self.order = order;
                Ok((first_new..self.targets.len()).map(TargetId).collect())
            }
            Err(err) => {
                self.rules[id.index()].implicit_ins = old.clone();
                self.relink_implicit(id, &ins, &old);
                for target in self.targets.drain(first_new..) {
                    self.by_name.remove(&target.name);
                }
                Err(err)
            }
        }
    }

    fn relink_implicit(&mut self, id: RuleId, old: &[TargetId], new: &[TargetId]) {
        let explicit = &self.rules[id.index()].explicit_ins;
        for input in old {
            if !new.contains(input) && !explicit.contains(input) {
                self.targets[input.index()].dependents.retain(|&r| r != id);
            }
        }
        for input in new {
            let dependents = &mut self.targets[input.index()].dependents;
            if !dependents.contains(&id) {
                dependents.push(id);
            }
        }
    }

    /// Render the graph in graphviz dot syntax.  Dirty targets are red,
    /// implicit edges are dashed, aggregation rules are dashed circles.
    pub fn to_graphviz(&self) -> String {
        fn color(dirty: bool) -> &'static str {
            if dirty {
                "red"
            } else {
                "black"
            }
        }
        let mut out = String::new();
        out.push_str("digraph falcon {\n");
        out.push_str("rankdir=\"LR\"\n");
        out.push_str("node [fontsize=10, shape=box, height=0.25, style=filled]\n");
        for target in &self.targets {
            let _ = writeln!(
                out,
                "\"{}\" [label=\"{}\" color=\"{}\" fillcolor=\"white\"]",
                escape(&target.name),
                escape(&target.name),
                color(target.dirty)
            );
        }
        for (i, rule) in self.rules.iter().enumerate() {
            let dirty = rule.outs.iter().any(|&o| self.target(o).dirty);
            let style = if rule.is_phony() {
                "\"filled, dashed\""
            } else {
                "filled"
            };
            let label: String = rule
                .command
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(24)
                .collect();
            let _ = writeln!(
                out,
                "\"rule{}\" [label=\"{}\" shape=ellipse style={} color=\"{}\" fillcolor=\"white\"]",
                i,
                escape(&label),
                style,
                color(dirty)
            );
            for (input, edge_style) in rule
                .explicit_ins
                .iter()
                .map(|i| (i, "solid"))
                .chain(rule.implicit_ins.iter().map(|i| (i, "dashed")))
            {
                let target = self.target(*input);
                let _ = writeln!(
                    out,
                    "\"{}\" -> \"rule{}\" [color=\"{}\", style={}]",
                    escape(&target.name),
                    i,
                    color(target.dirty),
                    edge_style
                );
            }
            for &output in &rule.outs {
                let _ = writeln!(
                    out,
                    "\"rule{}\" -> \"{}\"",
                    i,
                    escape(&self.target(output).name)
                );
            }
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
