//! Graph loading: parses the build description, constructs the build graph
//! from it, and brings it up to date with what's on disk.
//!
//! The build description is JSON:
//!
//! ```text
//! {"rules": [{"inputs": ["a.c"], "outputs": ["a.o"],
//!             "cmd": "cc -MD -MF a.d -c a.c", "depfile": "a.d"}]}
//! ```

use crate::db::Db;
use crate::detect;
use crate::error::{Error, ErrorLog};
use crate::graph::{Graph, RuleDesc};
use crate::{depfile, trace};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
struct Description {
    rules: Vec<RuleDesc>,
}

/// Everything the daemon knows about the workspace.
pub struct State {
    pub graph: Graph,
    pub db: Db,
}

/// Parse a build description from text; `name` is used in errors.
pub fn parse_description(name: &str, text: &str) -> Result<Vec<RuleDesc>, Error> {
    let desc: Description = serde_json::from_str(text).map_err(|err| {
        Error::parse(
            name,
            format!("line {} column {}: {}", err.line(), err.column(), err),
        )
    })?;
    Ok(desc.rules)
}

/// Read every rule's depfile that exists, adding implicit inputs.  Bad
/// depfiles are recorded and leave the rule without implicit inputs, which
/// keeps it dirty.
pub fn ingest_depfiles(graph: &mut Graph, root: &Path, errors: &ErrorLog) {
    for rule in graph.rule_ids().collect::<Vec<_>>() {
        if let Err(err) = depfile::ingest(graph, root, rule) {
            errors.record(&err);
        }
    }
}

/// Parse the build description at `path` and construct its graph, including
/// implicit inputs from depfiles already on disk.
pub fn load_graph(path: &Path, root: &Path, errors: &ErrorLog) -> Result<Graph, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::parse(path.display().to_string(), format!("read: {}", err))
    })?;
    let rules = trace::scope("load::parse", || {
        parse_description(&path.display().to_string(), &text)
    })?;
    let mut graph = trace::scope("load::graph", || Graph::new(rules))?;
    trace::scope("load::depfiles", || ingest_depfiles(&mut graph, root, errors));
    Ok(graph)
}

/// Load the graph and the build database, and compute the initial state.
/// Graph errors are recorded to the error log before being returned.
pub fn read(graph_path: &Path, root: &Path, state_dir: &Path, errors: &ErrorLog) -> anyhow::Result<State> {
    let mut graph = match load_graph(graph_path, root, errors) {
        Ok(graph) => graph,
        Err(err) => {
            errors.record(&err);
            return Err(err.into());
        }
    };
    std::fs::create_dir_all(state_dir)
        .map_err(|err| anyhow::anyhow!("create {}: {}", state_dir.display(), err))?;
    let db = trace::scope("db::open", || Db::open(&state_dir.join("db")))?;
    trace::scope("detect::scan", || detect::scan(&mut graph, &db, root));
    tracing::info!(
        "loaded {} targets, {} dirty",
        graph.len(),
        graph.targets().filter(|t| t.dirty).count()
    );
    Ok(State { graph, db })
}
