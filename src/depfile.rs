//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers,
//! and merging the result into the graph as implicit inputs.

use crate::canon::canon_path;
use crate::error::Error;
use crate::graph::{Graph, RuleId, TargetId};
use crate::scanner::{ParseResult, Scanner};
use std::path::Path;

#[derive(Debug)]
pub struct Deps<'a> {
    pub target: &'a str,
    pub deps: Vec<&'a str>,
}

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            ' ' | '\t' => {}
            '\\' => match scanner.read() {
                '\r' if scanner.peek() == '\n' => scanner.next(),
                '\n' => {}
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

fn read_path<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Option<&'a str>> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    loop {
        match scanner.read() {
            '\0' | ' ' | '\t' | ':' | '\r' | '\n' => {
                scanner.back();
                break;
            }
            _ => {}
        }
    }
    let end = scanner.ofs;
    if end == start {
        return Ok(None);
    }
    Ok(Some(scanner.slice(start, end)))
}

pub fn parse<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Deps<'a>> {
    let target = match read_path(scanner)? {
        None => return scanner.parse_error("expected file"),
        Some(o) => o,
    };
    scanner.expect(':')?;
    let mut deps = Vec::new();
    while let Some(p) = read_path(scanner)? {
        deps.push(p);
    }
    loop {
        match scanner.peek() {
            ' ' | '\t' | '\r' | '\n' => scanner.next(),
            _ => break,
        }
    }
    if !scanner.at_end() {
        return scanner.parse_error("expected end of file");
    }

    Ok(Deps { target, deps })
}

/// Read and parse the depfile at `path`.  Returns Ok(None) if it doesn't
/// exist, which callers treat as "no information yet".
pub fn read_depfile(path: &Path) -> Result<Option<(String, Vec<String>)>, Error> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::parse(path.display().to_string(), "depfile is not utf-8"))?;
    let mut scanner = Scanner::new(&text);
    let deps = parse(&mut scanner).map_err(|err| {
        Error::parse(
            path.display().to_string(),
            scanner.format_parse_error(path, err),
        )
    })?;
    Ok(Some((
        canon_path(deps.target),
        deps.deps.into_iter().map(canon_path).collect(),
    )))
}

/// Reread a rule's depfile and replace its implicit inputs with the result.
/// Returns the targets that were first seen in the depfile, or None if the
/// rule has no depfile or it doesn't exist on disk.
pub fn ingest(graph: &mut Graph, root: &Path, rule: RuleId) -> Result<Option<Vec<TargetId>>, Error> {
    let depfile = match &graph.rule(rule).depfile {
        Some(d) => d.clone(),
        None => return Ok(None),
    };
    let (target, deps) = match read_depfile(&root.join(&depfile))? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    let produces_target = graph
        .rule(rule)
        .outs()
        .iter()
        .any(|&out| graph.target(out).name == target);
    if !produces_target {
        return Err(Error::parse(
            depfile,
            format!("depfile names {:?}, which its rule doesn't produce", target),
        ));
    }
    graph.set_implicit_inputs(rule, &deps).map(Some)
}
