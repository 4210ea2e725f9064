//! The dependency generator: runs `af-deps` inside a container, parses its
//! `o`/`d` record stream, and builds a [`digraph::Digraph`] over startdirs
//! (spec §4.4).

use af_container::{Container, RunOptions};
use digraph::Digraph;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("af-deps exited with status {status}"))]
    HelperFailed { status: i32 },

    #[snafu(display("failed to run af-deps inside the container"))]
    Container { source: af_container::Error },

    #[snafu(display("invalid af-deps output line: {line:?}"))]
    InvalidLine { line: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A pair of startdirs between which a dependency edge (in either
/// direction) should be suppressed, regardless of what `af-deps` reports.
pub type IgnorePair = (String, String);

fn ignored(ignore_deps: &[IgnorePair], a: &str, b: &str) -> bool {
    ignore_deps
        .iter()
        .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
}

/// Builds the startdir dependency graph by running `af-deps` inside
/// `container`. An `ignore-deps` list of `(a, b)` pairs suppresses edges
/// between specific node pairs in both directions.
pub fn generate_graph(container: &Container, ignore_deps: &[IgnorePair]) -> Result<Digraph<String>> {
    let argv = vec!["/af/libexec/af-deps".to_string()];
    let (status, stdout) = container
        .run_captured(&argv, RunOptions::unprivileged())
        .context(ContainerSnafu)?;
    if status != 0 {
        return HelperFailedSnafu { status }.fail();
    }

    parse_records(&stdout, ignore_deps)
}

/// Parses the raw `o <name> <startdir>` / `d <startdir> <name>` record
/// stream into a graph, independent of how it was obtained (used directly
/// by tests and by callers that already have the helper's stdout).
pub fn parse_records(stdout: &str, ignore_deps: &[IgnorePair]) -> Result<Digraph<String>> {
    let mut graph = Digraph::new();
    let mut origins: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut deps: Vec<(String, String)> = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, char::is_whitespace).collect();
        if fields.len() != 3 {
            return InvalidLineSnafu { line: line.to_string() }.fail();
        }

        match fields[0] {
            "o" => {
                let name = fields[1].to_string();
                let startdir = fields[2].to_string();
                graph.add_node(startdir.clone());
                origins.insert(name, startdir);
            }
            "d" => {
                let startdir = fields[1].to_string();
                let name = fields[2].to_string();
                graph.add_node(startdir.clone());
                deps.push((startdir, name));
            }
            _ => return InvalidLineSnafu { line: line.to_string() }.fail(),
        }
    }

    for (rdep, name) in deps {
        let Some(dep) = origins.get(&name) else {
            log::warn!("unknown dependency: {name}");
            continue;
        };
        if *dep == rdep {
            continue;
        }
        if ignored(ignore_deps, dep, &rdep) {
            continue;
        }
        graph.add_edge(dep.clone(), rdep);
    }

    Ok(graph)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_edges_from_origin_and_dependency_records() {
        let stdout = "o pkgconfig main/pkgconf\no libfoo main/libfoo\nd main/libfoo pkgconfig\n";
        let graph = parse_records(stdout, &[]).unwrap();
        assert_eq!(graph.downstream(&"main/pkgconf".to_string()).unwrap(), vec!["main/libfoo".to_string()]);
    }

    #[test]
    fn unknown_dependency_name_is_a_warning_not_a_failure() {
        let stdout = "o pkgconfig main/pkgconf\nd main/libfoo nonexistent\n";
        let graph = parse_records(stdout, &[]).unwrap();
        assert!(graph.contains_node(&"main/libfoo".to_string()));
    }

    #[test]
    fn ignore_deps_suppresses_edges_in_both_directions() {
        let stdout = "o pkgconfig main/pkgconf\nd main/libfoo pkgconfig\n";
        let ignore = vec![("main/libfoo".to_string(), "main/pkgconf".to_string())];
        let graph = parse_records(stdout, &ignore).unwrap();
        assert!(graph.downstream(&"main/pkgconf".to_string()).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_fatal() {
        let stdout = "bogus\n";
        assert!(parse_records(stdout, &[]).is_err());
    }
}
