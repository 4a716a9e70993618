use anyhow::Result;
use declarative::{Configuration, DependencyGraph, EdgeKind, RunStatus};
use std::fmt::Write;

use crate::Context;

/// Print the dependency graph in DOT format.
///
/// Nodes are labelled `type.name`; `depends_on` edges are dashed.
pub fn run(ctx: &Context) -> Result<RunStatus> {
    let (_, config) = super::load_config(ctx)?;
    let providers = super::offline_providers(ctx)?;
    let graph = declarative::validate(&config, &providers)?;
    print!("{}", render(&config, &graph));
    Ok(RunStatus::NoChanges)
}

fn render(config: &Configuration, graph: &DependencyGraph) -> String {
    let mut out = String::from("digraph {\n    rankdir = \"BT\";\n    node [shape = box];\n");
    for name in graph.order() {
        let resource_type = config.find(name).map_or("", |spec| spec.resource_type.as_str());
        let _ = writeln!(out, "    \"{name}\" [label = \"{resource_type}.{name}\"];");
    }
    for (from, to, kind) in graph.edges() {
        let style = match kind {
            EdgeKind::Reference => "",
            EdgeKind::Explicit => " [style = dashed]",
        };
        let _ = writeln!(out, "    \"{from}\" -> \"{to}\"{style};");
    }
    out.push_str("}\n");
    out
}
