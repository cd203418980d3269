//! Graph queries: `deps(<target>)`, `rdeps(<target>)`, or a bare target.

use clap::Args;
use color_eyre::Result;
use itertools::Itertools;

use builder::{manifest::Manifest, target::TargetId};

use crate::cmd;

/// Options for `query`.
#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The query expression
    expr: String,
}

pub async fn exec(options: Options) -> Result<i32> {
    let workspace = cmd::workspace_root()?;
    let manifest = Manifest::load(&workspace).await?;

    enum Query {
        Deps(TargetId),
        Rdeps(TargetId),
        Exists(TargetId),
    }

    let query = if let Some(inner) = strip_call(&options.expr, "deps") {
        Query::Deps(manifest.resolve(inner)?)
    } else if let Some(inner) = strip_call(&options.expr, "rdeps") {
        Query::Rdeps(manifest.resolve(inner)?)
    } else {
        Query::Exists(manifest.resolve(&options.expr)?)
    };

    let graph = manifest.into_graph()?;
    match query {
        Query::Deps(id) => {
            let node = graph.must_node(&id)?;
            // Transitive, deterministic ordering.
            let mut deps = std::collections::BTreeSet::new();
            let mut stack: Vec<TargetId> = node.deps().to_vec();
            while let Some(dep) = stack.pop() {
                if deps.insert(dep.clone()) {
                    stack.extend(graph.must_node(&dep)?.deps().iter().cloned());
                }
            }
            println!("{}", deps.iter().map(ToString::to_string).join("\n"));
        }
        Query::Rdeps(id) => {
            graph.must_node(&id)?;
            let rdeps: std::collections::BTreeSet<TargetId> =
                graph.transitive_dependents(&id).into_iter().collect();
            println!("{}", rdeps.iter().map(ToString::to_string).join("\n"));
        }
        Query::Exists(id) => {
            let node = graph.must_node(&id)?;
            println!("{} ({} {})", id, node.target().language, node.target().kind);
        }
    }
    Ok(0)
}

fn strip_call<'a>(expr: &'a str, function: &str) -> Option<&'a str> {
    expr.strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
}
