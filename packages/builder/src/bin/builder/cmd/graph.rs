//! Renders the dependency graph.

use clap::Args;
use color_eyre::Result;
use itertools::Itertools;

use builder::manifest::Manifest;

use crate::cmd;

/// Options for `graph`.
#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Restrict to this target and its dependencies
    target: Option<String>,

    /// Print the critical path instead of the full graph
    #[arg(long)]
    critical_path: bool,

    /// Emit machine-readable JSON
    #[arg(long)]
    json: bool,
}

pub async fn exec(options: Options) -> Result<i32> {
    let workspace = cmd::workspace_root()?;
    let manifest = Manifest::load(&workspace).await?;

    let root = options
        .target
        .as_deref()
        .map(|reference| manifest.resolve(reference))
        .transpose()?;

    let graph = manifest.into_graph()?;
    let graph = match &root {
        Some(root) => cmd::subgraph(&graph, root)?,
        None => graph,
    };

    if options.critical_path {
        let path = graph.critical_path(root.as_ref());
        println!("{}", path.iter().map(ToString::to_string).join(" -> "));
        return Ok(0);
    }

    if options.json {
        let targets: Vec<_> = graph
            .sorted_ids()
            .into_iter()
            .map(|id| {
                let node = graph.node(&id).expect("listed id");
                serde_json::json!({
                    "id": id.to_string(),
                    "kind": node.target().kind,
                    "language": node.target().language,
                    "deps": node.deps().iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "depth": graph.depth(&id),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&targets)?);
        return Ok(0);
    }

    print!("{}", graph.print());
    Ok(0)
}
