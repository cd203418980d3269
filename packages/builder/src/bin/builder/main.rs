//! The binary entrypoint for `builder`, the monorepo build engine.

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use tracing::error;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code.
mod cmd;
mod log;

use builder::error::{BuildError, ErrorKind};

/// Exit code for a failed build.
const EXIT_BUILD_FAILURE: i32 = 1;
/// Exit code for a critical internal error (broken invariant).
const EXIT_INTERNAL: i32 = 139;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "builder",
    about = "Incremental, cached, distributed monorepo builds",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Render mode for the event stream (formatting only)
    #[arg(long, value_enum, default_value_t = log::RenderMode::Auto, global = true)]
    mode: log::RenderMode,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Build a target and everything it depends on (default: everything)
    Build(cmd::build::Options),

    /// Remove all cached state for this workspace
    Clean(cmd::clean::Options),

    /// Show the dependency graph
    Graph(cmd::graph::Options),

    /// Resume an interrupted build from its checkpoint
    Resume(cmd::resume::Options),

    /// Query the graph: `deps(<target>)`, `rdeps(<target>)`, or a target
    Query(cmd::query::Options),
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            match BuildError::from_report(&err).map(BuildError::kind) {
                Some(ErrorKind::InitFailed | ErrorKind::NotImplemented | ErrorKind::NotSupported) => {
                    EXIT_INTERNAL
                }
                _ => EXIT_BUILD_FAILURE,
            }
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();
    log::init(std::io::stderr, top.mode)?;

    match top.command {
        Command::Build(opts) => cmd::build::exec(opts).await,
        Command::Clean(opts) => cmd::clean::exec(opts).await,
        Command::Graph(opts) => cmd::graph::exec(opts).await,
        Command::Resume(opts) => cmd::resume::exec(opts).await,
        Command::Query(opts) => cmd::query::exec(opts).await,
    }
}
