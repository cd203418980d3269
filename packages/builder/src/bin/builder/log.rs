use clap::ValueEnum;
use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    Layer as _, fmt::MakeWriter, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Render mode for the event stream. Formatting only; never semantics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Default)]
pub enum RenderMode {
    #[default]
    Auto,
    Interactive,
    Plain,
    Verbose,
    Quiet,
}

impl RenderMode {
    fn default_filter(self) -> &'static str {
        match self {
            Self::Verbose => "debug",
            Self::Quiet => "error",
            _ => "info",
        }
    }

    fn ansi(self) -> bool {
        match self {
            Self::Plain => false,
            Self::Interactive => true,
            _ => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}

/// Install the global subscriber.
///
/// The `BUILDER_LOG` environment variable overrides the mode's default
/// filter using the usual `tracing` directive syntax.
pub fn init<W>(writer: W, mode: RenderMode) -> Result<()>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("BUILDER_LOG")
        .with_default_directive(mode.default_filter().parse()?)
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(mode == RenderMode::Verbose)
                .with_file(mode == RenderMode::Verbose)
                .with_line_number(mode == RenderMode::Verbose)
                .with_writer(writer)
                .with_ansi(mode.ansi())
                .with_filter(filter),
        )
        .init();
    Ok(())
}
