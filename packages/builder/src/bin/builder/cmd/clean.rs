//! Removes all cached state for the workspace.

use clap::Args;
use color_eyre::Result;
use humansize::{DECIMAL, format_size};
use tracing::{info, instrument};

use builder::{config::{CacheConfig, CacheLayout}, fs};

use crate::cmd;

/// Options for `clean`.
#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Report what would be removed without removing it
    #[arg(long)]
    dry_run: bool,
}

#[instrument]
pub async fn exec(options: Options) -> Result<i32> {
    let workspace = cmd::workspace_root()?;
    let layout = CacheLayout::new(&CacheConfig::from_env(), &workspace);

    let mut bytes = 0u64;
    let mut files = 0u64;
    if fs::exists(&layout.root).await {
        for entry in walkdir::WalkDir::new(&layout.root) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file() {
                files += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }

    if options.dry_run {
        info!(
            files,
            size = format_size(bytes, DECIMAL),
            root = ?layout.root,
            "would remove",
        );
        return Ok(0);
    }

    fs::remove_dir_all_idempotent(&layout.root).await?;
    info!(
        files,
        reclaimed = format_size(bytes, DECIMAL),
        "cache cleaned",
    );
    Ok(0)
}
