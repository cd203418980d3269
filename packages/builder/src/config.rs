//! Engine configuration.
//!
//! Environment variables are read exactly once at startup into a
//! [`CacheConfig`] snapshot; nothing else in the engine touches the
//! environment.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{instrument, warn};

/// Directory under the workspace root holding all persisted engine state.
pub const CACHE_DIR_NAME: &str = ".builder-cache";

/// Bounds and locations for the persistent caches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum total size of the build cache, in bytes.
    pub max_size: u64,
    /// Maximum number of build cache entries.
    pub max_entries: usize,
    /// Entries older than this many days are pruned on flush.
    pub max_age_days: u32,
    /// Override for the cache directory; defaults to
    /// `<workspace>/.builder-cache`.
    pub dir_override: Option<PathBuf>,
    /// How long failed action records are kept.
    pub failure_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 2 * 1024 * 1024 * 1024,
            max_entries: 100_000,
            max_age_days: 30,
            dir_override: None,
            failure_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    /// Snapshot configuration from the environment.
    ///
    /// Recognized variables: `BUILDER_CACHE_MAX_SIZE` (bytes),
    /// `BUILDER_CACHE_MAX_ENTRIES`, `BUILDER_CACHE_MAX_AGE_DAYS`,
    /// `BUILDER_CACHE_DIR`. Unparseable values fall back to defaults with a
    /// warning.
    #[instrument(name = "CacheConfig::from_env")]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = parse_env("BUILDER_CACHE_MAX_SIZE") {
            config.max_size = value;
        }
        if let Some(value) = parse_env("BUILDER_CACHE_MAX_ENTRIES") {
            config.max_entries = value;
        }
        if let Some(value) = parse_env("BUILDER_CACHE_MAX_AGE_DAYS") {
            config.max_age_days = value;
        }
        if let Ok(dir) = std::env::var("BUILDER_CACHE_DIR") {
            config.dir_override = Some(PathBuf::from(dir));
        }
        config
    }

    /// The cache directory for the given workspace root.
    pub fn cache_dir(&self, workspace: &Path) -> PathBuf {
        self.dir_override
            .clone()
            .unwrap_or_else(|| workspace.join(CACHE_DIR_NAME))
    }
}

/// Well-known file locations inside the cache directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheLayout {
    pub root: PathBuf,
}

impl CacheLayout {
    pub fn new(config: &CacheConfig, workspace: &Path) -> Self {
        Self {
            root: config.cache_dir(workspace),
        }
    }

    pub fn build_cache(&self) -> PathBuf {
        self.root.join("cache.bin")
    }

    pub fn action_cache(&self) -> PathBuf {
        self.root.join("actions.bin")
    }

    pub fn dep_cache(&self) -> PathBuf {
        self.root.join("deps.bin")
    }

    pub fn graph_cache(&self) -> PathBuf {
        self.root.join("graph.bin")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.root.join("checkpoint.bin")
    }

    pub fn cas(&self) -> PathBuf {
        self.root.join("cas")
    }

    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%name, %raw, "unparseable value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layout_places_files_under_cache_dir() {
        let config = CacheConfig::default();
        let layout = CacheLayout::new(&config, Path::new("/repo"));
        assert_eq!(layout.root, Path::new("/repo/.builder-cache"));
        assert_eq!(layout.build_cache(), Path::new("/repo/.builder-cache/cache.bin"));
        assert_eq!(layout.checkpoint(), Path::new("/repo/.builder-cache/checkpoint.bin"));
    }

    #[test]
    fn dir_override_wins() {
        let config = CacheConfig {
            dir_override: Some(PathBuf::from("/elsewhere")),
            ..CacheConfig::default()
        };
        assert_eq!(config.cache_dir(Path::new("/repo")), Path::new("/elsewhere"));
    }
}
