//! Target identity and declarations.

use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use color_eyre::{Report, Result, eyre::bail};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

/// Identifies a declared target: `(workspace, path, name)`.
///
/// The canonical rendering is `workspace//path:name`. Parsing accepts three
/// forms:
///
/// - `name`
/// - `//path:name`
/// - `workspace//path:name`
///
/// An empty `name` is rejected. Sort order is lexicographic on
/// `(workspace, path, name)`.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{workspace}//{path}:{name}")]
pub struct TargetId {
    pub workspace: String,
    pub path: String,
    pub name: String,
}

impl TargetId {
    /// Construct an id from its parts.
    pub fn new(
        workspace: impl Into<String>,
        path: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            path: path.into(),
            name: name.into(),
        }
    }

    /// Parse any accepted form. See the type docs for the grammar.
    pub fn parse(raw: &str) -> Result<Self> {
        let (workspace, rest) = match raw.split_once("//") {
            Some((ws, rest)) => (ws, rest),
            None => ("", raw),
        };

        let (path, name) = match rest.split_once(':') {
            Some((path, name)) => (path, name),
            // Bare `name` form: no path separator allowed.
            None if workspace.is_empty() && !rest.contains('/') => ("", rest),
            None => bail!("malformed target id {raw:?}: expected `path:name`"),
        };

        if name.is_empty() {
            bail!("malformed target id {raw:?}: empty target name");
        }

        Ok(Self::new(workspace, path, name))
    }
}

impl FromStr for TargetId {
    type Err = Report;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

/// The kind of work a target declares.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Executable,
    Library,
    Test,
    Custom,
}

impl TargetKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Executable),
            1 => Some(Self::Library),
            2 => Some(Self::Test),
            3 => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Executable => 0,
            Self::Library => 1,
            Self::Test => 2,
            Self::Custom => 3,
        }
    }
}

/// A declared unit of build work.
///
/// Targets are immutable after construction; the graph owns them for the
/// duration of one invocation.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    /// Language tag used to select a handler.
    pub language: String,
    /// Source files (patterns resolved by the caller).
    pub sources: Vec<PathBuf>,
    /// Ids of targets this target depends on.
    pub deps: Vec<TargetId>,
    /// Environment overrides applied to handler invocations.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Hint for where outputs should land.
    #[serde(default)]
    pub output_hint: Option<PathBuf>,
    /// Language-specific configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Target {
    /// A minimal target with no sources or dependencies.
    pub fn new(id: TargetId, kind: TargetKind, language: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            language: language.into(),
            sources: Vec::new(),
            deps: Vec::new(),
            env: BTreeMap::new(),
            output_hint: None,
            config: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("app", TargetId::new("", "", "app"); "bare name")]
    #[test_case("//services/api:server", TargetId::new("", "services/api", "server"); "path and name")]
    #[test_case("mono//lib/core:core", TargetId::new("mono", "lib/core", "core"); "fully qualified")]
    #[test]
    fn parse_accepted_forms(raw: &str, expected: TargetId) {
        pretty_assertions::assert_eq!(TargetId::parse(raw).unwrap(), expected);
    }

    #[test_case("//pkg:"; "empty name")]
    #[test_case(""; "empty input")]
    #[test_case("a/b"; "bare name with slash")]
    #[test]
    fn parse_rejections(raw: &str) {
        assert!(TargetId::parse(raw).is_err());
    }

    #[test]
    fn display_round_trips_for_canonical_ids() {
        let id = TargetId::new("mono", "lib/core", "core");
        assert_eq!(TargetId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn sort_order_is_lexicographic_per_field() {
        let mut ids = vec![
            TargetId::new("b", "a", "a"),
            TargetId::new("a", "z", "z"),
            TargetId::new("a", "z", "a"),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                TargetId::new("a", "z", "a"),
                TargetId::new("a", "z", "z"),
                TargetId::new("b", "a", "a"),
            ],
        );
    }
}
