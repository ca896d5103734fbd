//! Drift definitions and path filtering.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{DriftError, Result};

/// How detected drift for a definition is treated downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlingMode {
    #[default]
    Normal,
    /// Changes are expected (e.g. a deployment window) and are not alertable.
    PlannedChanges,
}

/// A named filesystem location under drift monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub base_dir: PathBuf,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub handling_mode: HandlingMode,
    /// Overrides the service-wide scan interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Definition {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            includes: vec![],
            excludes: vec![],
            handling_mode: HandlingMode::Normal,
            interval_secs: None,
            enabled: true,
        }
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    pub fn with_handling_mode(mut self, mode: HandlingMode) -> Self {
        self.handling_mode = mode;
        self
    }

    /// Base directory as written into change-set headers.
    pub fn base_dir_string(&self) -> String {
        self.base_dir.to_string_lossy().replace('\\', "/")
    }

    pub fn filter(&self) -> Result<PathFilter> {
        PathFilter::new(&self.includes, &self.excludes)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if !self.base_dir.is_absolute() {
            return Err(DriftError::Config(format!(
                "base directory for {} must be absolute: {}",
                self.name,
                self.base_dir.display()
            )));
        }
        if self.base_dir_string().contains(['\n', '\r']) {
            return Err(DriftError::Config(format!(
                "base directory for {} contains a line break",
                self.name
            )));
        }
        if self.interval_secs == Some(0) {
            return Err(DriftError::Config(format!(
                "interval for {} must be at least one second",
                self.name
            )));
        }
        self.filter().map(|_| ())
    }

    /// Identity that must not change once change-sets exist.
    pub fn same_identity(&self, other: &Definition) -> bool {
        self.name == other.name && self.base_dir == other.base_dir
    }
}

/// Definition names become directory names in the change-set store, so they
/// are limited to ASCII letters, digits, `-`, `_` and `.`, and must not start
/// with a dot.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DriftError::Config("definition name must not be empty".into()));
    }
    let allowed = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !allowed || name.starts_with('.') {
        return Err(DriftError::Config(format!(
            "definition name {name:?} may only use letters, digits, '-', '_' and '.', and must not start with '.'"
        )));
    }
    Ok(())
}

/// Compiled include/exclude globs, matched against `/`-separated paths
/// relative to the base directory.
///
/// A pattern that matches a directory also covers everything beneath it.
/// Exclusion always wins.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PathFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Whether a relative file path belongs in the snapshot.
    pub fn matches(&self, relative: &str) -> bool {
        if self.is_excluded(relative) {
            return false;
        }
        self.includes.is_empty() || any_prefix_matches(&self.includes, relative)
    }

    /// Whether a relative path (file or directory) is excluded outright, so
    /// walkers can prune whole subtrees.
    pub fn is_excluded(&self, relative: &str) -> bool {
        any_prefix_matches(&self.excludes, relative)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            let trimmed = p.trim_start_matches("./").trim_end_matches('/');
            Pattern::new(trimmed)
                .map_err(|e| DriftError::Config(format!("invalid pattern {p:?}: {e}")))
        })
        .collect()
}

fn any_prefix_matches(patterns: &[Pattern], relative: &str) -> bool {
    if patterns.is_empty() {
        return false;
    }
    // "a/b/c" is tested as "a", "a/b", "a/b/c".
    let mut end = 0;
    loop {
        let next = relative[end..].find('/').map(|i| end + i);
        let prefix = match next {
            Some(i) => &relative[..i],
            None => relative,
        };
        if patterns.iter().any(|p| p.matches_with(prefix, MATCH_OPTIONS)) {
            return true;
        }
        match next {
            Some(i) => end = i + 1,
            None => return false,
        }
    }
}
