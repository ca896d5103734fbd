use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::errors::{DriftError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "drift";

pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| DriftError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn default_settings_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| DriftError::Config("cannot determine config directory".into()))?;
    Ok(dirs.config_dir().join("settings.json"))
}

/// Locations under a data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Server-side change-set records.
    pub fn change_sets_dir(&self) -> PathBuf {
        self.root.join("changesets")
    }

    /// Server-side file content blobs.
    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    /// Agent-side acknowledged snapshots.
    pub fn agent_state_dir(&self) -> PathBuf {
        self.root.join("agent")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("journal").join("ingest.log")
    }
}
