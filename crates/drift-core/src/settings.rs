use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::definition::Definition;
use crate::errors::{DriftError, Result};
use crate::hasher::{ContentHasher, HashAlgorithm};
use crate::paths;

pub const MAX_WORKERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before each retry; the last value repeats.
    pub backoff_ms: Vec<u64>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_ms: vec![100, 500, 2000],
        }
    }
}

impl TransportSettings {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let ms = self
            .backoff_ms
            .get(retry as usize)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub definitions: Vec<Definition>,
}

fn default_workers() -> usize {
    4
}

fn default_scan_interval() -> u64 {
    300
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            workers: default_workers(),
            scan_interval_secs: default_scan_interval(),
            hash_algorithm: HashAlgorithm::default(),
            transport: TransportSettings::default(),
            definitions: vec![],
        }
    }
}

impl ServiceSettings {
    /// Load and validate a JSON settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| DriftError::io(path, e))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DriftError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| DriftError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(DriftError::Config(format!(
                "workers must be between 1 and {MAX_WORKERS}"
            )));
        }
        if self.scan_interval_secs == 0 {
            return Err(DriftError::Config(
                "scan interval must be at least one second".into(),
            ));
        }
        if self.transport.max_attempts == 0 {
            return Err(DriftError::Config(
                "transport max_attempts must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for def in &self.definitions {
            def.validate()?;
            if !seen.insert(def.name.as_str()) {
                return Err(DriftError::Config(format!(
                    "definition {} is declared twice",
                    def.name
                )));
            }
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_data_dir(),
        }
    }

    pub fn hasher(&self) -> ContentHasher {
        ContentHasher::new(self.hash_algorithm)
    }

    pub fn definition(&self, name: &str) -> Option<&Definition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn interval_for(&self, definition: &Definition) -> Duration {
        Duration::from_secs(definition.interval_secs.unwrap_or(self.scan_interval_secs))
    }
}
