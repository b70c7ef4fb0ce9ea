//! Training tunables that can be changed while the service is running.

use std::{fs, io::Write, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSettings {
    pub random_state: i64,
    pub estimators: i64,
}

impl TrainingSettings {
    pub fn new(random_state: i64, estimators: i64) -> Result<Self> {
        if estimators < 1 {
            return Err(Error::Configuration(format!(
                "estimators must be at least 1, got {estimators}"
            )));
        }
        Ok(Self { random_state, estimators })
    }

    /// Persisted values win over the `TRAINING_*` defaults.
    pub fn load(cfg: &Config) -> Result<Self> {
        let path = cfg.training_settings_path()?;
        if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| {
                Error::Configuration(format!("reading {}: {e}", path.display()))
            })?;
            let stored: TrainingSettings = serde_json::from_str(&text).map_err(|e| {
                Error::Configuration(format!("parsing {}: {e}", path.display()))
            })?;
            return Self::new(stored.random_state, stored.estimators);
        }
        Self::new(
            cfg.get_i64("TRAINING_RANDOM_STATE")?,
            cfg.get_i64("TRAINING_ESTIMATORS")?,
        )
    }

    pub fn save(&self, cfg: &Config) -> Result<()> {
        let path = cfg.training_settings_path()?;
        write_atomically(&path, &serde_json::to_string_pretty(self).unwrap_or_default())
            .map_err(|e| Error::Configuration(format!("writing {}: {e}", path.display())))?;
        debug!(
            random_state = self.random_state,
            estimators = self.estimators,
            path = %path.display(),
            "training settings saved"
        );
        Ok(())
    }
}

fn write_atomically(path: &Path, body: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
