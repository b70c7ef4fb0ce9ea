//! Private, flat copy of the interpreter's resource modules.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::{
    config::RuntimeSettings,
    error::{Error, Result},
};

/// Creates the staging area once per process and removes it on `cleanup` or drop.
#[derive(Debug)]
pub struct ModuleStager {
    modules_root: PathBuf,
    modules: Vec<String>,
    prefix: String,
    staging_root: Option<PathBuf>,
    area: Mutex<Option<TempDir>>,
}

impl ModuleStager {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            modules_root: settings.modules_root.clone(),
            modules: settings.modules.clone(),
            prefix: settings.staging_prefix.clone(),
            staging_root: settings.staging_root.clone(),
            area: Mutex::new(None),
        }
    }

    /// Path of the staging area, creating and filling it on first use.
    ///
    /// A module that fails to copy is logged and skipped; the rest are still
    /// staged. Only failing to create the directory itself is an error.
    pub fn ensure_staged(&self) -> Result<PathBuf> {
        let mut area = self
            .area
            .lock()
            .map_err(|_| Error::RuntimeStart("staging lock poisoned".into()))?;
        if let Some(dir) = area.as_ref() {
            return Ok(dir.path().to_path_buf());
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix(&self.prefix);
        let dir = match &self.staging_root {
            Some(root) => fs::create_dir_all(root).and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        }
        .map_err(|e| Error::RuntimeStart(format!("creating staging directory: {e}")))?;
        debug!(path = %dir.path().display(), "created staging directory");

        let mut copied = 0usize;
        for module in &self.modules {
            match self.stage_one(module, dir.path()) {
                Ok(target) => {
                    copied += 1;
                    debug!(module = %module, target = %target.display(), "staged module");
                }
                Err(e) => error!(module = %module, error = %e, "failed to stage module"),
            }
        }
        debug!(copied, requested = self.modules.len(), "module staging finished");

        let path = dir.path().to_path_buf();
        *area = Some(dir);
        Ok(path)
    }

    fn stage_one(&self, module: &str, into: &Path) -> anyhow::Result<PathBuf> {
        let name = flat_name(module)
            .ok_or_else(|| anyhow::anyhow!("module path has no file name: {module}"))?;
        let target = into.join(name);
        fs::copy(self.modules_root.join(module), &target)?;
        Ok(target)
    }

    pub fn staged_path(&self) -> Option<PathBuf> {
        self.area
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|d| d.path().to_path_buf()))
    }

    /// Best-effort recursive removal. Failures are logged, never returned.
    pub fn cleanup(&self) {
        let taken = match self.area.lock() {
            Ok(mut area) => area.take(),
            Err(_) => None,
        };
        if let Some(dir) = taken {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(path = %path.display(), "staging directory removed"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove staging directory"),
            }
        }
    }
}

/// Drops any logical sub-path so every module lands in one flat root.
fn flat_name(module: &str) -> Option<&str> {
    Path::new(module).file_name().and_then(|n| n.to_str())
}
