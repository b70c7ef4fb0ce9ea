//! Resident external runtime: started once, configured before every call.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    config::{read_kv_file, Config, InvocationSettings, RuntimeSettings, TrainingSettings},
    error::{Error, Result},
    operation::Operation,
};

pub mod python;
pub mod staging;

pub use staging::ModuleStager;

/// Capabilities of the object living inside the external runtime.
///
/// An empty string from `train_with`/`predict_with` is the runtime's own
/// failure signal; the bridge turns it into an error.
#[async_trait]
pub trait ExternalComputation: Send {
    async fn configure(&mut self, config_file: &Path, work_dir: &Path) -> anyhow::Result<()>;

    async fn train_with(
        &mut self,
        payload: &str,
        random_state: i64,
        estimators: i64,
    ) -> anyhow::Result<String>;

    async fn predict_with(&mut self, payload: &str) -> anyhow::Result<String>;

    /// False once the channel to the runtime is unusable (process gone,
    /// pipe broken, reply stream out of step). The bridge then drops the
    /// handle and launches a new one on the next call.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Called when the handle is dropped: at process shutdown or after it turned unhealthy.
    async fn shutdown(&mut self) {}
}

/// What a launcher needs to bring the runtime up.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// The only extra module-search entry handed to the interpreter.
    pub staging_dir: PathBuf,
    /// Interpreter settings, applied to the interpreter's environment.
    pub env: HashMap<String, String>,
}

#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn ExternalComputation>>;
}

type Resident = Option<Box<dyn ExternalComputation>>;

pub struct RuntimeBridge {
    stager: ModuleStager,
    env_file: Option<PathBuf>,
    config_path: PathBuf,
    launcher: Arc<dyn RuntimeLauncher>,
    /// Start guard and call serializer in one: whoever holds it either
    /// starts the runtime or talks to the running one.
    runtime: Mutex<Resident>,
    started: AtomicBool,
}

impl std::fmt::Debug for RuntimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBridge")
            .field("stager", &self.stager)
            .field("config_path", &self.config_path)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl RuntimeBridge {
    /// `config_path` is re-read on every invocation for the per-call settings.
    pub fn new(
        settings: &RuntimeSettings,
        config_path: impl Into<PathBuf>,
        launcher: Arc<dyn RuntimeLauncher>,
    ) -> Self {
        Self {
            stager: ModuleStager::new(settings),
            env_file: settings.env_file.clone(),
            config_path: config_path.into(),
            launcher,
            runtime: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn staged_path(&self) -> Option<PathBuf> {
        self.stager.staged_path()
    }

    /// Idempotent. Concurrent callers wait for the single start in progress;
    /// a failed start leaves the bridge unstarted so a later call retries.
    pub async fn ensure_started(&self) -> Result<()> {
        let mut slot = self.runtime.lock().await;
        self.resident(&mut slot).await?;
        Ok(())
    }

    async fn resident<'a>(
        &self,
        slot: &'a mut Resident,
    ) -> Result<&'a mut Box<dyn ExternalComputation>> {
        if slot.is_none() {
            *slot = Some(self.start().await?);
            self.started.store(true, Ordering::SeqCst);
        }
        slot.as_mut()
            .ok_or_else(|| Error::RuntimeStart("external runtime is not running".into()))
    }

    async fn start(&self) -> Result<Box<dyn ExternalComputation>> {
        info!("starting external runtime");
        let env = self.interpreter_env()?;
        let staging_dir = self.stager.ensure_staged()?;
        let spec = LaunchSpec { staging_dir, env };
        let computation = self.launcher.launch(&spec).await.map_err(|e| {
            let detail = format!("{e:#}");
            error!(error = %detail, "external runtime failed to start");
            Error::RuntimeStart(detail)
        })?;
        info!(staging = %spec.staging_dir.display(), "external runtime started");
        Ok(computation)
    }

    fn interpreter_env(&self) -> Result<HashMap<String, String>> {
        let Some(path) = self.env_file.as_deref() else {
            return Ok(HashMap::new());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no interpreter settings file");
            return Ok(HashMap::new());
        }
        let env = read_kv_file(path).map_err(|e| Error::RuntimeStart(format!("{e:#}")))?;
        for (k, v) in &env {
            debug!(key = %k, value = %v, "interpreter setting");
        }
        Ok(env)
    }

    pub async fn invoke(&self, operation: Operation, payload: &str) -> Result<String> {
        self.invoke_with(operation, payload, None).await
    }

    /// `training` overrides the persisted training tunables for this call only.
    pub async fn invoke_with(
        &self,
        operation: Operation,
        payload: &str,
        training: Option<TrainingSettings>,
    ) -> Result<String> {
        let mut slot = self.runtime.lock().await;
        let computation = self.resident(&mut slot).await?;
        let settings = Config::load_from(&self.config_path).invocation_settings()?;

        let outcome = dispatch(&mut **computation, operation, payload, &settings, training).await;
        if outcome.is_err() && !computation.is_healthy() {
            warn!("external runtime connection lost, relaunching on the next call");
            if let Some(mut lost) = slot.take() {
                lost.shutdown().await;
            }
            self.started.store(false, Ordering::SeqCst);
        }
        outcome
    }

    /// Stops the runtime and removes the staging area. Never fails.
    pub async fn shutdown(&self) {
        if let Some(mut computation) = self.runtime.lock().await.take() {
            computation.shutdown().await;
            self.started.store(false, Ordering::SeqCst);
            info!("external runtime stopped");
        }
        self.stager.cleanup();
    }
}

async fn dispatch(
    computation: &mut dyn ExternalComputation,
    operation: Operation,
    payload: &str,
    settings: &InvocationSettings,
    training: Option<TrainingSettings>,
) -> Result<String> {
    let training = training.unwrap_or(settings.training);
    debug!(
        config_file = %settings.config_file.display(),
        work_dir = %settings.work_dir.display(),
        "configuring runtime module"
    );
    computation
        .configure(&settings.config_file, &settings.work_dir)
        .await
        .map_err(|e| invocation_failed(operation, format!("configure failed: {e:#}")))?;

    let output = match operation {
        Operation::Training => {
            debug!(
                random_state = training.random_state,
                estimators = training.estimators,
                "executing training"
            );
            computation
                .train_with(payload, training.random_state, training.estimators)
                .await
        }
        Operation::Prediction => {
            debug!("executing prediction");
            computation.predict_with(payload).await
        }
    }
    .map_err(|e| invocation_failed(operation, format!("{e:#}")))?;

    if output.trim().is_empty() {
        return Err(invocation_failed(operation, "the runtime module returned no output"));
    }
    Ok(output)
}

fn invocation_failed(operation: Operation, detail: impl Into<String>) -> Error {
    let err = Error::external(operation, detail);
    warn!(operation = %operation, error = %err, "runtime module call failed");
    err
}
