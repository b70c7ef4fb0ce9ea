//! Freshness-bounded cache in front of a resident Python training/prediction runtime.

use std::sync::Arc;

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod operation;
pub mod runtime;
pub mod service;
pub mod store;

use clock::{Clock, SystemClock};
use config::{Config, Settings};
use coordinator::CacheCoordinator;
use runtime::{python::PythonLauncher, RuntimeBridge, RuntimeLauncher};
use service::Service;
use store::ResultStore;

pub use error::{Error, ErrorBody, Result};
pub use operation::Operation;

/// Fully wired service plus the bridge it must shut down.
#[derive(Debug, Clone)]
pub struct App {
    pub service: Service,
    pub bridge: Arc<RuntimeBridge>,
}

impl App {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let settings = cfg.settings()?;
        let launcher = Arc::new(PythonLauncher::new(&settings.runtime));
        Ok(Self::assemble(cfg, &settings, launcher, Arc::new(SystemClock)))
    }

    pub fn assemble(
        cfg: &Config,
        settings: &Settings,
        launcher: Arc<dyn RuntimeLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bridge = Arc::new(RuntimeBridge::new(&settings.runtime, &cfg.config_path, launcher));
        let store = ResultStore::new(&settings.store_root, settings.ttl, clock);
        let coordinator = Arc::new(CacheCoordinator::new(
            store,
            bridge.clone(),
            settings.compute_input.clone(),
        ));
        Self {
            service: Service::new(coordinator, &cfg.config_path),
            bridge,
        }
    }

    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
    }
}
