//! Freshness-checked access to the cached artifacts.
//!
//! Each operation has its own lock held across the freshness check, the
//! external call and the store write, so concurrent callers for the same
//! operation collapse into one computation while Training and Prediction
//! still proceed independently.

use std::{sync::Arc, time::SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    config::{Config, TrainingSettings},
    error::Result,
    operation::Operation,
    runtime::RuntimeBridge,
    store::ResultStore,
};

#[derive(Debug, Default)]
struct FlightLocks {
    training: Mutex<()>,
    prediction: Mutex<()>,
}

impl FlightLocks {
    fn get(&self, op: Operation) -> &Mutex<()> {
        match op {
            Operation::Training => &self.training,
            Operation::Prediction => &self.prediction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub operation: Operation,
    pub stored: bool,
    /// Seconds since the Unix epoch.
    pub created_at: Option<u64>,
    pub age_secs: Option<u64>,
    pub fresh: bool,
}

#[derive(Debug)]
pub struct CacheCoordinator {
    store: ResultStore,
    bridge: Arc<RuntimeBridge>,
    locks: FlightLocks,
    /// Payload handed to the runtime when a refresh is driven by the cache.
    compute_input: String,
}

impl CacheCoordinator {
    pub fn new(store: ResultStore, bridge: Arc<RuntimeBridge>, compute_input: impl Into<String>) -> Self {
        Self {
            store,
            bridge,
            locks: FlightLocks::default(),
            compute_input: compute_input.into(),
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn bridge(&self) -> &Arc<RuntimeBridge> {
        &self.bridge
    }

    /// Fresh stored payload, or a new one computed, stored and returned.
    pub async fn get_or_compute(&self, op: Operation) -> Result<String> {
        let _flight = self.locks.get(op).lock().await;

        if !self.store.has_entry(op) {
            info!(operation = %op, "no stored result, computing");
            return self.compute_and_store(op, &self.compute_input, None).await;
        }

        match self.store.created_at(op) {
            Some(created) if !self.store.is_expired(created) => {
                debug!(operation = %op, "serving stored result");
                self.store.read(op)
            }
            Some(_) => {
                info!(operation = %op, "stored result expired, recomputing");
                self.store.invalidate(op);
                self.compute_and_store(op, &self.compute_input, None).await
            }
            None => {
                info!(operation = %op, "stored result has no readable stamp, recomputing");
                self.compute_and_store(op, &self.compute_input, None).await
            }
        }
    }

    /// Runs the computation on `payload` regardless of freshness and stores the result.
    pub async fn submit(&self, op: Operation, payload: &str) -> Result<String> {
        let _flight = self.locks.get(op).lock().await;
        info!(operation = %op, bytes = payload.len(), "computing submitted dataset");
        self.compute_and_store(op, payload, None).await
    }

    /// Persists the training tunables, then trains on `payload` with them.
    pub async fn submit_training_with(
        &self,
        config: &Config,
        training: TrainingSettings,
        payload: &str,
    ) -> Result<String> {
        training.save(config)?;
        let _flight = self.locks.get(Operation::Training).lock().await;
        self.compute_and_store(Operation::Training, payload, Some(training)).await
    }

    async fn compute_and_store(
        &self,
        op: Operation,
        payload: &str,
        training: Option<TrainingSettings>,
    ) -> Result<String> {
        let output = self.bridge.invoke_with(op, payload, training).await?;
        self.store.write(op, &output)?;
        Ok(output)
    }

    pub fn entry_info(&self, op: Operation) -> EntryInfo {
        let stored = self.store.has_entry(op);
        let created = if stored { self.store.created_at(op) } else { None };
        let now = self.store.now();
        EntryInfo {
            operation: op,
            stored,
            created_at: created.and_then(epoch_secs),
            age_secs: created.and_then(|t| now.duration_since(t).ok()).map(|d| d.as_secs()),
            fresh: created.is_some_and(|t| !self.store.is_expired(t)),
        }
    }
}

fn epoch_secs(t: SystemTime) -> Option<u64> {
    t.duration_since(SystemTime::UNIX_EPOCH).ok().map(|d| d.as_secs())
}
