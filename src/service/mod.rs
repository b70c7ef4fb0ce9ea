//! Transport-neutral request layer: maps coordinator outcomes to responses.

use std::{path::PathBuf, sync::Arc};

use serde_json::json;
use tracing::{debug, error};

use crate::{
    config::{Config, TrainingSettings},
    coordinator::CacheCoordinator,
    error::{Error, Result},
    operation::Operation,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Self { status: 200, body: body.into() }
    }

    pub fn error(err: &Error) -> Self {
        let body = err.to_body().to_json().unwrap_or_else(|e| {
            error!(error = %e, "could not serialize error body");
            err.to_string()
        });
        Self { status: 500, body }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    coordinator: Arc<CacheCoordinator>,
    config_path: PathBuf,
}

impl Service {
    pub fn new(coordinator: Arc<CacheCoordinator>, config_path: impl Into<PathBuf>) -> Self {
        Self { coordinator, config_path: config_path.into() }
    }

    fn config(&self) -> Config {
        Config::load_from(&self.config_path)
    }

    pub async fn training(&self) -> Response {
        debug!("training requested");
        respond(self.coordinator.get_or_compute(Operation::Training).await)
    }

    pub async fn prediction(&self) -> Response {
        debug!("prediction requested");
        respond(self.coordinator.get_or_compute(Operation::Prediction).await)
    }

    pub async fn submit_training(&self, body: &str) -> Response {
        respond(self.coordinator.submit(Operation::Training, body).await)
    }

    pub async fn configure_and_submit_training(
        &self,
        random_state: i64,
        estimators: i64,
        body: &str,
    ) -> Response {
        let result = match TrainingSettings::new(random_state, estimators) {
            Ok(training) => {
                self.coordinator
                    .submit_training_with(&self.config(), training, body)
                    .await
            }
            Err(e) => Err(e),
        };
        respond(result)
    }

    pub async fn submit_prediction(&self, body: &str) -> Response {
        respond(self.coordinator.submit(Operation::Prediction, body).await)
    }

    /// Takes effect on the next training invocation.
    pub fn configure_training(&self, random_state: i64, estimators: i64) -> Response {
        let result = TrainingSettings::new(random_state, estimators)
            .and_then(|t| t.save(&self.config()).map(|_| t));
        match result {
            Ok(t) => Response::ok(
                json!({
                    "result": true,
                    "randomState": t.random_state,
                    "estimators": t.estimators,
                })
                .to_string(),
            ),
            Err(e) => respond(Err(e)),
        }
    }

    pub fn status(&self) -> Response {
        let entries: Vec<_> = Operation::ALL
            .iter()
            .map(|op| self.coordinator.entry_info(*op))
            .collect();
        Response::ok(
            json!({
                "runtimeStarted": self.coordinator.bridge().is_started(),
                "ttlSecs": self.coordinator.store().ttl().as_secs(),
                "entries": entries,
            })
            .to_string(),
        )
    }

    /// One request per line:
    /// `training` | `prediction` | `status` | `configure <randomState> <estimators>` |
    /// `submit <operation> <payload>`.
    pub async fn handle_line(&self, line: &str) -> Response {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match verb.to_ascii_lowercase().as_str() {
            "status" => self.status(),
            "configure" => {
                let mut nums = rest.split_whitespace().map(str::parse::<i64>);
                match (nums.next(), nums.next(), nums.next()) {
                    (Some(Ok(rs)), Some(Ok(est)), None) => self.configure_training(rs, est),
                    _ => bad_request("usage: configure <randomState> <estimators>"),
                }
            }
            "submit" => {
                let rest = rest.trim_start();
                let (op, payload) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                match Operation::parse(op) {
                    Some(Operation::Training) => self.submit_training(payload.trim()).await,
                    Some(Operation::Prediction) => self.submit_prediction(payload.trim()).await,
                    None => bad_request("usage: submit <training|prediction> <payload>"),
                }
            }
            other => match Operation::parse(other) {
                Some(Operation::Training) => self.training().await,
                Some(Operation::Prediction) => self.prediction().await,
                None => bad_request(&format!("unknown request: {other}")),
            },
        }
    }
}

fn respond(result: Result<String>) -> Response {
    match result {
        Ok(payload) => Response::ok(payload),
        Err(e) => {
            error!(code = e.code(), category = e.category(), error = %e, "request failed");
            Response::error(&e)
        }
    }
}

fn bad_request(msg: &str) -> Response {
    Response {
        status: 400,
        body: json!({ "result": false, "code": "1", "category": "bad request", "description": msg })
            .to_string(),
    }
}
