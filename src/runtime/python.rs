//! Python interpreter kept resident as a child process, driven over a
//! line-delimited JSON protocol on its stdin/stdout.

use std::{
    path::Path,
    process::Stdio,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use tracing::{debug, warn};

use super::{ExternalComputation, LaunchSpec, RuntimeLauncher};
use crate::config::{EntryPoint, RuntimeSettings};

const BOOTSTRAP: &str = include_str!("bootstrap.py");

#[derive(Debug, Clone)]
pub struct PythonLauncher {
    python_bin: String,
    entry: EntryPoint,
    ready_timeout: Duration,
}

impl PythonLauncher {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            python_bin: settings.python_bin.clone(),
            entry: settings.entry.clone(),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl RuntimeLauncher for PythonLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ExternalComputation>> {
        let mut cmd = Command::new(&self.python_bin);
        cmd.arg("-u") // unbuffered
            .arg("-c")
            .arg(BOOTSTRAP)
            .arg(&spec.staging_dir)
            .arg(&self.entry.module)
            .arg(&self.entry.class)
            .arg(&self.entry.configure_fn)
            .arg(&self.entry.train_fn)
            .arg(&self.entry.predict_fn)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child: Child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.python_bin))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;

        let mut process = PythonProcess {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            healthy: true,
        };
        let ready = timeout(self.ready_timeout, process.read_reply())
            .await
            .map_err(|_| anyhow!("interpreter not ready after {:?}", self.ready_timeout))??;
        ready.into_value().context("interpreter bootstrap failed")?;
        debug!(python = %self.python_bin, "interpreter ready");

        let computation: Box<dyn ExternalComputation> = Box::new(process);
        Ok(computation)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
enum Request<'a> {
    Configure {
        config_file: &'a str,
        work_dir: &'a str,
    },
    Train {
        payload: &'a str,
        random_state: i64,
        estimators: i64,
    },
    Predict {
        payload: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Reply {
    fn into_value(self) -> Result<Option<String>> {
        if self.ok {
            Ok(self.value)
        } else {
            Err(anyhow!(self.error.unwrap_or_else(|| "unspecified runtime error".into())))
        }
    }
}

struct PythonProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    /// Cleared on any transport failure; replies can no longer be matched to requests.
    healthy: bool,
}

impl PythonProcess {
    async fn call(&mut self, request: &Request<'_>) -> Result<Option<String>> {
        match self.exchange(request).await {
            Ok(reply) => reply.into_value(),
            Err(e) => {
                let detail = format!("{e:#}");
                warn!(error = %detail, "interpreter channel failed");
                self.healthy = false;
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, request: &Request<'_>) -> Result<Reply> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("interpreter input already closed"))?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .context("writing to interpreter")?;
        stdin.flush().await.context("writing to interpreter")?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut buf = String::new();
        let n = self
            .stdout
            .read_line(&mut buf)
            .await
            .context("reading from interpreter")?;
        if n == 0 {
            bail!("interpreter exited");
        }
        serde_json::from_str(buf.trim())
            .with_context(|| format!("malformed interpreter reply: {}", buf.trim()))
    }
}

#[async_trait]
impl ExternalComputation for PythonProcess {
    async fn configure(&mut self, config_file: &Path, work_dir: &Path) -> Result<()> {
        let config_file = config_file.to_string_lossy();
        let work_dir = work_dir.to_string_lossy();
        self.call(&Request::Configure {
            config_file: &config_file,
            work_dir: &work_dir,
        })
        .await
        .map(|_| ())
    }

    async fn train_with(&mut self, payload: &str, random_state: i64, estimators: i64) -> Result<String> {
        let out = self
            .call(&Request::Train { payload, random_state, estimators })
            .await?;
        Ok(out.unwrap_or_default())
    }

    async fn predict_with(&mut self, payload: &str) -> Result<String> {
        Ok(self.call(&Request::Predict { payload }).await?.unwrap_or_default())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    async fn shutdown(&mut self) {
        // Closing stdin ends the bootstrap loop.
        drop(self.stdin.take());
        match timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "interpreter exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting for interpreter failed"),
            Err(_) => {
                warn!("interpreter did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}
