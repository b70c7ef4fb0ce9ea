use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "forestcache", about = "Cached training/prediction results from a resident Python runtime", version)]
pub struct Cli {
    /// Configuration file (KEY=VALUE). Defaults to the per-user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Latest training result, recomputed when older than the TTL.
    Training,

    /// Latest prediction result, recomputed when older than the TTL.
    Prediction,

    /// Train on a dataset now and store the result.
    SubmitTraining {
        /// Dataset file; read from stdin when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Random seed to persist and train with.
        #[arg(long = "random-state", allow_negative_numbers = true, requires = "estimators")]
        random_state: Option<i64>,
        /// Ensemble size to persist and train with.
        #[arg(long, requires = "random_state")]
        estimators: Option<i64>,
    },

    /// Predict on a dataset now and store the result.
    SubmitPrediction {
        /// Dataset file; read from stdin when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Change the training tunables used from the next invocation on.
    ConfigureTraining {
        #[arg(long = "random-state", allow_negative_numbers = true)]
        random_state: i64,
        #[arg(long)]
        estimators: i64,
    },

    /// Show stored entries and their freshness.
    Status,

    /// Answer one request per stdin line against a single resident runtime.
    ///
    /// Requests: `training`, `prediction`, `status`,
    /// `configure <randomState> <estimators>`, `submit <operation> <payload>`.
    Serve,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
