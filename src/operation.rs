//! The two cached artifacts and the external entry point each one maps to.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Training,
    Prediction,
}

impl Operation {
    pub const ALL: [Operation; 2] = [Operation::Training, Operation::Prediction];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Training => "Training",
            Operation::Prediction => "Prediction",
        }
    }

    /// Case-insensitive lookup used by the CLI and the `serve` line protocol.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "training" | "train" => Some(Operation::Training),
            "prediction" | "predict" => Some(Operation::Prediction),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
