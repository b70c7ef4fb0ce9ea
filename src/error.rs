//! Error taxonomy and the structured body handed back to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::Operation;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Interpreter failed to start or its modules could not be staged.
    #[error("runtime failed to start: {0}")]
    RuntimeStart(String),

    /// The external computation raised or produced no output.
    #[error("An error occurred while processing the data for {operation} task! {detail}")]
    ExternalInvocation { operation: Operation, detail: String },

    #[error("failed to read stored {operation} result: {source}")]
    StoreRead {
        operation: Operation,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to store {operation} result: {source}")]
    StoreWrite {
        operation: Operation,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub fn external(operation: Operation, detail: impl Into<String>) -> Self {
        Error::ExternalInvocation { operation, detail: detail.into() }
    }

    /// "2" marks failures inside the runtime module, "1" everything on the service side.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ExternalInvocation { .. } => "2",
            _ => "1",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Error::RuntimeStart(_) => "runtime error",
            Error::ExternalInvocation { .. } => "runtime module error",
            Error::StoreRead { .. } => "store read error",
            Error::StoreWrite { .. } => "store write error",
            Error::Configuration(_) => "configuration error",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            result: false,
            code: self.code().to_string(),
            category: self.category().to_string(),
            description: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub result: bool,
    pub code: String,
    pub category: String,
    pub description: String,
}

impl ErrorBody {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
