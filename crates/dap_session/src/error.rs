use std::{io, path::PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced while managing an adapter transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("adapter binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("adapter {0} unavailable")]
    Stdio(&'static str),
    #[error("malformed adapter frame: {0}")]
    Framing(String),
    #[error("adapter rejected `{command}`: {message}")]
    AdapterRejected {
        command: String,
        message: String,
        body: Option<Value>,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("adapter transport closed")]
    Closed,
}
