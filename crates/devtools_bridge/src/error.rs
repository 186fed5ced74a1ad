use dap_session::TransportError;
use thiserror::Error;

/// Errors surfaced while translating between the two protocols.
///
/// Command-handler failures never escape to the transport; the router
/// converts them into `{id, error: {message}}` client responses in exactly
/// one place.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Adapter(#[from] TransportError),
    #[error("{0}")]
    Handler(String),
    #[error("failed to start the debuggee: {0}")]
    Startup(#[source] TransportError),
    #[error("adapter returned {actual} breakpoints for `{path}` ({expected} requested)")]
    BreakpointMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },
    #[error("No paused thread to {0}")]
    NoPausedThread(&'static str),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("failed to read source for `{path}`: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session closed")]
    Closed,
}
