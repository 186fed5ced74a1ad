#![forbid(unsafe_code)]
//! Async client for Debug Adapter Protocol child processes speaking
//! length-prefixed JSON over stdio.
//!
//! The crate has two layers:
//! - [`AdapterTransport`] owns the child's stdio, decodes
//!   `Content-Length`-framed JSON messages, correlates responses to requests
//!   by sequence number, and fans events out to subscribers. Framing and
//!   parse errors surface on an error stream without tearing the transport
//!   down; a closed stream fails every pending request and fires the exit
//!   stream.
//! - [`AdapterSession`] spawns the adapter from an [`AdapterDescriptor`],
//!   exposes one typed async method per protocol request (`initialize`,
//!   `launch`, `setBreakpoints`, `stackTrace`, ...), caches the capability
//!   set returned by `initialize`, and provides typed per-event streams
//!   plus `observe_session_end` for the combined end-of-session signal.
//!
//! Sequence numbers are assigned from a single counter starting at 1, so
//! everything written to the adapter is strictly monotonic and dense.

mod error;
mod session;
mod transport;
pub mod types;

pub use error::TransportError;
pub use session::{AdapterDescriptor, AdapterSession};
pub use transport::{AdapterTransport, RequestHandler, ReverseReply};

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;
