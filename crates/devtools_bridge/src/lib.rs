#![forbid(unsafe_code)]
//! Bidirectional bridge between a Chrome-DevTools-style debugger UI and
//! Debug Adapter Protocol adapters.
//!
//! One [`BridgeSession`] binds one spawned adapter child (driven through
//! [`dap_session`]) to one client channel. Client commands flow through a
//! dispatch table that buffers configuration until the first
//! `Debugger.resume`, then replays it in the order the adapter protocol
//! demands (launch/attach, bulk breakpoints, exception filters,
//! `configurationDone`). Adapter events flow the other way: stop events are
//! expanded across threads with race-safe cancellation, breakpoint events
//! are reconciled against the canonical ledger, and output is routed to the
//! UI's log and notification channels.
//!
//! The UI side is abstracted behind [`ClientCallback`] (wire messages,
//! toasts, user output) and [`FileCache`] (script sources); channel-backed
//! defaults ship for embedding and tests.

mod breakpoints;
mod callback;
mod config;
mod error;
mod events;
mod files;
mod protocol;
mod router;
mod session;
mod stacks;
mod threads;

pub use breakpoints::{BreakpointLedger, BreakpointSnapshot, StagedHandle};
pub use callback::{ChannelClientCallback, ClientCallback, ClientChannels};
pub use config::{AdapterKind, SessionConfig, SessionMode};
pub use error::BridgeError;
pub use files::{FileCache, LocalFileCache};
pub use protocol::{
    to_adapter_column, to_adapter_line, to_client_column, to_client_line, CallFrame,
    ClientCommand, Location, RemoteObject, ScopeObject,
};
pub use session::BridgeSession;
pub use threads::{ThreadRegistry, ThreadState};

#[cfg(test)]
mod test_support;
