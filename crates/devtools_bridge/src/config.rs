use dap_session::AdapterDescriptor;
use serde_json::Value;

/// The debug adapter dialects the bridge knows how to drive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdapterKind {
    Python,
    Node,
    Java,
    NativeGdb,
}

impl AdapterKind {
    /// The `adapterID` string sent during `initialize`.
    pub fn adapter_id(self) -> &'static str {
        match self {
            AdapterKind::Python => "python",
            AdapterKind::Node => "node",
            AdapterKind::Java => "java",
            AdapterKind::NativeGdb => "gdb",
        }
    }
}

/// Whether the adapter starts the debuggee or attaches to a running one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionMode {
    Launch,
    Attach,
}

/// Everything needed to construct one bridge session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub adapter_kind: AdapterKind,
    pub descriptor: AdapterDescriptor,
    pub mode: SessionMode,
    /// Passed verbatim to `launch`/`attach`.
    pub arguments: Value,
}
