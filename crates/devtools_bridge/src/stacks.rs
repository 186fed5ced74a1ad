//! Adapter stack frames to client call frames.

use dap_session::AdapterSession;
use tracing::warn;

use crate::protocol::{
    to_client_column, to_client_line, CallFrame, Location, RemoteObject, ScopeObject,
};

/// Fetch and translate the call stack for one thread. `levels: None` asks
/// for the full stack. Fetch failures are logged and yield an empty list so
/// the UI always receives a response.
pub(crate) async fn fetch_call_frames(
    session: &AdapterSession,
    thread_id: i64,
    levels: Option<i64>,
) -> Vec<CallFrame> {
    let body = match session.stack_trace(thread_id, levels).await {
        Ok(body) => body,
        Err(err) => {
            warn!(thread_id, "stack trace fetch failed: {err}");
            return Vec::new();
        }
    };

    let mut frames = Vec::with_capacity(body.stack_frames.len());
    for frame in body.stack_frames {
        let scope_chain = fetch_scope_chain(session, frame.id).await;
        let has_source = frame.source.is_some();
        let script_id = frame
            .source
            .and_then(|source| source.path)
            .unwrap_or_else(|| "N/A".to_string());
        frames.push(CallFrame {
            call_frame_id: frame.id.to_string(),
            function_name: frame.name,
            location: Location {
                script_id,
                line_number: to_client_line(frame.line),
                column_number: to_client_column(frame.column),
            },
            has_source,
            scope_chain,
        });
    }
    frames
}

async fn fetch_scope_chain(session: &AdapterSession, frame_id: i64) -> Vec<ScopeObject> {
    match session.scopes(frame_id).await {
        Ok(body) => body
            .scopes
            .into_iter()
            .map(|scope| ScopeObject {
                scope_type: scope.name.clone(),
                name: scope.name.clone(),
                object: RemoteObject {
                    object_type: "object".to_string(),
                    description: scope.name,
                    object_id: scope.variables_reference.to_string(),
                },
            })
            .collect(),
        Err(err) => {
            warn!(frame_id, "scope fetch failed: {err}");
            Vec::new()
        }
    }
}
