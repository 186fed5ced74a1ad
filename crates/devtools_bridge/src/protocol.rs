//! Chrome-DevTools-style client protocol shapes.
//!
//! Requests from the client are `{id, method, params}`; the bridge answers
//! with `{id, result}` or `{id, error: {message}}` and pushes events as
//! `{method, params}`. The client protocol is 0-based for lines and columns
//! while the adapter is configured 1-based; every boundary conversion goes
//! through the helpers at the bottom of this module.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::callback::ClientCallback;

/// One command received from the UI shell.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientCommand {
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ClientCommand {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    pub line_number: i64,
    #[serde(default)]
    pub column_number: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub object_type: String,
    pub description: String,
    pub object_id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeObject {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub name: String,
    pub object: RemoteObject,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    pub function_name: String,
    pub location: Location,
    pub has_source: bool,
    pub scope_chain: Vec<ScopeObject>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedPayload {
    pub call_frames: Vec<CallFrame>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_switch_message: Option<String>,
    pub data: Value,
}

impl PausedPayload {
    /// The synthetic pause that tells the UI the session is live and ready
    /// to receive configuration.
    pub fn initial_break() -> Self {
        Self {
            call_frames: Vec::new(),
            reason: "initial break".to_string(),
            stop_thread_id: None,
            thread_switch_message: None,
            data: json!({}),
        }
    }

    /// Emitted for an async break that found no running threads.
    pub fn async_break() -> Self {
        Self {
            call_frames: Vec::new(),
            reason: "Async-Break".to_string(),
            stop_thread_id: Some(-1),
            thread_switch_message: None,
            data: json!({}),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDescription {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub location: Location,
    pub stop_reason: String,
    pub has_source: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsUpdatedPayload {
    pub owning_process_id: i64,
    pub stop_thread_id: i64,
    pub threads: Vec<ThreadDescription>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResolvedPayload {
    pub breakpoint_id: String,
    pub location: Location,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHitCountPayload {
    pub breakpoint_id: String,
    pub hit_count: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetBreakpointParams {
    pub url: String,
    pub line_number: i64,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RemoveBreakpointParams {
    pub breakpoint_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SelectThreadParams {
    pub thread_id: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GetScriptSourceParams {
    pub script_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GetThreadStackParams {
    pub thread_id: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EvaluateOnCallFrameParams {
    pub call_frame_id: Value,
    pub expression: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RuntimeEvaluateParams {
    pub expression: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetVariableValueParams {
    pub call_frame_id: Value,
    pub variable_name: String,
    pub new_value: Value,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GetPropertiesParams {
    pub object_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetPauseOnExceptionsParams {
    pub state: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContinueToLocationParams {
    pub location: Location,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompletionsParams {
    pub text: String,
    #[serde(default)]
    pub column: Option<i64>,
    #[serde(default)]
    pub frame_id: Option<i64>,
}

pub(crate) fn result_response(id: i64, result: Value) -> String {
    json!({"id": id, "result": result}).to_string()
}

pub(crate) fn empty_response(id: i64) -> String {
    result_response(id, json!({}))
}

pub(crate) fn error_response(id: i64, message: &str) -> String {
    json!({"id": id, "error": {"message": message}}).to_string()
}

pub(crate) fn event_message(method: &str, params: Value) -> String {
    json!({"method": method, "params": params}).to_string()
}

pub(crate) fn emit_event<T: Serialize>(callback: &dyn ClientCallback, method: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(params) => callback.send_chrome_message(event_message(method, params)),
        Err(err) => warn!(method, "failed to serialize client event: {err}"),
    }
}

/// 0-based client line/column to the adapter's 1-based coordinates.
pub fn to_adapter_line(line: i64) -> i64 {
    line + 1
}

pub fn to_client_line(line: i64) -> i64 {
    line - 1
}

pub fn to_adapter_column(column: i64) -> i64 {
    column + 1
}

pub fn to_client_column(column: i64) -> i64 {
    column - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_and_column_conversions_round_trip() {
        for value in [0, 1, 5, 41, 9000] {
            assert_eq!(to_client_line(to_adapter_line(value)), value);
            assert_eq!(to_adapter_line(to_client_line(value)), value);
            assert_eq!(to_client_column(to_adapter_column(value)), value);
        }
    }

    #[test]
    fn responses_have_the_wire_shape() {
        let ok: Value = serde_json::from_str(&result_response(3, json!({"x": 1}))).unwrap();
        assert_eq!(ok, json!({"id": 3, "result": {"x": 1}}));

        let err: Value = serde_json::from_str(&error_response(4, "nope")).unwrap();
        assert_eq!(err, json!({"id": 4, "error": {"message": "nope"}}));

        let event: Value =
            serde_json::from_str(&event_message("Debugger.resumed", json!({}))).unwrap();
        assert_eq!(event, json!({"method": "Debugger.resumed", "params": {}}));
        assert!(event.get("id").is_none());
    }

    #[test]
    fn initial_break_payload_matches_handshake_contract() {
        let payload = serde_json::to_value(PausedPayload::initial_break()).unwrap();
        assert_eq!(
            payload,
            json!({"callFrames": [], "reason": "initial break", "data": {}})
        );
    }

    #[test]
    fn client_command_parses_with_and_without_params() {
        let command = ClientCommand::from_json(r#"{"id":1,"method":"Debugger.enable"}"#).unwrap();
        assert_eq!(command.id, 1);
        assert_eq!(command.method, "Debugger.enable");
        assert!(command.params.is_null());

        let command = ClientCommand::from_json(
            r#"{"id":2,"method":"Debugger.selectThread","params":{"threadId":7}}"#,
        )
        .unwrap();
        assert_eq!(command.params["threadId"], 7);
    }
}
