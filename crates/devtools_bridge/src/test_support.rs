use std::{ffi::OsString, fs, os::unix::fs::PermissionsExt, path::PathBuf, sync::Arc, time::Duration};

use dap_session::AdapterDescriptor;
use serde_json::{json, Value};
use tokio::{sync::mpsc, time};

use crate::{
    AdapterKind, BridgeSession, ChannelClientCallback, ClientCommand, LocalFileCache,
    SessionConfig, SessionMode,
};

/// Scriptable fake debug adapter speaking real `Content-Length` framing.
///
/// Behavior knobs come in through the environment:
/// - `THREADS`: comma-separated thread ids announced after launch
/// - `PAUSE_ALL`: report `allThreadsStopped` on the stop emitted for `pause`
/// - `STACK_DELAY_MS`: delay every `stackTrace` response
/// - `CONTINUE_THREAD_AFTER_STOP`: `tid:ms`, emit `continued` for `tid`
///   that long after a stop
/// - `RELOCATE`: `from:to[,from:to]` adapter-line moves in `setBreakpoints`
/// - `BREAKPOINT_EVENT_AFTER_SYNC`: emit a hit-count breakpoint event
///   shortly after the first `setBreakpoints` response
/// - `EXC_DELAY_MS`: delay `setExceptionBreakpoints` responses
/// - `CAPS_COMPLETIONS`: `0` drops the completions capability
/// - `OUTPUT_EVENTS`: emit sample output events right after launch
/// - `REQUEST_LOG`: JSONL file receiving every request
///
/// Evaluating `__fail__` produces a failed response; `__restart__` makes
/// the adapter emit a second `initialized` event.
pub(crate) fn write_fake_adapter() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-adapter");
    let script = r#"#!/usr/bin/env python3
import json
import os
import sys
import threading
import time

write_lock = threading.Lock()
state = {"seq": 1, "bp_id": 100, "bp_event_sent": False}

def send(payload):
    with write_lock:
        payload["seq"] = state["seq"]
        state["seq"] += 1
        raw = json.dumps(payload).encode("utf-8")
        sys.stdout.buffer.write(b"Content-Length: %d\r\n\r\n" % len(raw))
        sys.stdout.buffer.write(raw)
        sys.stdout.buffer.flush()

def respond(req, body=None, success=True, message=None):
    payload = {"type": "response", "request_seq": req["seq"], "success": success, "command": req["command"]}
    if body is not None:
        payload["body"] = body
    if message is not None:
        payload["message"] = message
    send(payload)

def event(name, body=None):
    payload = {"type": "event", "event": name}
    if body is not None:
        payload["body"] = body
    send(payload)

def read_message():
    headers = b""
    while not headers.endswith(b"\r\n\r\n"):
        chunk = sys.stdin.buffer.read(1)
        if not chunk:
            return None
        headers += chunk
    length = 0
    for line in headers.decode("utf-8").split("\r\n"):
        if line.lower().startswith("content-length:"):
            length = int(line.split(":", 1)[1].strip())
    payload = sys.stdin.buffer.read(length)
    if payload is None or len(payload) < length:
        return None
    return json.loads(payload)

def log_request(msg):
    path = os.environ.get("REQUEST_LOG")
    if path:
        with open(path, "a") as fh:
            fh.write(json.dumps(msg) + "\n")

def env_int(name, default=0):
    try:
        return int(os.environ.get(name, default))
    except ValueError:
        return default

relocate = {}
for pair in os.environ.get("RELOCATE", "").split(","):
    if ":" in pair:
        src, dst = pair.split(":", 1)
        relocate[int(src)] = int(dst)

threads = [int(x) for x in os.environ.get("THREADS", "").split(",") if x]

def stack_body(thread_id):
    return {
        "stackFrames": [{
            "id": thread_id * 1000 + 1,
            "name": "main",
            "source": {"path": "/src/app.py"},
            "line": 3,
            "column": 1,
        }],
        "totalFrames": 1,
    }

def later(delay_ms, fn):
    def run():
        time.sleep(delay_ms / 1000.0)
        fn()
    threading.Thread(target=run, daemon=True).start()

while True:
    msg = read_message()
    if msg is None:
        break
    if msg.get("type") != "request":
        continue
    log_request(msg)
    cmd = msg.get("command")
    args = msg.get("arguments") or {}
    if cmd == "initialize":
        respond(msg, {
            "supportsConfigurationDoneRequest": True,
            "supportsCompletionsRequest": os.environ.get("CAPS_COMPLETIONS", "1") == "1",
            "supportsDelayedStackTraceLoading": True,
        })
        event("initialized")
    elif cmd in ("launch", "attach"):
        respond(msg, {})
        for tid in threads:
            event("thread", {"reason": "started", "threadId": tid})
        if os.environ.get("OUTPUT_EVENTS") == "1":
            event("output", {"category": "stdout", "output": "hello world\n"})
            event("output", {"category": "nuclide_notification", "output": "attention\n", "data": {"type": "warning"}})
    elif cmd == "setBreakpoints":
        reported = []
        for bp in args.get("breakpoints") or []:
            line = bp.get("line")
            reported.append({"id": state["bp_id"], "verified": True, "line": relocate.get(line, line)})
            state["bp_id"] += 1
        respond(msg, {"breakpoints": reported})
        if os.environ.get("BREAKPOINT_EVENT_AFTER_SYNC") == "1" and reported and not state["bp_event_sent"]:
            state["bp_event_sent"] = True
            first = dict(reported[0])
            def emit_hit(first=first):
                first["nuclide_hitCount"] = 1
                event("breakpoint", {"reason": "changed", "breakpoint": first})
            later(100, emit_hit)
    elif cmd == "setExceptionBreakpoints":
        delay = env_int("EXC_DELAY_MS")
        if delay:
            time.sleep(delay / 1000.0)
        respond(msg, {})
    elif cmd == "configurationDone":
        respond(msg, {})
    elif cmd == "pause":
        respond(msg, {})
        tid = args.get("threadId", -1)
        if tid is None or tid < 0:
            tid = threads[0] if threads else 1
        body = {"reason": "user request", "threadId": tid}
        if os.environ.get("PAUSE_ALL") == "1":
            body["allThreadsStopped"] = True
        event("stopped", body)
        race = os.environ.get("CONTINUE_THREAD_AFTER_STOP")
        if race:
            cont_tid, delay_ms = race.split(":", 1)
            later(int(delay_ms), lambda tid=int(cont_tid): event("continued", {"threadId": tid}))
    elif cmd == "continue":
        respond(msg, {})
        event("continued", {"threadId": args.get("threadId", -1)})
    elif cmd == "stackTrace":
        delay = env_int("STACK_DELAY_MS")
        tid = args.get("threadId", 0)
        if delay:
            later(delay, lambda m=msg, t=tid: respond(m, stack_body(t)))
        else:
            respond(msg, stack_body(tid))
    elif cmd == "scopes":
        respond(msg, {"scopes": [{"name": "Locals", "variablesReference": args.get("frameId", 0) * 10 + 1, "expensive": False}]})
    elif cmd == "variables":
        respond(msg, {"variables": [
            {"name": "answer", "value": "42", "type": "int", "variablesReference": 0},
            {"name": "items", "value": "list", "type": "list", "variablesReference": 99},
        ]})
    elif cmd == "setVariable":
        respond(msg, {"value": args.get("value", "")})
    elif cmd == "evaluate":
        expr = args.get("expression", "")
        if expr == "__fail__":
            respond(msg, None, success=False, message="evaluation failed")
        elif expr == "__restart__":
            respond(msg, {"result": "ok", "variablesReference": 0})
            event("initialized")
        else:
            respond(msg, {"result": "ok", "variablesReference": 0})
    elif cmd == "completions":
        respond(msg, {"targets": [{"label": "foo"}]})
    elif cmd == "continueToLocation":
        respond(msg, {})
    elif cmd in ("next", "stepIn", "stepOut"):
        respond(msg, {})
    elif cmd == "disconnect":
        respond(msg, {})
        break
    else:
        respond(msg, {})
"#;

    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

pub(crate) struct BridgeHarness {
    _dir: tempfile::TempDir,
    pub session: BridgeSession,
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    pub messages: mpsc::UnboundedReceiver<String>,
    pub notifications: mpsc::UnboundedReceiver<(String, String)>,
    pub outputs: mpsc::UnboundedReceiver<(String, String)>,
    pub files: Arc<LocalFileCache>,
    pub log_path: PathBuf,
}

impl BridgeHarness {
    pub(crate) fn send(&self, id: i64, method: &str, params: Value) {
        self.commands
            .send(ClientCommand {
                id,
                method: method.to_string(),
                params,
            })
            .expect("send command");
    }

    pub(crate) async fn next_message(&mut self) -> Value {
        let raw = time::timeout(Duration::from_secs(5), self.messages.recv())
            .await
            .expect("message timeout")
            .expect("message channel open");
        serde_json::from_str(&raw).expect("client message JSON")
    }

    /// Skip messages until the response with the given id.
    pub(crate) async fn response_for(&mut self, id: i64) -> Value {
        loop {
            let message = self.next_message().await;
            if message.get("id").and_then(Value::as_i64) == Some(id) {
                return message;
            }
        }
    }

    /// Skip messages until the next event with the given method; returns
    /// its params.
    pub(crate) async fn next_event(&mut self, method: &str) -> Value {
        loop {
            let message = self.next_message().await;
            if message.get("method").and_then(Value::as_str) == Some(method) {
                return message.get("params").cloned().unwrap_or(Value::Null);
            }
        }
    }

    pub(crate) async fn read_request_log(&self) -> Vec<Value> {
        let contents = tokio::fs::read_to_string(&self.log_path)
            .await
            .unwrap_or_default();
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("request log line"))
            .collect()
    }

    pub(crate) async fn commands_in_log(&self, command: &str) -> Vec<Value> {
        self.read_request_log()
            .await
            .into_iter()
            .filter(|entry| entry["command"] == command)
            .collect()
    }
}

pub(crate) async fn start_bridge(env: &[(&str, &str)]) -> BridgeHarness {
    let (dir, script) = write_fake_adapter();
    let log_path = dir.path().join("requests.jsonl");

    let mut env_pairs: Vec<(OsString, OsString)> =
        vec![("REQUEST_LOG".into(), log_path.as_os_str().to_os_string())];
    for (key, value) in env {
        env_pairs.push(((*key).into(), (*value).into()));
    }

    let config = SessionConfig {
        adapter_kind: AdapterKind::Python,
        descriptor: AdapterDescriptor {
            command: script,
            args: Vec::new(),
            env: env_pairs,
            current_dir: None,
        },
        mode: SessionMode::Launch,
        arguments: json!({"program": "/src/app.py"}),
    };

    let (callback, channels) = ChannelClientCallback::new();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let files = Arc::new(LocalFileCache::new());
    let session = BridgeSession::start(config, command_rx, Arc::new(callback), files.clone())
        .await
        .expect("start bridge session");

    BridgeHarness {
        _dir: dir,
        session,
        commands: command_tx,
        messages: channels.messages,
        notifications: channels.notifications,
        outputs: channels.outputs,
        files,
        log_path,
    }
}

/// Drive the standard startup: enable (handshake) + first resume.
pub(crate) async fn configure_and_start(harness: &mut BridgeHarness) {
    harness.send(1, "Debugger.enable", Value::Null);
    let enable = harness.response_for(1).await;
    assert!(enable.get("result").is_some());
    let paused = harness.next_event("Debugger.paused").await;
    assert_eq!(paused["reason"], "initial break");

    harness.send(2, "Debugger.resume", Value::Null);
    harness.response_for(2).await;
}
