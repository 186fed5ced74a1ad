use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use crate::AdapterDescriptor;

pub(crate) fn write_fake_adapter() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-adapter");
    let script = r#"#!/usr/bin/env python3
import json
import os
import sys
import threading

write_lock = threading.Lock()
state = {"seq": 1, "bp_id": 100}

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
            "supportsCompletionsRequest": True,
            "supportsDelayedStackTraceLoading": True,
        })
        event("initialized")
    elif cmd == "setBreakpoints":
        reported = []
        for bp in args.get("breakpoints") or []:
            reported.append({"id": state["bp_id"], "verified": True, "line": bp.get("line")})
            state["bp_id"] += 1
        respond(msg, {"breakpoints": reported})
    elif cmd == "evaluate":
        if args.get("expression") == "__fail__":
            respond(msg, None, success=False, message="evaluation failed")
        else:
            respond(msg, {"result": "ok", "variablesReference": 0})
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

pub(crate) fn descriptor_with_log(
    script: PathBuf,
    log_path: &std::path::Path,
) -> AdapterDescriptor {
    AdapterDescriptor {
        command: script,
        args: Vec::new(),
        env: vec![("REQUEST_LOG".into(), log_path.as_os_str().to_os_string())],
        current_dir: None,
    }
}
