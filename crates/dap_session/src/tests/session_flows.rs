use std::time::Duration;

use serde_json::Value;
use tokio::time;

use crate::{
    test_support::{descriptor_with_log, write_fake_adapter},
    types::SourceBreakpoint,
    AdapterSession, TransportError,
};

async fn start_session() -> (tempfile::TempDir, std::path::PathBuf, AdapterSession) {
    let (dir, script) = write_fake_adapter();
    let log_path = dir.path().join("requests.jsonl");
    let descriptor = descriptor_with_log(script, &log_path);
    let session = AdapterSession::spawn(&descriptor, "python")
        .await
        .expect("spawn adapter");
    (dir, log_path, session)
}

async fn read_request_log(path: &std::path::Path) -> Vec<Value> {
    let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("request log line"))
        .collect()
}

#[tokio::test]
async fn initialize_caches_capabilities_and_marks_ready() {
    let (_dir, _log, session) = start_session().await;

    assert!(!session.supports_configuration_done());
    assert!(!session.is_ready_for_breakpoints());

    let capabilities = time::timeout(Duration::from_secs(5), session.initialize())
        .await
        .expect("initialize timeout")
        .expect("initialize");
    assert_eq!(capabilities.supports_configuration_done_request, Some(true));
    assert!(session.supports_configuration_done());
    assert!(session.supports_completions());
    assert!(session.supports_delayed_stack_trace_loading());

    // The fake adapter emits `initialized` right after the response.
    time::timeout(Duration::from_secs(2), async {
        while !session.is_ready_for_breakpoints() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ready flag");

    session.dispose().await;
}

#[tokio::test]
async fn sequence_numbers_are_dense_and_monotonic() {
    let (_dir, log_path, session) = start_session().await;

    session.initialize().await.expect("initialize");
    session
        .set_breakpoints(
            "/src/app.py",
            &[SourceBreakpoint {
                line: 3,
                column: None,
                condition: None,
            }],
        )
        .await
        .expect("set breakpoints");
    session.evaluate("1 + 1", None).await.expect("evaluate");

    let log = read_request_log(&log_path).await;
    let seqs: Vec<i64> = log
        .iter()
        .map(|entry| entry["seq"].as_i64().expect("seq"))
        .collect();
    assert_eq!(seqs, (1..=seqs.len() as i64).collect::<Vec<_>>());

    session.dispose().await;
}

#[tokio::test]
async fn set_breakpoints_reports_adapter_ids() {
    let (_dir, _log, session) = start_session().await;

    session.initialize().await.expect("initialize");
    let body = session
        .set_breakpoints(
            "/src/app.py",
            &[
                SourceBreakpoint {
                    line: 3,
                    column: None,
                    condition: None,
                },
                SourceBreakpoint {
                    line: 9,
                    column: None,
                    condition: Some("x > 1".to_string()),
                },
            ],
        )
        .await
        .expect("set breakpoints");

    assert_eq!(body.breakpoints.len(), 2);
    assert_eq!(body.breakpoints[0].id, Some(100));
    assert_eq!(body.breakpoints[1].id, Some(101));
    assert!(body.breakpoints.iter().all(|bp| bp.verified));

    session.dispose().await;
}

#[tokio::test]
async fn failed_request_surfaces_adapter_rejection() {
    let (_dir, _log, session) = start_session().await;

    session.initialize().await.expect("initialize");
    let err = session
        .evaluate("__fail__", None)
        .await
        .expect_err("rejection expected");
    match err {
        TransportError::AdapterRejected {
            command, message, ..
        } => {
            assert_eq!(command, "evaluate");
            assert_eq!(message, "evaluation failed");
        }
        other => panic!("unexpected error: {other}"),
    }

    session.dispose().await;
}

#[tokio::test]
async fn dispose_fails_pending_and_signals_exit() {
    let (_dir, _log, session) = start_session().await;

    session.initialize().await.expect("initialize");
    let mut exit = session.adapter_exited().await;
    session.dispose().await;

    time::timeout(Duration::from_secs(2), exit.recv())
        .await
        .expect("exit timeout")
        .expect("exit signal");

    let err = session
        .evaluate("after close", None)
        .await
        .expect_err("closed transport");
    assert!(matches!(err, TransportError::Closed));

    // A second dispose is a no-op.
    session.dispose().await;
}

#[tokio::test]
async fn session_end_fires_when_child_exits() {
    let (_dir, _log, session) = start_session().await;

    session.initialize().await.expect("initialize");
    let mut end = session.observe_session_end().await;
    session.disconnect().await.expect("disconnect");

    time::timeout(Duration::from_secs(5), end.recv())
        .await
        .expect("session end timeout")
        .expect("session end");
}
