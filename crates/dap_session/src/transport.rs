//! Stdio transport for a debug adapter child process.
//!
//! Frames are `Content-Length: <n>\r\n\r\n` followed by n bytes of UTF-8
//! JSON. The transport owns a reader task that demuxes responses vs. events
//! and a writer task that serializes outgoing messages; callers correlate
//! requests to responses through oneshot channels keyed by sequence number.
//! Framing and JSON errors are reported on the error stream without tearing
//! the transport down; a closed stream fails every pending request and fires
//! the exit stream exactly once.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    error::TransportError,
    types::{AdapterMessage, EventMessage, RequestMessage, ResponseMessage},
};

type PendingRequests = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, TransportError>>>>>;

/// Reply produced by a reverse-request handler. The transport stamps the
/// sequence numbers and command before the frame goes out.
#[derive(Clone, Debug)]
pub struct ReverseReply {
    pub success: bool,
    pub message: Option<String>,
    pub body: Option<Value>,
}

impl ReverseReply {
    pub fn empty_success() -> Self {
        Self {
            success: true,
            message: None,
            body: None,
        }
    }
}

/// Handler for adapter-initiated requests. Rarely used reverse channel;
/// the default replies with an empty success.
pub type RequestHandler = Arc<dyn Fn(&RequestMessage) -> ReverseReply + Send + Sync>;

pub(crate) enum DecodedFrame {
    Message(Value),
    Error(String),
}

/// Incremental frame decoder. Bytes go in, complete JSON values (or framing
/// errors) come out; partial frames stay buffered until the next push.
pub(crate) struct FrameDecoder {
    buffer: Vec<u8>,
    content_length: Option<usize>,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Vec::new(),
            content_length: None,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            match self.content_length {
                None => {
                    let Some(end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
                        break;
                    };
                    let header = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                    self.buffer.drain(..end + 4);
                    match parse_content_length(&header) {
                        Some(length) => self.content_length = Some(length),
                        None => frames.push(DecodedFrame::Error(format!(
                            "header without a valid Content-Length: `{}`",
                            header.trim()
                        ))),
                    }
                }
                Some(length) => {
                    if self.buffer.len() < length {
                        break;
                    }
                    let body: Vec<u8> = self.buffer.drain(..length).collect();
                    self.content_length = None;
                    if body.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<Value>(&body) {
                        Ok(value) => frames.push(DecodedFrame::Message(value)),
                        Err(err) => {
                            frames.push(DecodedFrame::Error(format!("invalid JSON frame: {err}")))
                        }
                    }
                }
            }
        }
        frames
    }
}

fn parse_content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("Content-Length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn encode_frame(message: &AdapterMessage) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_string(message)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(payload.as_bytes());
    Ok(frame)
}

struct Shared {
    writer: mpsc::UnboundedSender<AdapterMessage>,
    pending: PendingRequests,
    next_seq: AtomicI64,
    event_sinks: Mutex<Vec<(Option<String>, mpsc::UnboundedSender<EventMessage>)>>,
    error_sinks: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    exit_sinks: Mutex<Vec<mpsc::UnboundedSender<()>>>,
    exited: AtomicBool,
    request_handler: RequestHandler,
}

impl Shared {
    fn allocate_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn broadcast_event(&self, event: EventMessage) {
        let mut sinks = self.event_sinks.lock().await;
        sinks.retain(|(filter, tx)| match filter {
            Some(name) if name != &event.event => true,
            _ => tx.send(event.clone()).is_ok(),
        });
    }

    async fn broadcast_error(&self, message: String) {
        warn!("adapter protocol error: {message}");
        let mut sinks = self.error_sinks.lock().await;
        sinks.retain(|tx| tx.send(message.clone()).is_ok());
    }

    async fn signal_exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.exit_sinks.lock().await;
        for tx in sinks.drain(..) {
            let _ = tx.send(());
        }
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    fn send_reverse_reply(&self, request: &RequestMessage, reply: ReverseReply) {
        let response = AdapterMessage::Response(ResponseMessage {
            seq: self.allocate_seq(),
            request_seq: request.seq,
            success: reply.success,
            command: request.command.clone(),
            message: reply.message,
            body: reply.body,
        });
        let _ = self.writer.send(response);
    }
}

/// The stdio transport bound to one adapter child process.
pub struct AdapterTransport {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    child: Arc<Mutex<Option<Child>>>,
    disposed: AtomicBool,
}

impl AdapterTransport {
    /// Take over the child's stdio and start the reader/writer tasks.
    pub fn start(child: Child) -> Result<Self, TransportError> {
        Self::with_request_handler(child, Arc::new(|_| ReverseReply::empty_success()))
    }

    pub fn with_request_handler(
        mut child: Child,
        request_handler: RequestHandler,
    ) -> Result<Self, TransportError> {
        let stdout = child.stdout.take().ok_or(TransportError::Stdio("stdout"))?;
        let stdin = child.stdin.take().ok_or(TransportError::Stdio("stdin"))?;
        let stderr = child.stderr.take();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            writer: writer_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicI64::new(1),
            event_sinks: Mutex::new(Vec::new()),
            error_sinks: Mutex::new(Vec::new()),
            exit_sinks: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
            request_handler,
        });

        let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
        let reader_handle = tokio::spawn(reader_task(stdout, shared.clone()));

        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr)));
        }

        Ok(Self {
            shared,
            tasks,
            child: Arc::new(Mutex::new(Some(child))),
            disposed: AtomicBool::new(false),
        })
    }

    /// Register a pending entry and hand the request to the writer. The
    /// returned receiver resolves with the response body, an
    /// `AdapterRejected` for `success: false`, or `Closed` when the
    /// transport dies first.
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, TransportError>>, TransportError> {
        let seq = self.shared.allocate_seq();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.insert(seq, tx);
        }

        let message = AdapterMessage::Request(RequestMessage {
            seq,
            command: command.to_string(),
            arguments,
        });
        if self.shared.writer.send(message).is_err() {
            let mut pending = self.shared.pending.lock().await;
            pending.remove(&seq);
            return Err(TransportError::Closed);
        }

        Ok(rx)
    }

    /// Reply to an adapter-initiated request outside the default handler.
    pub fn send_response(&self, request: &RequestMessage, reply: ReverseReply) {
        self.shared.send_reverse_reply(request, reply);
    }

    /// Subscribe to every adapter event.
    pub async fn subscribe_events(&self) -> mpsc::UnboundedReceiver<EventMessage> {
        self.subscribe_named(None).await
    }

    /// Subscribe to events with the given name only.
    pub async fn subscribe_named(&self, name: Option<&str>) -> mpsc::UnboundedReceiver<EventMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sinks = self.shared.event_sinks.lock().await;
        sinks.push((name.map(str::to_string), tx));
        rx
    }

    /// Subscribe to non-terminal protocol errors (bad headers, bad JSON).
    pub async fn subscribe_errors(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sinks = self.shared.error_sinks.lock().await;
        sinks.push(tx);
        rx
    }

    /// Subscribe to the exit signal. Fires immediately when the transport
    /// already shut down.
    pub async fn subscribe_exit(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.exited.load(Ordering::SeqCst) {
            let _ = tx.send(());
            return rx;
        }
        let mut sinks = self.shared.exit_sinks.lock().await;
        sinks.push(tx);
        rx
    }

    /// Tear the transport down: abort the IO tasks, kill the child, fail
    /// every pending request, and fire the exit signal. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
        self.shared.fail_pending().await;
        self.shared.signal_exit().await;
    }
}

impl Drop for AdapterTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut child_guard) = self.child.try_lock() {
            if let Some(mut child) = child_guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<AdapterMessage>) {
    while let Some(message) = rx.recv().await {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to encode adapter frame: {err}");
                continue;
            }
        };
        if stdin.write_all(&frame).await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }

    let _ = stdin.shutdown().await;
}

async fn reader_task(mut stdout: ChildStdout, shared: Arc<Shared>) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                shared
                    .broadcast_error(format!("adapter stdout read failed: {err}"))
                    .await;
                break;
            }
        };
        for frame in decoder.push(&chunk[..read]) {
            match frame {
                DecodedFrame::Message(value) => dispatch_message(value, &shared).await,
                DecodedFrame::Error(message) => shared.broadcast_error(message).await,
            }
        }
    }

    shared.fail_pending().await;
    shared.signal_exit().await;
}

async fn dispatch_message(value: Value, shared: &Arc<Shared>) {
    let message: AdapterMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(err) => {
            shared
                .broadcast_error(format!("unrecognized adapter message: {err}"))
                .await;
            return;
        }
    };

    match message {
        AdapterMessage::Event(event) => {
            trace!(event = %event.event, "adapter event");
            shared.broadcast_event(event).await;
        }
        AdapterMessage::Response(response) => {
            let sender = {
                let mut pending = shared.pending.lock().await;
                pending.remove(&response.request_seq)
            };
            let Some(tx) = sender else {
                warn!(
                    request_seq = response.request_seq,
                    "response without a pending request"
                );
                return;
            };
            if response.success {
                let _ = tx.send(Ok(response.body.unwrap_or(Value::Null)));
            } else {
                let _ = tx.send(Err(TransportError::AdapterRejected {
                    command: response.command,
                    message: response
                        .message
                        .unwrap_or_else(|| "request failed".to_string()),
                    body: response.body,
                }));
            }
        }
        AdapterMessage::Request(request) => {
            trace!(command = %request.command, "adapter-initiated request");
            let reply = (shared.request_handler)(&request);
            shared.send_reverse_reply(&request, reply);
        }
    }
}

async fn stderr_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("adapter stderr: {line}");
    }
}
