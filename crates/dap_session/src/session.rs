//! Typed wrapper over the adapter transport.
//!
//! `AdapterSession` spawns the adapter child, exposes one typed method per
//! protocol request, caches the capability set returned by `initialize`, and
//! fans adapter events out as typed streams. Capability accessors report
//! `false` until `initialize` has resolved.

use std::{ffi::OsString, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    process::{Child, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    error::TransportError,
    transport::AdapterTransport,
    types::{
        BreakpointEventBody, Capabilities, CompletionsArguments, CompletionsResponseBody,
        ContinueToLocationArguments, ContinuedEventBody, EvaluateArguments, EvaluateResponseBody,
        EventMessage, ExitedEventBody, InitializeArguments, OutputEventBody, ScopesArguments,
        ScopesResponseBody, SetBreakpointsArguments, SetBreakpointsResponseBody,
        SetExceptionBreakpointsArguments, SetVariableArguments, SetVariableResponseBody, Source,
        SourceBreakpoint, StackTraceArguments, StackTraceResponseBody, StoppedEventBody,
        TerminatedEventBody, ThreadEventBody, ThreadIdArguments, VariablesArguments,
        VariablesResponseBody,
    },
};

/// How to start the adapter child process.
#[derive(Clone, Debug)]
pub struct AdapterDescriptor {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

/// One live adapter child plus the typed protocol surface over it.
pub struct AdapterSession {
    transport: Arc<AdapterTransport>,
    capabilities: Arc<parking_lot::Mutex<Option<Capabilities>>>,
    ready_for_breakpoints: watch::Receiver<bool>,
    adapter_id: String,
    watcher: JoinHandle<()>,
}

impl AdapterSession {
    /// Spawn the adapter executable and wire the transport to it.
    pub async fn spawn(
        descriptor: &AdapterDescriptor,
        adapter_id: &str,
    ) -> Result<Self, TransportError> {
        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &descriptor.env {
            command.env(key, value);
        }

        let child = spawn_with_retry(&mut command, &descriptor.command).await?;
        let transport = Arc::new(AdapterTransport::start(child)?);

        let (ready_tx, ready_rx) = watch::channel(false);
        let watcher = {
            let mut initialized = transport.subscribe_named(Some("initialized")).await;
            tokio::spawn(async move {
                if initialized.recv().await.is_some() {
                    let _ = ready_tx.send(true);
                }
            })
        };

        Ok(Self {
            transport,
            capabilities: Arc::new(parking_lot::Mutex::new(None)),
            ready_for_breakpoints: ready_rx,
            adapter_id: adapter_id.to_string(),
            watcher,
        })
    }

    /// Negotiate capabilities. Sent once, before `launch`/`attach`.
    pub async fn initialize(&self) -> Result<Capabilities, TransportError> {
        let arguments = InitializeArguments {
            client_id: "Nuclide".to_string(),
            adapter_id: self.adapter_id.clone(),
            lines_start_at1: true,
            columns_start_at1: true,
            supports_variable_type: true,
            supports_variable_paging: false,
            supports_run_in_terminal_request: false,
            path_format: "path".to_string(),
        };
        let capabilities: Capabilities = self
            .request("initialize", serde_json::to_value(arguments)?)
            .await?;
        *self.capabilities.lock() = Some(capabilities.clone());
        Ok(capabilities)
    }

    pub async fn launch(&self, arguments: Value) -> Result<(), TransportError> {
        self.request_body("launch", arguments).await.map(|_| ())
    }

    pub async fn attach(&self, arguments: Value) -> Result<(), TransportError> {
        self.request_body("attach", arguments).await.map(|_| ())
    }

    pub async fn set_breakpoints(
        &self,
        source_path: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> Result<SetBreakpointsResponseBody, TransportError> {
        let arguments = SetBreakpointsArguments {
            source: Source {
                path: Some(source_path.to_string()),
                ..Source::default()
            },
            lines: breakpoints.iter().map(|bp| bp.line).collect(),
            breakpoints: breakpoints.to_vec(),
        };
        self.request("setBreakpoints", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn set_exception_breakpoints(
        &self,
        filters: &[String],
    ) -> Result<(), TransportError> {
        let arguments = SetExceptionBreakpointsArguments {
            filters: filters.to_vec(),
        };
        self.request_body("setExceptionBreakpoints", serde_json::to_value(arguments)?)
            .await
            .map(|_| ())
    }

    pub async fn configuration_done(&self) -> Result<(), TransportError> {
        self.request_body("configurationDone", Value::Object(Default::default()))
            .await
            .map(|_| ())
    }

    pub async fn continue_thread(&self, thread_id: i64) -> Result<(), TransportError> {
        self.thread_request("continue", thread_id).await
    }

    pub async fn pause(&self, thread_id: i64) -> Result<(), TransportError> {
        self.thread_request("pause", thread_id).await
    }

    pub async fn next(&self, thread_id: i64) -> Result<(), TransportError> {
        self.thread_request("next", thread_id).await
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<(), TransportError> {
        self.thread_request("stepIn", thread_id).await
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<(), TransportError> {
        self.thread_request("stepOut", thread_id).await
    }

    pub async fn stack_trace(
        &self,
        thread_id: i64,
        levels: Option<i64>,
    ) -> Result<StackTraceResponseBody, TransportError> {
        let arguments = StackTraceArguments {
            thread_id,
            start_frame: None,
            levels,
        };
        self.request("stackTrace", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<ScopesResponseBody, TransportError> {
        let arguments = ScopesArguments { frame_id };
        self.request("scopes", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn variables(
        &self,
        variables_reference: i64,
    ) -> Result<VariablesResponseBody, TransportError> {
        let arguments = VariablesArguments {
            variables_reference,
        };
        self.request("variables", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<SetVariableResponseBody, TransportError> {
        let arguments = SetVariableArguments {
            variables_reference,
            name: name.to_string(),
            value: value.to_string(),
        };
        self.request("setVariable", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<EvaluateResponseBody, TransportError> {
        let arguments = EvaluateArguments {
            expression: expression.to_string(),
            frame_id,
            context: None,
        };
        self.request("evaluate", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn completions(
        &self,
        text: &str,
        column: i64,
        frame_id: Option<i64>,
    ) -> Result<CompletionsResponseBody, TransportError> {
        let arguments = CompletionsArguments {
            text: text.to_string(),
            column,
            frame_id,
        };
        self.request("completions", serde_json::to_value(arguments)?)
            .await
    }

    pub async fn continue_to_location(
        &self,
        source_path: &str,
        line: i64,
        column: i64,
    ) -> Result<(), TransportError> {
        let arguments = ContinueToLocationArguments {
            source: Source {
                path: Some(source_path.to_string()),
                ..Source::default()
            },
            line,
            column,
        };
        self.request_body("continueToLocation", serde_json::to_value(arguments)?)
            .await
            .map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.request_body("disconnect", Value::Object(Default::default()))
            .await
            .map(|_| ())
    }

    /// The capability set cached from `initialize`, empty until it resolves.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.lock().clone().unwrap_or_default()
    }

    pub fn supports_configuration_done(&self) -> bool {
        self.capabilities()
            .supports_configuration_done_request
            .unwrap_or(false)
    }

    pub fn supports_completions(&self) -> bool {
        self.capabilities()
            .supports_completions_request
            .unwrap_or(false)
    }

    pub fn supports_delayed_stack_trace_loading(&self) -> bool {
        self.capabilities()
            .supports_delayed_stack_trace_loading
            .unwrap_or(false)
    }

    /// True once the first `initialized` event arrived.
    pub fn is_ready_for_breakpoints(&self) -> bool {
        *self.ready_for_breakpoints.borrow()
    }

    /// Wait for the first `initialized` event. Returns immediately when it
    /// already happened; also returns when the transport dies first, since
    /// the next adapter call will surface that as `Closed`.
    pub async fn wait_for_initialized(&self) {
        let mut ready = self.ready_for_breakpoints.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn initialized_events(&self) -> mpsc::UnboundedReceiver<EventMessage> {
        self.transport.subscribe_named(Some("initialized")).await
    }

    pub async fn stopped_events(&self) -> mpsc::UnboundedReceiver<StoppedEventBody> {
        self.typed_events("stopped").await
    }

    pub async fn continued_events(&self) -> mpsc::UnboundedReceiver<ContinuedEventBody> {
        self.typed_events("continued").await
    }

    pub async fn thread_events(&self) -> mpsc::UnboundedReceiver<ThreadEventBody> {
        self.typed_events("thread").await
    }

    pub async fn breakpoint_events(&self) -> mpsc::UnboundedReceiver<BreakpointEventBody> {
        self.typed_events("breakpoint").await
    }

    pub async fn output_events(&self) -> mpsc::UnboundedReceiver<OutputEventBody> {
        self.typed_events("output").await
    }

    pub async fn terminated_events(&self) -> mpsc::UnboundedReceiver<TerminatedEventBody> {
        self.typed_events("terminated").await
    }

    pub async fn exited_events(&self) -> mpsc::UnboundedReceiver<ExitedEventBody> {
        self.typed_events("exited").await
    }

    /// Every adapter event, unfiltered.
    pub async fn all_events(&self) -> mpsc::UnboundedReceiver<EventMessage> {
        self.transport.subscribe_events().await
    }

    pub async fn protocol_errors(&self) -> mpsc::UnboundedReceiver<String> {
        self.transport.subscribe_errors().await
    }

    /// Fires once when the adapter child goes away.
    pub async fn adapter_exited(&self) -> mpsc::UnboundedReceiver<()> {
        self.transport.subscribe_exit().await
    }

    /// Resolves once on the first of: debuggee `exited`, `terminated`
    /// delayed by one second so trailing output can flush, or adapter
    /// process exit.
    pub async fn observe_session_end(&self) -> mpsc::UnboundedReceiver<()> {
        let mut exited = self.transport.subscribe_named(Some("exited")).await;
        let mut terminated = self.transport.subscribe_named(Some("terminated")).await;
        let mut process_exit = self.transport.subscribe_exit().await;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = exited.recv() => {}
                _ = terminated.recv() => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ = process_exit.recv() => {}
            }
            let _ = tx.send(());
        });
        rx
    }

    /// Tear down the transport and kill the child. Idempotent.
    pub async fn dispose(&self) {
        self.watcher.abort();
        self.transport.dispose().await;
    }

    async fn thread_request(&self, command: &str, thread_id: i64) -> Result<(), TransportError> {
        let arguments = ThreadIdArguments { thread_id };
        self.request_body(command, serde_json::to_value(arguments)?)
            .await
            .map(|_| ())
    }

    async fn request_body(&self, command: &str, arguments: Value) -> Result<Value, TransportError> {
        let rx = self.transport.send_request(command, Some(arguments)).await?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Value,
    ) -> Result<T, TransportError> {
        let body = self.request_body(command, arguments).await?;
        let body = if body.is_null() {
            Value::Object(Default::default())
        } else {
            body
        };
        serde_json::from_value(body).map_err(TransportError::from)
    }

    async fn typed_events<T>(&self, name: &'static str) -> mpsc::UnboundedReceiver<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut raw = self.transport.subscribe_named(Some(name)).await;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                let body = event.body.unwrap_or(Value::Null);
                let body = if body.is_null() {
                    Value::Object(Default::default())
                } else {
                    body
                };
                match serde_json::from_value::<T>(body) {
                    Ok(parsed) => {
                        if tx.send(parsed).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(event = name, "failed to parse adapter event body: {err}"),
                }
            }
        });
        rx
    }
}

async fn spawn_with_retry(command: &mut Command, binary: &PathBuf) -> Result<Child, TransportError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(TransportError::Spawn {
                    binary: binary.clone(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn retry loop returns before exhausting attempts")
}
