//! Client command dispatch and startup sequencing.
//!
//! The adapter protocol wants a strict order: initialize, breakpoint
//! configuration, launch/attach, exception filters, `configurationDone`.
//! The client sends commands in whatever order its UI produces them, so the
//! router buffers configuration commands until the first `Debugger.resume`
//! and then replays them in the order the adapter requires.

use std::sync::Arc;

use dap_session::{types::EvaluateResponseBody, AdapterSession};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    breakpoints::{BreakpointLedger, BreakpointSnapshot, StagedHandle},
    callback::ClientCallback,
    config::{SessionConfig, SessionMode},
    error::BridgeError,
    files::FileCache,
    protocol::{
        self, empty_response, error_response, result_response, to_adapter_column, to_adapter_line,
        to_client_line, ClientCommand, CompletionsParams, ContinueToLocationParams,
        EvaluateOnCallFrameParams, GetPropertiesParams, GetScriptSourceParams,
        GetThreadStackParams, Location, PausedPayload, RemoveBreakpointParams,
        RuntimeEvaluateParams, SelectThreadParams, SetBreakpointParams, SetPauseOnExceptionsParams,
        SetVariableValueParams,
    },
    stacks::fetch_call_frames,
    threads::ThreadRegistry,
};

/// Mutable per-session state shared between the router and the event
/// translator.
#[derive(Default)]
pub(crate) struct SessionFlags {
    /// First `Debugger.enable` was acknowledged.
    pub enabled: bool,
    /// First `Debugger.resume` was received: the client finished
    /// configuring.
    pub configured: bool,
    pub config_done_sent: bool,
    pub exception_filters: Vec<String>,
    /// `setBreakpointByUrl` commands received before the first resume.
    pub staged_commands: Vec<PendingBreakpointCommand>,
    /// In-flight `setExceptionBreakpoints` call; a newer filter update
    /// aborts it (latest wins).
    pub exception_task: Option<JoinHandle<()>>,
}

#[derive(Clone, Debug)]
pub(crate) struct PendingBreakpointCommand {
    pub id: i64,
    pub path: String,
    /// Client 0-based line.
    pub line: i64,
    pub condition: Option<String>,
}

pub(crate) struct CommandRouter {
    session: Arc<AdapterSession>,
    ledger: Arc<BreakpointLedger>,
    registry: Arc<Mutex<ThreadRegistry>>,
    callback: Arc<dyn ClientCallback>,
    files: Arc<dyn FileCache>,
    config: SessionConfig,
    flags: Arc<Mutex<SessionFlags>>,
    fatal: mpsc::UnboundedSender<()>,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: Arc<AdapterSession>,
        ledger: Arc<BreakpointLedger>,
        registry: Arc<Mutex<ThreadRegistry>>,
        callback: Arc<dyn ClientCallback>,
        files: Arc<dyn FileCache>,
        config: SessionConfig,
        flags: Arc<Mutex<SessionFlags>>,
        fatal: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            session,
            ledger,
            registry,
            callback,
            files,
            config,
            flags,
            fatal,
        }
    }

    /// Handle one client command. Handler failures become `{id, error}`
    /// responses and never escape to the caller.
    pub(crate) async fn handle_command(&self, command: ClientCommand) {
        let id = command.id;
        match self.dispatch(command).await {
            Ok(Some(result)) => self.callback.send_chrome_message(result_response(id, result)),
            Ok(None) => {}
            Err(err) => {
                self.callback
                    .send_chrome_message(error_response(id, &err.to_string()));
            }
        }
    }

    async fn dispatch(&self, command: ClientCommand) -> Result<Option<Value>, BridgeError> {
        let ClientCommand { id, method, params } = command;
        match method.as_str() {
            "Debugger.enable" => self.handle_enable(id).await,
            "Debugger.resume" => self.handle_resume(id).await,
            "Debugger.pause" => self.handle_pause().await,
            "Debugger.selectThread" => self.handle_select_thread(params).await,
            "Debugger.stepOver" => self.handle_step(StepKind::Over).await,
            "Debugger.stepInto" => self.handle_step(StepKind::Into).await,
            "Debugger.stepOut" => self.handle_step(StepKind::Out).await,
            "Debugger.setBreakpointByUrl" => self.handle_set_breakpoint(id, params).await,
            "Debugger.removeBreakpoint" => self.handle_remove_breakpoint(params).await,
            "Debugger.setPauseOnExceptions" => self.handle_set_pause_on_exceptions(params).await,
            "Debugger.continueToLocation" => self.handle_continue_to_location(params).await,
            "Debugger.getScriptSource" => self.handle_get_script_source(params).await,
            "Debugger.getThreadStack" => self.handle_get_thread_stack(params).await,
            "Debugger.evaluateOnCallFrame" => self.handle_evaluate_on_call_frame(params).await,
            "Debugger.setVariableValue" => self.handle_set_variable_value(params).await,
            "Debugger.completions" => self.handle_completions(params).await,
            "Debugger.setDebuggerSettings" | "Runtime.enable" => Ok(Some(json!({}))),
            "Runtime.evaluate" => self.handle_runtime_evaluate(params).await,
            "Runtime.getProperties" => self.handle_get_properties(params).await,
            other => Err(BridgeError::UnknownCommand(other.to_string())),
        }
    }

    async fn handle_enable(&self, id: i64) -> Result<Option<Value>, BridgeError> {
        let first = {
            let mut flags = self.flags.lock().await;
            !std::mem::replace(&mut flags.enabled, true)
        };
        if !first {
            return Ok(Some(json!({})));
        }
        // Acknowledge, then tell the UI the session is live and waiting for
        // configuration via a synthetic pause.
        self.callback.send_chrome_message(empty_response(id));
        protocol::emit_event(
            self.callback.as_ref(),
            "Debugger.paused",
            &PausedPayload::initial_break(),
        );
        Ok(None)
    }

    async fn handle_resume(&self, id: i64) -> Result<Option<Value>, BridgeError> {
        let needs_startup = {
            let mut flags = self.flags.lock().await;
            !std::mem::replace(&mut flags.configured, true)
        };
        if needs_startup {
            return self.start_session(id).await;
        }
        let thread = {
            let registry = self.registry.lock().await;
            registry.active().unwrap_or(-1)
        };
        self.session.continue_thread(thread).await?;
        Ok(Some(json!({})))
    }

    /// The first resume marks the client as fully configured: start the
    /// debuggee, replay buffered breakpoints, push exception filters, and
    /// finish configuration.
    async fn start_session(&self, resume_id: i64) -> Result<Option<Value>, BridgeError> {
        let launched = match self.config.mode {
            SessionMode::Launch => self.session.launch(self.config.arguments.clone()).await,
            SessionMode::Attach => self.session.attach(self.config.arguments.clone()).await,
        };
        if let Err(err) = launched {
            self.callback
                .send_notification("error", "Failed to launch/attach the debugger!");
            let _ = self.fatal.send(());
            return Err(BridgeError::Startup(err));
        }

        if !self.session.is_ready_for_breakpoints() {
            self.session.wait_for_initialized().await;
        }

        let staged = {
            let mut flags = self.flags.lock().await;
            std::mem::take(&mut flags.staged_commands)
        };
        for (path, commands) in group_by_path(staged) {
            let mut handles: Vec<(i64, StagedHandle)> = Vec::with_capacity(commands.len());
            for command in &commands {
                let handle = self
                    .ledger
                    .stage(
                        &path,
                        to_adapter_line(command.line),
                        command.condition.clone(),
                    )
                    .await;
                handles.push((command.id, handle));
            }
            match self.ledger.sync_file(&path).await {
                Ok(()) => {
                    for (command_id, handle) in handles {
                        match self.ledger.snapshot(&handle).await {
                            Some(snapshot) => self.callback.send_chrome_message(result_response(
                                command_id,
                                breakpoint_result(&snapshot),
                            )),
                            None => self.callback.send_chrome_message(error_response(
                                command_id,
                                "breakpoint no longer exists",
                            )),
                        }
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!("bulk breakpoint sync for `{path}` failed: {message}");
                    for (command_id, _) in handles {
                        self.callback
                            .send_chrome_message(error_response(command_id, &message));
                    }
                }
            }
        }

        let filters = {
            let flags = self.flags.lock().await;
            flags.exception_filters.clone()
        };
        self.session.set_exception_breakpoints(&filters).await?;

        if self.session.supports_configuration_done() {
            self.session.configuration_done().await?;
        }
        {
            let mut flags = self.flags.lock().await;
            flags.config_done_sent = true;
        }

        self.callback.send_chrome_message(empty_response(resume_id));
        Ok(None)
    }

    async fn handle_pause(&self) -> Result<Option<Value>, BridgeError> {
        let thread = {
            let mut registry = self.registry.lock().await;
            let thread = registry
                .active()
                .or_else(|| registry.any_thread())
                .unwrap_or(-1);
            registry.clear_active();
            thread
        };
        self.session.pause(thread).await?;
        Ok(Some(json!({})))
    }

    async fn handle_select_thread(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: SelectThreadParams = parse_params(params)?;
        self.registry.lock().await.set_active(params.thread_id);
        Ok(Some(json!({})))
    }

    async fn handle_step(&self, kind: StepKind) -> Result<Option<Value>, BridgeError> {
        let active = {
            let registry = self.registry.lock().await;
            registry.active()
        };
        let Some(thread) = active else {
            return Err(BridgeError::NoPausedThread(kind.verb()));
        };
        match kind {
            StepKind::Over => self.session.next(thread).await?,
            StepKind::Into => self.session.step_in(thread).await?,
            StepKind::Out => self.session.step_out(thread).await?,
        }
        Ok(Some(json!({})))
    }

    async fn handle_set_breakpoint(
        &self,
        id: i64,
        params: Value,
    ) -> Result<Option<Value>, BridgeError> {
        let params: SetBreakpointParams = parse_params(params)?;
        {
            let mut flags = self.flags.lock().await;
            if !flags.configured {
                flags.staged_commands.push(PendingBreakpointCommand {
                    id,
                    path: params.url,
                    line: params.line_number,
                    condition: params.condition,
                });
                return Ok(None);
            }
        }
        self.files.register_file(&params.url);
        let handle = self
            .ledger
            .stage(
                &params.url,
                to_adapter_line(params.line_number),
                params.condition,
            )
            .await;
        self.ledger.sync_file(&params.url).await?;
        let snapshot = self
            .ledger
            .snapshot(&handle)
            .await
            .ok_or_else(|| BridgeError::Handler("breakpoint no longer exists".to_string()))?;
        Ok(Some(breakpoint_result(&snapshot)))
    }

    async fn handle_remove_breakpoint(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: RemoveBreakpointParams = parse_params(params)?;
        let id: i64 = params
            .breakpoint_id
            .parse()
            .map_err(|_| BridgeError::Handler(format!("invalid breakpoint id `{}`", params.breakpoint_id)))?;
        self.ledger.remove(id).await?;
        Ok(Some(json!({})))
    }

    async fn handle_set_pause_on_exceptions(
        &self,
        params: Value,
    ) -> Result<Option<Value>, BridgeError> {
        let params: SetPauseOnExceptionsParams = parse_params(params)?;
        let filters = match params.state.as_str() {
            "none" => Vec::new(),
            "uncaught" => vec!["uncaught".to_string()],
            "all" => vec!["all".to_string()],
            other => {
                return Err(BridgeError::Handler(format!(
                    "unknown exception state `{other}`"
                )))
            }
        };
        let mut flags = self.flags.lock().await;
        flags.exception_filters = filters.clone();
        if flags.config_done_sent {
            if let Some(in_flight) = flags.exception_task.take() {
                in_flight.abort();
            }
            let session = self.session.clone();
            flags.exception_task = Some(tokio::spawn(async move {
                if let Err(err) = session.set_exception_breakpoints(&filters).await {
                    warn!("failed to update exception breakpoints: {err}");
                }
            }));
        }
        Ok(Some(json!({})))
    }

    async fn handle_continue_to_location(
        &self,
        params: Value,
    ) -> Result<Option<Value>, BridgeError> {
        let params: ContinueToLocationParams = parse_params(params)?;
        let Location {
            script_id,
            line_number,
            column_number,
        } = params.location;
        self.files.register_file(&script_id);
        self.session
            .continue_to_location(
                &script_id,
                to_adapter_line(line_number),
                to_adapter_column(column_number),
            )
            .await?;
        Ok(Some(json!({})))
    }

    async fn handle_get_script_source(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: GetScriptSourceParams = parse_params(params)?;
        let source = self.files.get_source(&params.script_id).await?;
        Ok(Some(json!({"scriptSource": source})))
    }

    async fn handle_get_thread_stack(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: GetThreadStackParams = parse_params(params)?;
        let cached = {
            let registry = self.registry.lock().await;
            if registry.is_paused(params.thread_id) {
                Some(registry.frames_if_loaded(params.thread_id))
            } else {
                None
            }
        };
        let frames = match cached {
            // Not paused: the UI still gets a (empty) stack.
            None => Vec::new(),
            Some(Some(frames)) => frames,
            Some(None) => {
                let frames = fetch_call_frames(&self.session, params.thread_id, None).await;
                let mut registry = self.registry.lock().await;
                registry.cache_frames(params.thread_id, frames.clone(), true);
                frames
            }
        };
        Ok(Some(json!({"callFrames": frames})))
    }

    async fn handle_evaluate_on_call_frame(
        &self,
        params: Value,
    ) -> Result<Option<Value>, BridgeError> {
        let params: EvaluateOnCallFrameParams = parse_params(params)?;
        let frame_id = parse_numeric_id(&params.call_frame_id, "call frame id")?;
        let body = self.session.evaluate(&params.expression, Some(frame_id)).await?;
        Ok(Some(json!({"result": evaluation_result(&body)})))
    }

    async fn handle_runtime_evaluate(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: RuntimeEvaluateParams = parse_params(params)?;
        let body = self.session.evaluate(&params.expression, None).await?;
        Ok(Some(json!({"result": evaluation_result(&body)})))
    }

    async fn handle_set_variable_value(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: SetVariableValueParams = parse_params(params)?;
        let reference = parse_numeric_id(&params.call_frame_id, "call frame id")?;
        let value = match &params.new_value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let body = self
            .session
            .set_variable(reference, &params.variable_name, &value)
            .await?;
        Ok(Some(json!({"value": body.value})))
    }

    async fn handle_get_properties(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        let params: GetPropertiesParams = parse_params(params)?;
        let reference: i64 = params.object_id.parse().map_err(|_| {
            BridgeError::Handler(format!("invalid object id `{}`", params.object_id))
        })?;
        let body = self.session.variables(reference).await?;
        let properties: Vec<Value> = body
            .variables
            .iter()
            .map(|variable| {
                let nested = variable.variables_reference.filter(|reference| *reference > 0);
                let mut value = json!({
                    "type": variable.variable_type.as_deref().unwrap_or("string"),
                    "value": variable.value,
                    "description": variable.value,
                });
                if let Some(reference) = nested {
                    value["objectId"] = json!(reference.to_string());
                }
                json!({
                    "name": variable.name,
                    "value": value,
                    "configurable": false,
                    "enumerable": true,
                })
            })
            .collect();
        Ok(Some(json!({"result": properties})))
    }

    async fn handle_completions(&self, params: Value) -> Result<Option<Value>, BridgeError> {
        if !self.session.supports_completions() {
            return Ok(Some(json!({"targets": []})));
        }
        let params: CompletionsParams = parse_params(params)?;
        let body = self
            .session
            .completions(&params.text, params.column.unwrap_or(1), params.frame_id)
            .await?;
        Ok(Some(json!({"targets": body.targets})))
    }
}

#[derive(Clone, Copy)]
enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    fn verb(self) -> &'static str {
        match self {
            StepKind::Over => "step over",
            StepKind::Into => "step into",
            StepKind::Out => "step out",
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, BridgeError> {
    serde_json::from_value(params).map_err(|err| BridgeError::Handler(err.to_string()))
}

fn parse_numeric_id(value: &Value, what: &str) -> Result<i64, BridgeError> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
        .ok_or_else(|| BridgeError::Handler(format!("invalid {what} `{value}`")))
}

fn evaluation_result(body: &EvaluateResponseBody) -> Value {
    let object_id = body
        .variables_reference
        .filter(|reference| *reference > 0)
        .map(|reference| reference.to_string());
    match object_id {
        Some(object_id) => json!({
            "type": body.result_type.as_deref().unwrap_or("object"),
            "description": body.result,
            "objectId": object_id,
        }),
        None => json!({
            "type": body.result_type.as_deref().unwrap_or("string"),
            "value": body.result,
            "description": body.result,
        }),
    }
}

fn breakpoint_result(snapshot: &BreakpointSnapshot) -> Value {
    json!({
        "breakpointId": snapshot.id_string(),
        "locations": [Location {
            script_id: snapshot.path.clone(),
            line_number: to_client_line(snapshot.line),
            column_number: 0,
        }],
        "resolved": snapshot.resolved,
    })
}

fn group_by_path(
    staged: Vec<PendingBreakpointCommand>,
) -> Vec<(String, Vec<PendingBreakpointCommand>)> {
    let mut groups: Vec<(String, Vec<PendingBreakpointCommand>)> = Vec::new();
    for command in staged {
        match groups.iter_mut().find(|(path, _)| *path == command.path) {
            Some((_, commands)) => commands.push(command),
            None => groups.push((command.path.clone(), vec![command])),
        }
    }
    groups
}
