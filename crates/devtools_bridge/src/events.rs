//! Adapter event streams translated into client events.

use std::{collections::HashMap, sync::Arc};

use dap_session::{
    types::{ContinuedEventBody, OutputEventBody, StoppedEventBody, ThreadEventBody},
    AdapterSession,
};
use serde_json::{json, Value};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    breakpoints::BreakpointLedger,
    callback::ClientCallback,
    config::AdapterKind,
    protocol::{emit_event, PausedPayload},
    router::SessionFlags,
    stacks::fetch_call_frames,
    threads::{ThreadRegistry, ThreadState},
};

pub(crate) struct EventTranslator {
    shared: Arc<TranslatorShared>,
}

struct TranslatorShared {
    session: Arc<AdapterSession>,
    ledger: Arc<BreakpointLedger>,
    registry: Arc<Mutex<ThreadRegistry>>,
    callback: Arc<dyn ClientCallback>,
    flags: Arc<Mutex<SessionFlags>>,
    adapter_kind: AdapterKind,
}

impl EventTranslator {
    pub(crate) fn new(
        session: Arc<AdapterSession>,
        ledger: Arc<BreakpointLedger>,
        registry: Arc<Mutex<ThreadRegistry>>,
        callback: Arc<dyn ClientCallback>,
        flags: Arc<Mutex<SessionFlags>>,
        adapter_kind: AdapterKind,
    ) -> Self {
        Self {
            shared: Arc::new(TranslatorShared {
                session,
                ledger,
                registry,
                callback,
                flags,
                adapter_kind,
            }),
        }
    }

    /// Subscribe to the adapter streams and spawn one pump per stream.
    pub(crate) async fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let shared = self.shared.clone();
        let mut thread_events = shared.session.thread_events().await;
        tasks.push(tokio::spawn(async move {
            while let Some(body) = thread_events.recv().await {
                shared.handle_thread_event(body).await;
            }
        }));

        let shared = self.shared.clone();
        let mut stopped_events = shared.session.stopped_events().await;
        tasks.push(tokio::spawn(async move {
            while let Some(body) = stopped_events.recv().await {
                // Expansion suspends on stack fetches; run it as its own
                // task so a racing `continued` event is seen in time.
                let shared = shared.clone();
                tokio::spawn(async move {
                    shared.handle_stopped(body).await;
                });
            }
        }));

        let shared = self.shared.clone();
        let mut continued_events = shared.session.continued_events().await;
        tasks.push(tokio::spawn(async move {
            while let Some(body) = continued_events.recv().await {
                shared.handle_continued(body).await;
            }
        }));

        let shared = self.shared.clone();
        let mut output_events = shared.session.output_events().await;
        tasks.push(tokio::spawn(async move {
            while let Some(body) = output_events.recv().await {
                shared.handle_output(body);
            }
        }));

        let shared = self.shared.clone();
        let mut breakpoint_events = shared.session.breakpoint_events().await;
        tasks.push(tokio::spawn(async move {
            while let Some(body) = breakpoint_events.recv().await {
                shared.ledger.on_breakpoint_event(&body).await;
            }
        }));

        let shared = self.shared.clone();
        let mut initialized_events = shared.session.initialized_events().await;
        tasks.push(tokio::spawn(async move {
            // An `initialized` after `configurationDone` went out means the
            // adapter restarted; earlier ones belong to startup sequencing.
            while initialized_events.recv().await.is_some() {
                let config_done = {
                    let flags = shared.flags.lock().await;
                    flags.config_done_sent
                };
                if !config_done {
                    continue;
                }
                shared.handle_adapter_restart().await;
            }
        }));

        tasks
    }
}

impl TranslatorShared {
    async fn handle_thread_event(&self, body: ThreadEventBody) {
        {
            let mut registry = self.registry.lock().await;
            match body.reason.as_str() {
                "started" => registry.upsert(&[body.thread_id], ThreadState::Running),
                "exited" => registry.remove(body.thread_id),
                other => debug!(reason = other, "unhandled thread event reason"),
            }
        }
        self.emit_threads_updated().await;
    }

    async fn handle_stopped(&self, body: StoppedEventBody) {
        let reason = body.reason.clone();
        let thread_id = body.thread_id.unwrap_or(-1);
        let mut all_threads_stopped = body.all_threads_stopped.unwrap_or(false);
        // The Python adapter underreports all-threads stops on user request.
        if self.adapter_kind == AdapterKind::Python && reason == "user request" {
            all_threads_stopped = true;
        }

        let (stopped_ids, active_before, active, switch_message, epochs) = {
            let mut registry = self.registry.lock().await;
            let mut stopped_ids = Vec::new();
            if thread_id >= 0 {
                stopped_ids.push(thread_id);
            }
            if all_threads_stopped {
                for id in registry.known_ids() {
                    if id != thread_id && !registry.is_paused(id) {
                        stopped_ids.push(id);
                    }
                }
            }
            let active_before = registry.active();
            let mut switch_message = None;
            if active_before.is_none() {
                if let Some(first) = stopped_ids.first() {
                    switch_message = registry.set_active(*first);
                }
            }
            let epochs: HashMap<i64, u64> = stopped_ids
                .iter()
                .map(|id| (*id, registry.resume_epoch(*id)))
                .collect();
            (
                stopped_ids,
                active_before,
                registry.active(),
                switch_message,
                epochs,
            )
        };

        let mut fetches = Vec::with_capacity(stopped_ids.len());
        for id in &stopped_ids {
            let levels = if Some(*id) == active {
                None
            } else if self.session.supports_delayed_stack_trace_loading() {
                Some(1)
            } else {
                None
            };
            let session = self.session.clone();
            let id = *id;
            fetches.push((
                id,
                tokio::spawn(async move { fetch_call_frames(&session, id, levels).await }),
            ));
        }

        let mut expanded = Vec::new();
        {
            let mut results = Vec::with_capacity(fetches.len());
            for (id, fetch) in fetches {
                match fetch.await {
                    Ok(frames) => results.push((id, frames)),
                    Err(err) => warn!(thread_id = id, "stack fetch task failed: {err}"),
                }
            }
            let mut registry = self.registry.lock().await;
            for (id, frames) in results {
                // A continue that landed mid-fetch wins; drop the stale stop.
                if registry.resume_epoch(id) != epochs.get(&id).copied().unwrap_or(0) {
                    continue;
                }
                registry.mark_paused(id, &reason, frames, Some(id) == active);
                expanded.push(id);
            }
        }

        if stopped_ids.is_empty() && active_before.is_none() {
            emit_event(
                self.callback.as_ref(),
                "Debugger.paused",
                &PausedPayload::async_break(),
            );
        } else {
            let payload = {
                let registry = self.registry.lock().await;
                registry.active().and_then(|active_id| {
                    expanded.contains(&active_id).then(|| PausedPayload {
                        call_frames: registry
                            .frames_if_loaded(active_id)
                            .unwrap_or_default(),
                        reason: reason.clone(),
                        stop_thread_id: Some(active_id),
                        thread_switch_message: switch_message.clone(),
                        data: json!({}),
                    })
                })
            };
            if let Some(payload) = payload {
                emit_event(self.callback.as_ref(), "Debugger.paused", &payload);
            }
        }

        self.emit_threads_updated().await;
    }

    async fn handle_continued(&self, body: ContinuedEventBody) {
        let thread_id = body.thread_id.unwrap_or(-1);
        let all_continued = thread_id < 0 || body.all_threads_continued.unwrap_or(false);
        {
            let mut registry = self.registry.lock().await;
            if all_continued {
                registry.mark_all_running();
                registry.clear_active();
            } else {
                registry.mark_running(thread_id);
                if registry.active() == Some(thread_id) {
                    registry.clear_active();
                }
            }
        }
        self.callback.send_chrome_message(crate::protocol::event_message(
            "Debugger.resumed",
            json!({}),
        ));
    }

    fn handle_output(&self, body: OutputEventBody) {
        let text = strip_trailing_newline(&body.output);
        let category = body.category.as_deref().unwrap_or("console");
        if category == "nuclide_notification" {
            let level = body
                .data
                .as_ref()
                .and_then(|data| data.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("info");
            self.callback.send_notification(level, text);
            return;
        }
        let level = match category {
            "console" | "debug" => "debug",
            "info" => "info",
            "log" | "stdout" => "log",
            "warning" => "warning",
            "error" | "stderr" => "error",
            "success" => "success",
            other => {
                debug!(category = other, "unmapped output category");
                "log"
            }
        };
        self.callback.send_user_output(level, text);
    }

    async fn handle_adapter_restart(&self) {
        debug!("adapter re-initialized, replaying configuration");
        if let Err(err) = self.ledger.sync_all().await {
            warn!("breakpoint resync after adapter restart failed: {err}");
        }
        let filters = {
            let flags = self.flags.lock().await;
            flags.exception_filters.clone()
        };
        if let Err(err) = self.session.set_exception_breakpoints(&filters).await {
            warn!("exception filter resync failed: {err}");
        }
        if self.session.supports_configuration_done() {
            if let Err(err) = self.session.configuration_done().await {
                warn!("configurationDone resend failed: {err}");
            }
        }
    }

    async fn emit_threads_updated(&self) {
        let payload = {
            let registry = self.registry.lock().await;
            registry.describe(registry.active().unwrap_or(-1))
        };
        emit_event(self.callback.as_ref(), "Debugger.threadsUpdated", &payload);
    }
}

fn strip_trailing_newline(output: &str) -> &str {
    output
        .strip_suffix("\r\n")
        .or_else(|| output.strip_suffix('\n'))
        .unwrap_or(output)
}
