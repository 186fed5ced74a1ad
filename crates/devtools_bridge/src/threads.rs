//! Thread lifecycle and pause bookkeeping.

use std::collections::HashMap;

use crate::protocol::{CallFrame, Location, ThreadDescription, ThreadsUpdatedPayload};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ThreadState {
    #[default]
    Running,
    Paused,
}

#[derive(Clone, Debug, Default)]
pub struct ThreadInfo {
    pub state: ThreadState,
    pub call_frames: Vec<CallFrame>,
    /// True iff `call_frames` holds the full stack of the most recent pause.
    pub call_stack_loaded: bool,
    pub stop_reason: Option<String>,
    /// Bumped every time the thread transitions to running; stop-event
    /// expansion snapshots it to detect a continue that raced the stack
    /// fetch.
    pub resume_epoch: u64,
}

/// Tracks every known thread plus the active paused-thread selection.
///
/// `previous_active` is sticky: it records the last distinct thread that was
/// active before the current one, across clears, so the translator can
/// announce thread switches.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: HashMap<i64, ThreadInfo>,
    active: Option<i64>,
    previous_active: Option<i64>,
    last_active: Option<i64>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, ids: &[i64], state: ThreadState) {
        for id in ids {
            let info = self.threads.entry(*id).or_default();
            info.state = state;
            if state == ThreadState::Running {
                info.resume_epoch += 1;
                info.call_frames.clear();
                info.call_stack_loaded = false;
                info.stop_reason = None;
            }
        }
    }

    pub fn mark_running(&mut self, id: i64) {
        self.upsert(&[id], ThreadState::Running);
    }

    pub fn mark_all_running(&mut self) {
        let ids: Vec<i64> = self.threads.keys().copied().collect();
        self.upsert(&ids, ThreadState::Running);
    }

    pub fn mark_paused(
        &mut self,
        id: i64,
        reason: &str,
        call_frames: Vec<CallFrame>,
        fully_loaded: bool,
    ) {
        let info = self.threads.entry(id).or_default();
        info.state = ThreadState::Paused;
        info.stop_reason = Some(reason.to_string());
        info.call_frames = call_frames;
        info.call_stack_loaded = fully_loaded;
    }

    pub fn remove(&mut self, id: i64) {
        self.threads.remove(&id);
        if self.active == Some(id) {
            self.active = None;
        }
    }

    /// Select the active paused thread. Returns the user-facing switch
    /// banner when a different thread had been active before.
    pub fn set_active(&mut self, id: i64) -> Option<String> {
        let switch = match self.last_active {
            Some(previous) if previous != id => {
                self.previous_active = Some(previous);
                Some(format!(
                    "Active thread switched from thread #{previous} to thread #{id}"
                ))
            }
            _ => None,
        };
        self.last_active = Some(id);
        self.active = Some(id);
        switch
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    pub fn active(&self) -> Option<i64> {
        self.active
    }

    pub fn previous_active(&self) -> Option<i64> {
        self.previous_active
    }

    pub fn any_thread(&self) -> Option<i64> {
        self.threads.keys().min().copied()
    }

    pub fn known_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.threads.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_paused(&self, id: i64) -> bool {
        self.threads
            .get(&id)
            .is_some_and(|info| info.state == ThreadState::Paused)
    }

    pub fn resume_epoch(&self, id: i64) -> u64 {
        self.threads
            .get(&id)
            .map(|info| info.resume_epoch)
            .unwrap_or(0)
    }

    pub fn frames_if_loaded(&self, id: i64) -> Option<Vec<CallFrame>> {
        self.threads.get(&id).and_then(|info| {
            (info.state == ThreadState::Paused && info.call_stack_loaded)
                .then(|| info.call_frames.clone())
        })
    }

    pub fn cache_frames(&mut self, id: i64, call_frames: Vec<CallFrame>, fully_loaded: bool) {
        let info = self.threads.entry(id).or_default();
        info.call_frames = call_frames;
        info.call_stack_loaded = fully_loaded;
    }

    /// The `Debugger.threadsUpdated` payload for the current thread set.
    /// The adapter protocol reports no process id, hence the constant -1.
    pub fn describe(&self, stop_thread_id: i64) -> ThreadsUpdatedPayload {
        let mut threads: Vec<ThreadDescription> = Vec::with_capacity(self.threads.len());
        for id in self.known_ids() {
            let info = &self.threads[&id];
            let top = info.call_frames.first();
            threads.push(ThreadDescription {
                id,
                name: format!("Thread {id}"),
                address: top
                    .map(|frame| frame.function_name.clone())
                    .unwrap_or_else(|| "N/A".to_string()),
                location: top.map(|frame| frame.location.clone()).unwrap_or(Location {
                    script_id: "N/A".to_string(),
                    line_number: 0,
                    column_number: 0,
                }),
                stop_reason: info
                    .stop_reason
                    .clone()
                    .unwrap_or_else(|| "running".to_string()),
                has_source: top.map(|frame| frame.has_source).unwrap_or(false),
            });
        }
        ThreadsUpdatedPayload {
            owning_process_id: -1,
            stop_thread_id,
            threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str, script: &str) -> CallFrame {
        CallFrame {
            call_frame_id: "1001".to_string(),
            function_name: function.to_string(),
            location: Location {
                script_id: script.to_string(),
                line_number: 2,
                column_number: 0,
            },
            has_source: true,
            scope_chain: Vec::new(),
        }
    }

    #[test]
    fn moving_to_running_resets_frames_and_bumps_epoch() {
        let mut registry = ThreadRegistry::new();
        registry.mark_paused(1, "breakpoint", vec![frame("main", "/src/app.py")], true);
        assert!(registry.is_paused(1));
        assert!(registry.frames_if_loaded(1).is_some());

        let epoch = registry.resume_epoch(1);
        registry.mark_running(1);
        assert!(!registry.is_paused(1));
        assert!(registry.frames_if_loaded(1).is_none());
        assert_eq!(registry.resume_epoch(1), epoch + 1);
    }

    #[test]
    fn remove_clears_active_selection() {
        let mut registry = ThreadRegistry::new();
        registry.upsert(&[1, 2], ThreadState::Running);
        registry.set_active(2);
        registry.remove(2);
        assert_eq!(registry.active(), None);
        assert_eq!(registry.known_ids(), vec![1]);
    }

    #[test]
    fn switch_banner_requires_a_distinct_previous_thread() {
        let mut registry = ThreadRegistry::new();
        assert_eq!(registry.set_active(1), None);
        assert_eq!(registry.previous_active(), None);

        // Re-selecting the same thread is not a switch.
        assert_eq!(registry.set_active(1), None);

        let banner = registry.set_active(3).expect("switch banner");
        assert_eq!(banner, "Active thread switched from thread #1 to thread #3");
        assert_eq!(registry.previous_active(), Some(1));

        // The previous selection survives a clear.
        registry.clear_active();
        let banner = registry.set_active(1).expect("switch banner");
        assert_eq!(banner, "Active thread switched from thread #3 to thread #1");
    }

    #[test]
    fn describe_reports_top_frame_or_placeholders() {
        let mut registry = ThreadRegistry::new();
        registry.upsert(&[7], ThreadState::Running);
        registry.mark_paused(3, "breakpoint", vec![frame("main", "/src/app.py")], true);

        let payload = registry.describe(3);
        assert_eq!(payload.owning_process_id, -1);
        assert_eq!(payload.stop_thread_id, 3);
        assert_eq!(payload.threads.len(), 2);

        let paused = &payload.threads[0];
        assert_eq!(paused.id, 3);
        assert_eq!(paused.name, "Thread 3");
        assert_eq!(paused.address, "main");
        assert_eq!(paused.stop_reason, "breakpoint");
        assert!(paused.has_source);

        let running = &payload.threads[1];
        assert_eq!(running.id, 7);
        assert_eq!(running.address, "N/A");
        assert_eq!(running.location.script_id, "N/A");
        assert_eq!(running.location.line_number, 0);
        assert_eq!(running.stop_reason, "running");
        assert!(!running.has_source);
    }
}
