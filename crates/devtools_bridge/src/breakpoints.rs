//! Canonical breakpoint ledger with per-file bulk synchronization.
//!
//! The client speaks in per-line create/remove commands while the adapter
//! only accepts full replacement of a file's breakpoints. The ledger owns
//! the canonical set, derives the bulk `setBreakpoints` calls, and folds the
//! adapter's answers (ids, verification, relocated lines) back into its
//! records. Lines are stored in the adapter's 1-based coordinates.

use std::sync::Arc;

use dap_session::{
    types::{Breakpoint, BreakpointEventBody, SourceBreakpoint},
    AdapterSession,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    callback::ClientCallback,
    error::BridgeError,
    protocol::{
        emit_event, to_client_line, BreakpointHitCountPayload, BreakpointResolvedPayload, Location,
    },
};

/// Synthetic ids live far above anything adapters hand out so the two
/// allocation sources can share the stringified id namespace.
const SYNTHETIC_ID_BASE: i64 = 1_000_000_000;

#[derive(Clone, Debug)]
pub struct BreakpointRecord {
    key: u64,
    pub id: Option<i64>,
    pub path: String,
    /// Current adapter line, updated when the adapter relocates the
    /// breakpoint.
    pub line: i64,
    /// The line originally requested, kept so adapter events still match
    /// after a relocation.
    pub original_line: i64,
    pub condition: Option<String>,
    pub hit_count: i64,
    pub resolved: bool,
}

/// Correlation handle returned by [`BreakpointLedger::stage`].
#[derive(Clone, Copy, Debug)]
pub struct StagedHandle {
    key: u64,
}

/// Read-only view of one record, for building client responses.
#[derive(Clone, Debug)]
pub struct BreakpointSnapshot {
    pub id: Option<i64>,
    pub path: String,
    pub line: i64,
    pub resolved: bool,
}

impl BreakpointSnapshot {
    pub fn id_string(&self) -> String {
        self.id.map(|id| id.to_string()).unwrap_or_default()
    }
}

#[derive(Default)]
struct LedgerState {
    records: Vec<BreakpointRecord>,
    next_key: u64,
    next_synthetic_id: i64,
}

enum EventEffect {
    Resolved(BreakpointSnapshot),
    HitCountChanged { id: String, hit_count: i64 },
}

impl LedgerState {
    fn new() -> Self {
        Self {
            next_synthetic_id: SYNTHETIC_ID_BASE,
            ..Self::default()
        }
    }

    fn stage(&mut self, path: &str, line: i64, condition: Option<String>) -> StagedHandle {
        // Last write wins for a (path, line) pair; records on other lines
        // keep their insertion order.
        self.records
            .retain(|record| !(record.path == path && record.line == line));
        let key = self.next_key;
        self.next_key += 1;
        self.records.push(BreakpointRecord {
            key,
            id: None,
            path: path.to_string(),
            line,
            original_line: line,
            condition,
            hit_count: 0,
            resolved: false,
        });
        StagedHandle { key }
    }

    fn file_request(&self, path: &str) -> (Vec<u64>, Vec<SourceBreakpoint>) {
        let records: Vec<&BreakpointRecord> = self
            .records
            .iter()
            .filter(|record| record.path == path)
            .collect();
        let keys = records.iter().map(|record| record.key).collect();
        let breakpoints = records
            .iter()
            .map(|record| SourceBreakpoint {
                line: record.line,
                column: None,
                condition: record.condition.clone(),
            })
            .collect();
        (keys, breakpoints)
    }

    fn apply_response(&mut self, keys: &[u64], reported: Vec<Breakpoint>) {
        let mut next_synthetic = self.next_synthetic_id;
        for (key, reported) in keys.iter().zip(reported) {
            let Some(record) = self.records.iter_mut().find(|record| record.key == *key) else {
                continue;
            };
            if record.id.is_none() {
                record.id = Some(reported.id.unwrap_or_else(|| {
                    let id = next_synthetic;
                    next_synthetic += 1;
                    id
                }));
            }
            if reported.verified {
                record.resolved = true;
            }
            if let Some(line) = reported.line {
                if line != record.line {
                    record.line = line;
                }
            }
        }
        self.next_synthetic_id = next_synthetic;
    }

    fn find_event_match(&self, breakpoint: &Breakpoint) -> Option<usize> {
        if let Some(id) = breakpoint.id {
            return self.records.iter().position(|record| record.id == Some(id));
        }
        let path = breakpoint.source.as_ref().and_then(|s| s.path.as_deref())?;
        let line = breakpoint.line?;
        self.records.iter().position(|record| {
            record.id.is_none()
                && record.path == path
                && (record.original_line == line || record.line == line)
        })
    }

    fn apply_event(&mut self, breakpoint: &Breakpoint) -> Vec<EventEffect> {
        let Some(index) = self.find_event_match(breakpoint) else {
            debug!("breakpoint event did not match a staged breakpoint");
            return Vec::new();
        };
        let record = &mut self.records[index];
        let mut effects = Vec::new();
        if breakpoint.verified && !record.resolved {
            record.resolved = true;
            effects.push(EventEffect::Resolved(BreakpointSnapshot {
                id: record.id,
                path: record.path.clone(),
                line: record.line,
                resolved: true,
            }));
        }
        if let Some(count) = breakpoint.hit_count {
            if count != record.hit_count {
                record.hit_count = count;
                effects.push(EventEffect::HitCountChanged {
                    id: record.id.map(|id| id.to_string()).unwrap_or_default(),
                    hit_count: count,
                });
            }
        }
        effects
    }

    fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for record in &self.records {
            if !paths.contains(&record.path) {
                paths.push(record.path.clone());
            }
        }
        paths
    }
}

/// The translator-owned canonical breakpoint set.
pub struct BreakpointLedger {
    session: Arc<AdapterSession>,
    callback: Arc<dyn ClientCallback>,
    state: Mutex<LedgerState>,
}

impl BreakpointLedger {
    pub fn new(session: Arc<AdapterSession>, callback: Arc<dyn ClientCallback>) -> Self {
        Self {
            session,
            callback,
            state: Mutex::new(LedgerState::new()),
        }
    }

    /// Create (or supersede) a record without contacting the adapter.
    /// `line` is the adapter's 1-based line.
    pub async fn stage(&self, path: &str, line: i64, condition: Option<String>) -> StagedHandle {
        self.state.lock().await.stage(path, line, condition)
    }

    /// Push the full current set for `path` to the adapter and fold the
    /// answer back: assign ids (adapter-supplied, else synthetic), mark
    /// verified records resolved, and adopt relocated lines.
    pub async fn sync_file(&self, path: &str) -> Result<(), BridgeError> {
        let (keys, breakpoints) = self.state.lock().await.file_request(path);
        let response = self.session.set_breakpoints(path, &breakpoints).await?;
        if response.breakpoints.len() != keys.len() {
            return Err(BridgeError::BreakpointMismatch {
                path: path.to_string(),
                expected: keys.len(),
                actual: response.breakpoints.len(),
            });
        }
        self.state
            .lock()
            .await
            .apply_response(&keys, response.breakpoints);
        Ok(())
    }

    /// Drop the record with the given adapter id and re-sync its file.
    pub async fn remove(&self, id: i64) -> Result<(), BridgeError> {
        let path = {
            let mut state = self.state.lock().await;
            let Some(index) = state.records.iter().position(|record| record.id == Some(id)) else {
                debug!(id, "remove for an unknown breakpoint id");
                return Ok(());
            };
            state.records.remove(index).path
        };
        self.sync_file(&path).await
    }

    /// Re-sync every file with at least one record. Used after an adapter
    /// restart.
    pub async fn sync_all(&self) -> Result<(), BridgeError> {
        let paths = self.state.lock().await.paths();
        for path in paths {
            self.sync_file(&path).await?;
        }
        Ok(())
    }

    /// Fold an adapter `breakpoint` event into the matching record and
    /// notify the client of resolution and hit-count changes. Unmatched
    /// events are dropped.
    pub async fn on_breakpoint_event(&self, body: &BreakpointEventBody) {
        let effects = self.state.lock().await.apply_event(&body.breakpoint);
        for effect in effects {
            match effect {
                EventEffect::Resolved(snapshot) => {
                    emit_event(
                        self.callback.as_ref(),
                        "Debugger.breakpointResolved",
                        &BreakpointResolvedPayload {
                            breakpoint_id: snapshot.id_string(),
                            location: Location {
                                script_id: snapshot.path,
                                line_number: to_client_line(snapshot.line),
                                column_number: 0,
                            },
                        },
                    );
                }
                EventEffect::HitCountChanged { id, hit_count } => {
                    emit_event(
                        self.callback.as_ref(),
                        "Debugger.breakpointHitCountChanged",
                        &BreakpointHitCountPayload {
                            breakpoint_id: id,
                            hit_count,
                        },
                    );
                }
            }
        }
    }

    /// The current view of a staged record, if it still exists.
    pub async fn snapshot(&self, handle: &StagedHandle) -> Option<BreakpointSnapshot> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .find(|record| record.key == handle.key)
            .map(|record| BreakpointSnapshot {
                id: record.id,
                path: record.path.clone(),
                line: record.line,
                resolved: record.resolved,
            })
    }
}
