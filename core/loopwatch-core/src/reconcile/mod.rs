//! Reconciliation of the live stream with the polled snapshot.
//!
//! [`Reconciler`] is the single writer of the run tree. Each call to
//! [`Reconciler::apply_live`] or [`Reconciler::apply_snapshot`] is one
//! synchronous step; callers never observe a partially applied update.
//!
//! # Target resolution for live events
//!
//! 1. Explicit `run_id` / `iteration` in the payload win.
//! 2. Otherwise the live context (set by the previous live event or by a
//!    `status` announcement) fills the gaps.
//! 3. A `status` event with no known run attaches to the newest active run,
//!    or to the placeholder run [`PLACEHOLDER_RUN_ID`] until a poll reveals
//!    the real one.
//!
//! Events that still cannot be placed are dropped; the next poll recovers
//! their persisted versions.

mod ids;
mod merge;

pub use ids::SyntheticIds;
pub use merge::{merge_snapshot, MergeOutcome};

use std::collections::HashMap;

use chrono::Utc;
use loopwatch_protocol::{
    GroupedRuns, IterationData, IterationStatus, LiveRef, RunData, RunStatus, SessionEvent,
    StreamEvent, StreamPayload,
};
use serde_json::Value;
use tracing::debug;

use merge::{same_occurrence, sync_counters};

/// Run key used for live events that arrive before any run id is known.
pub const PLACEHOLDER_RUN_ID: &str = "live";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveContext {
    pub run_id: Option<String>,
    pub iteration: Option<u32>,
    pub session_id: Option<String>,
}

pub struct Reconciler {
    runs: GroupedRuns,
    context: LiveContext,
    ids: SyntheticIds,
    /// Set after a stream reconnect: per-iteration position of the next
    /// event a replaying server is expected to resend.
    replay: Option<HashMap<(String, u32), usize>>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::with_ids(SyntheticIds::new())
    }

    pub fn with_ids(ids: SyntheticIds) -> Self {
        Self {
            runs: GroupedRuns::new(),
            context: LiveContext::default(),
            ids,
            replay: None,
        }
    }

    pub fn runs(&self) -> &GroupedRuns {
        &self.runs
    }

    pub fn context(&self) -> &LiveContext {
        &self.context
    }

    /// Merges a successful poll into the model.
    pub fn apply_snapshot(&mut self, baseline: GroupedRuns) -> MergeOutcome {
        let previous = std::mem::take(&mut self.runs);
        let outcome = merge_snapshot(&previous, baseline);
        self.runs = outcome.runs.clone();

        if let Some(adopted) = &outcome.adopted_run {
            if self.context.run_id.as_deref() == Some(PLACEHOLDER_RUN_ID) {
                debug!(run_id = %adopted, "Live context moved from placeholder run");
                self.context.run_id = Some(adopted.clone());
            }
        }
        debug!(
            runs = self.runs.len(),
            carried_events = outcome.carried_events,
            "Snapshot merged"
        );
        outcome
    }

    /// Applies one live event. Returns `true` when the run tree changed.
    pub fn apply_live(&mut self, event: &StreamEvent) -> bool {
        match &event.payload {
            StreamPayload::Init | StreamPayload::SessionStart => {
                if let Some(session_id) = &event.live.session_id {
                    self.context.session_id = Some(session_id.clone());
                }
                return false;
            }
            StreamPayload::Status { status } => {
                return self.apply_status(&event.live, status.as_deref());
            }
            _ if event.kind().is_control() => return false,
            _ => {}
        }

        let Some((run_id, index)) = self.resolve_target(&event.live) else {
            debug!(event_type = event.kind().as_str(), "Dropping live event without context");
            return false;
        };

        if self.skip_replayed(&run_id, index, event) {
            let completed = matches!(event.payload, StreamPayload::Complete { .. });
            self.context.run_id = Some(run_id);
            self.context.iteration = (!completed).then_some(index);
            return false;
        }

        let fallback_session = self.context.session_id.clone();
        let id = self.ids.next_id();
        let run = self
            .runs
            .entry(run_id.clone())
            .or_insert_with(new_live_run);
        let iteration = run.iterations.entry(index).or_insert_with(|| {
            new_live_iteration(event.live.session_id.clone().or(fallback_session.clone()))
        });

        let session_id = event
            .live
            .session_id
            .clone()
            .or_else(|| Some(iteration.session_id.clone()).filter(|s| !s.is_empty()))
            .or(fallback_session)
            .unwrap_or_default();
        if iteration.session_id.is_empty() {
            iteration.session_id = session_id.clone();
        }
        iteration.events.push(build_event(id, session_id, event));

        let completed = matches!(event.payload, StreamPayload::Complete { .. });
        if completed {
            iteration.is_live = false;
            iteration.status = IterationStatus::Completed;
        } else {
            mark_live(iteration);
        }
        sync_counters(run);

        self.context.run_id = Some(run_id);
        self.context.iteration = if completed { None } else { Some(index) };
        if let Some(session_id) = &event.live.session_id {
            self.context.session_id = Some(session_id.clone());
        }
        true
    }

    /// Call when the stream reconnects. Events the server resends from the
    /// start of an iteration are skipped until the first one that differs
    /// from what the model already holds at that position.
    pub fn stream_reconnected(&mut self) {
        debug!("Expecting stream replay");
        self.replay = Some(HashMap::new());
    }

    fn skip_replayed(&mut self, run_id: &str, index: u32, event: &StreamEvent) -> bool {
        let Some(cursors) = self.replay.as_mut() else {
            return false;
        };
        let key = (run_id.to_string(), index);
        let position = cursors.get(&key).copied().unwrap_or(0);
        let candidate = build_event(0, String::new(), event);
        let replayed = self
            .runs
            .get(run_id)
            .and_then(|run| run.iterations.get(&index))
            .and_then(|iteration| iteration.events.get(position))
            .is_some_and(|held| same_occurrence(held, &candidate));

        if replayed {
            cursors.insert(key, position + 1);
        } else {
            debug!(run_id, iteration = index, position, "Stream replay ended");
            self.replay = None;
        }
        replayed
    }

    fn apply_status(&mut self, live: &LiveRef, status: Option<&str>) -> bool {
        let run_id = live
            .run_id
            .clone()
            .or_else(|| self.context.run_id.clone())
            .or_else(|| newest_active_run(&self.runs))
            .unwrap_or_else(|| PLACEHOLDER_RUN_ID.to_string());
        let same_run = self.context.run_id.as_deref() == Some(run_id.as_str());
        let index = live
            .iteration
            .or(if same_run { self.context.iteration } else { None });

        let mut changed = !self.runs.contains_key(&run_id);
        let run = self
            .runs
            .entry(run_id.clone())
            .or_insert_with(new_live_run);

        match status.and_then(RunStatus::parse) {
            Some(parsed) if parsed != run.status => {
                run.status = parsed;
                changed = true;
            }
            Some(_) => {}
            None => debug!(status = ?status, "Unrecognized run status ignored"),
        }

        if let Some(index) = index {
            let session_id = live
                .session_id
                .clone()
                .or_else(|| self.context.session_id.clone());
            let iteration = run.iterations.entry(index).or_insert_with(|| {
                changed = true;
                new_live_iteration(session_id)
            });
            if !iteration.is_live && !is_closed(iteration) {
                mark_live(iteration);
                changed = true;
            }
            sync_counters(run);
        }

        self.context.run_id = Some(run_id);
        self.context.iteration = index;
        if let Some(session_id) = &live.session_id {
            self.context.session_id = Some(session_id.clone());
        }
        changed
    }

    fn resolve_target(&self, live: &LiveRef) -> Option<(String, u32)> {
        let run_id = live.run_id.clone().or_else(|| self.context.run_id.clone())?;
        let same_run = self.context.run_id.as_deref() == Some(run_id.as_str());

        let index = match live.iteration {
            Some(index) => Some(index),
            None if same_run => self.context.iteration,
            None => self.runs.get(&run_id).and_then(latest_live_iteration),
        }?;
        Some((run_id, index))
    }
}

/// Newest run that is running or paused, by `started_at` then key.
pub(crate) fn newest_active_run(runs: &GroupedRuns) -> Option<String> {
    runs.iter()
        .filter(|(_, run)| run.status.is_active())
        .max_by(|(a_id, a), (b_id, b)| a.started_at.cmp(&b.started_at).then(a_id.cmp(b_id)))
        .map(|(id, _)| id.clone())
}

fn latest_live_iteration(run: &RunData) -> Option<u32> {
    run.iterations
        .iter()
        .rev()
        .find(|(_, iteration)| iteration.is_live)
        .map(|(index, _)| *index)
}

fn is_closed(iteration: &IterationData) -> bool {
    !iteration.is_live && iteration.status.is_terminal()
}

fn mark_live(iteration: &mut IterationData) {
    if is_closed(iteration) {
        return;
    }
    iteration.is_live = true;
    if iteration.status == IterationStatus::Pending {
        iteration.status = IterationStatus::Running;
    }
}

fn new_live_run() -> RunData {
    RunData {
        status: RunStatus::Running,
        started_at: Some(Utc::now().to_rfc3339()),
        ..RunData::default()
    }
}

fn new_live_iteration(session_id: Option<String>) -> IterationData {
    IterationData {
        session_id: session_id.unwrap_or_default(),
        mode: None,
        status: IterationStatus::Running,
        is_live: true,
        events: Vec::new(),
    }
}

fn build_event(id: u64, session_id: String, event: &StreamEvent) -> SessionEvent {
    let mut record = SessionEvent::new(id, session_id, event.kind());
    record.timestamp = event
        .live
        .timestamp
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    match &event.payload {
        StreamPayload::Text { content, role } => {
            record.content = Some(content.clone());
            record.metadata = role
                .as_ref()
                .map(|role| serde_json::json!({ "role": role }));
        }
        StreamPayload::Thinking { content } => record.content = Some(content.clone()),
        StreamPayload::ToolCall { name, input, id } => {
            record.tool_name = Some(name.clone());
            record.tool_input = Some(input.clone()).filter(|input| !input.is_null());
            record.tool_use_id = id.clone();
        }
        StreamPayload::ToolResult {
            tool_use_id,
            result,
            success,
        } => {
            record.tool_use_id = tool_use_id.clone();
            record.tool_result = result.clone();
            record.success = *success;
        }
        StreamPayload::Error { message } => record.error_message = Some(message.clone()),
        StreamPayload::Usage { usage } => record.metadata = Some(usage.clone()),
        StreamPayload::Complete { detail } => {
            record.metadata = Some(detail.clone()).filter(|detail| !is_empty_object(detail));
        }
        _ => {}
    }
    record
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(|map| map.is_empty()).unwrap_or(false)
}
