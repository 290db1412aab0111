//! Poll-boundary merge.
//!
//! The polled baseline is authoritative, with three exceptions carried over
//! from the previous model:
//!
//! 1. **Carry-forward**: an iteration that was live (or still holds
//!    unconfirmed events) keeps every event the baseline does not account
//!    for. Confirmed events come first in baseline order; the rest follow in
//!    their previous order. A live event is accounted for once a baseline
//!    event with the same content takes its place.
//! 2. **Live flag**: a baseline iteration stays live if the previous model
//!    had it live and the baseline status is not terminal.
//! 3. **Latch**: an iteration previously closed with a terminal status is
//!    not re-opened by a lagging baseline.
//!
//! Iterations under the placeholder run (live events that arrived before any
//! run id was known) are folded into the baseline's newest active run.

use std::collections::BTreeMap;

use loopwatch_protocol::{GroupedRuns, IterationData, RunData, SessionEvent};

use super::{newest_active_run, PLACEHOLDER_RUN_ID};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub runs: GroupedRuns,
    /// Baseline run that absorbed the placeholder run, if any.
    pub adopted_run: Option<String>,
    /// Events appended from the previous model.
    pub carried_events: usize,
}

pub fn merge_snapshot(previous: &GroupedRuns, baseline: GroupedRuns) -> MergeOutcome {
    let mut merged = baseline;
    let mut carried_events = 0;

    let adopted_run = if previous.contains_key(PLACEHOLDER_RUN_ID)
        && !merged.contains_key(PLACEHOLDER_RUN_ID)
    {
        newest_active_run(&merged)
    } else {
        None
    };

    for (run_id, prev_run) in previous {
        let target_run_id = match (&adopted_run, run_id.as_str()) {
            (Some(adopted), PLACEHOLDER_RUN_ID) => adopted.clone(),
            _ => run_id.clone(),
        };

        for (index, prev_iteration) in &prev_run.iterations {
            if needs_carry(prev_iteration) {
                carried_events += carry_iteration(
                    &mut merged,
                    &target_run_id,
                    prev_run,
                    *index,
                    prev_iteration,
                );
            } else {
                latch_closed(&mut merged, &target_run_id, *index, prev_iteration);
            }
        }
    }

    MergeOutcome {
        runs: merged,
        adopted_run,
        carried_events,
    }
}

fn needs_carry(iteration: &IterationData) -> bool {
    iteration.is_live || iteration.events.iter().any(|event| event.is_live())
}

fn carry_iteration(
    merged: &mut GroupedRuns,
    run_id: &str,
    prev_run: &RunData,
    index: u32,
    prev_iteration: &IterationData,
) -> usize {
    let run = merged
        .entry(run_id.to_string())
        .or_insert_with(|| run_shell(prev_run));

    let carried = match run.iterations.get_mut(&index) {
        None => {
            run.iterations.insert(index, prev_iteration.clone());
            prev_iteration.events.len()
        }
        Some(confirmed) => {
            let pending = unconfirmed_events(confirmed, prev_iteration);
            let carried = pending.len();
            confirmed.events.extend(pending);
            if confirmed.session_id.is_empty() {
                confirmed.session_id = prev_iteration.session_id.clone();
            }
            if prev_iteration.is_live && !confirmed.status.is_terminal() {
                confirmed.is_live = true;
            }
            if !prev_iteration.is_live && prev_iteration.status.is_terminal() {
                close_like(confirmed, prev_iteration);
            }
            carried
        }
    };

    sync_counters(run);
    carried
}

/// Events of `previous` the baseline does not account for, in timeline order.
///
/// A previous event is accounted for when its id is in the baseline, or,
/// for a live event, when it pairs with a baseline event of the same
/// content. Each baseline event pairs with at most one live event, and only
/// baseline events not already present by id in `previous` take part.
fn unconfirmed_events(confirmed: &IterationData, previous: &IterationData) -> Vec<SessionEvent> {
    let confirmed_ids = confirmed.event_ids();
    let previous_ids = previous.event_ids();
    let mut unpaired: Vec<&SessionEvent> = confirmed
        .events
        .iter()
        .filter(|event| !previous_ids.contains(&event.id))
        .collect();

    let mut pending = Vec::new();
    for event in &previous.events {
        if confirmed_ids.contains(&event.id) {
            continue;
        }
        if event.is_live() {
            if let Some(pos) = unpaired.iter().position(|c| same_occurrence(c, event)) {
                unpaired.remove(pos);
                continue;
            }
        }
        pending.push(event.clone());
    }
    pending
}

/// Content equality, ignoring id, session and timestamp.
pub(crate) fn same_occurrence(a: &SessionEvent, b: &SessionEvent) -> bool {
    a.event_type == b.event_type
        && a.content == b.content
        && a.tool_name == b.tool_name
        && a.tool_input == b.tool_input
        && a.tool_use_id == b.tool_use_id
        && a.tool_result == b.tool_result
        && a.success == b.success
        && a.error_message == b.error_message
}

fn latch_closed(
    merged: &mut GroupedRuns,
    run_id: &str,
    index: u32,
    prev_iteration: &IterationData,
) {
    if prev_iteration.is_live || !prev_iteration.status.is_terminal() {
        return;
    }
    if let Some(confirmed) = merged
        .get_mut(run_id)
        .and_then(|run| run.iterations.get_mut(&index))
    {
        close_like(confirmed, prev_iteration);
    }
}

fn close_like(confirmed: &mut IterationData, closed: &IterationData) {
    if !confirmed.status.is_terminal() {
        confirmed.status = closed.status;
    }
    confirmed.is_live = false;
}

fn run_shell(prev_run: &RunData) -> RunData {
    RunData {
        status: prev_run.status,
        loop_name: prev_run.loop_name.clone(),
        started_at: prev_run.started_at.clone(),
        completed_at: prev_run.completed_at.clone(),
        iteration_count: 0,
        event_count: 0,
        iterations: BTreeMap::new(),
    }
}

pub(crate) fn sync_counters(run: &mut RunData) {
    let iterations = u32::try_from(run.iterations.len()).unwrap_or(u32::MAX);
    let events = u32::try_from(run.total_events()).unwrap_or(u32::MAX);
    run.iteration_count = run.iteration_count.max(iterations);
    run.event_count = run.event_count.max(events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwatch_protocol::{
        EventKind, IterationStatus, RunStatus, SessionEvent, SYNTHETIC_ID_FLOOR,
    };

    fn event(id: u64, content: &str) -> SessionEvent {
        let mut event = SessionEvent::new(id, "s-1", EventKind::Text);
        event.content = Some(content.to_string());
        event
    }

    fn iteration(is_live: bool, status: IterationStatus, events: Vec<SessionEvent>) -> IterationData {
        IterationData {
            session_id: "s-1".to_string(),
            mode: None,
            status,
            is_live,
            events,
        }
    }

    fn runs_with(run_id: &str, status: RunStatus, index: u32, data: IterationData) -> GroupedRuns {
        let mut run = RunData {
            status,
            loop_name: "docs".to_string(),
            ..RunData::default()
        };
        run.iterations.insert(index, data);
        let mut runs = GroupedRuns::new();
        runs.insert(run_id.to_string(), run);
        runs
    }

    fn live_id(n: u64) -> u64 {
        SYNTHETIC_ID_FLOOR + n
    }

    #[test]
    fn live_iteration_missing_from_baseline_survives() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            2,
            iteration(true, IterationStatus::Running, vec![event(live_id(1), "hello")]),
        );

        let outcome = merge_snapshot(&previous, GroupedRuns::new());
        let survived = &outcome.runs["run-1"].iterations[&2];
        assert_eq!(survived.events.len(), 1);
        assert!(survived.is_live);
        assert_eq!(outcome.carried_events, 1);
        assert_eq!(outcome.runs["run-1"].loop_name, "docs");
    }

    #[test]
    fn confirmed_events_supersede_live_copies() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(
                true,
                IterationStatus::Running,
                vec![event(3, "a"), event(live_id(1), "b")],
            ),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(
                false,
                IterationStatus::Running,
                vec![event(3, "a"), event(4, "b")],
            ),
        );

        let outcome = merge_snapshot(&previous, baseline);
        let merged = &outcome.runs["run-1"].iterations[&1];
        let ids: Vec<u64> = merged.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4], "live copy must not duplicate confirmed event");
        assert!(merged.is_live, "live flag is kept while the poll lags");
        assert_eq!(outcome.carried_events, 0);
    }

    #[test]
    fn partial_baseline_keeps_unconfirmed_tail() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(
                true,
                IterationStatus::Running,
                vec![event(live_id(1), "a"), event(live_id(2), "b"), event(live_id(3), "c")],
            ),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(false, IterationStatus::Running, vec![event(1, "a")]),
        );

        let outcome = merge_snapshot(&previous, baseline.clone());
        let merged = &outcome.runs["run-1"].iterations[&1];
        let ids: Vec<u64> = merged.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, live_id(2), live_id(3)]);
        assert_eq!(outcome.carried_events, 2);
        assert!(merged.is_live);

        let again = merge_snapshot(&outcome.runs, baseline);
        assert_eq!(again.runs, outcome.runs, "lagging poll repeated is stable");

        let caught_up = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(
                false,
                IterationStatus::Running,
                vec![event(1, "a"), event(2, "b"), event(3, "c")],
            ),
        );
        let settled = merge_snapshot(&again.runs, caught_up);
        let ids: Vec<u64> = settled.runs["run-1"].iterations[&1]
            .events
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3], "caught-up baseline replaces live copies");
    }

    #[test]
    fn repeated_content_pairs_one_to_one() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(
                true,
                IterationStatus::Running,
                vec![event(live_id(1), "ok"), event(live_id(2), "ok")],
            ),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(false, IterationStatus::Running, vec![event(1, "ok")]),
        );

        let outcome = merge_snapshot(&previous, baseline);
        let ids: Vec<u64> = outcome.runs["run-1"].iterations[&1]
            .events
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, live_id(2)]);
    }

    #[test]
    fn confirmed_event_already_held_does_not_absorb_live_repeat() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(
                true,
                IterationStatus::Running,
                vec![event(1, "ok"), event(live_id(1), "ok")],
            ),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(false, IterationStatus::Running, vec![event(1, "ok")]),
        );

        let outcome = merge_snapshot(&previous, baseline);
        assert_eq!(outcome.runs["run-1"].iterations[&1].events.len(), 2);
    }

    #[test]
    fn empty_confirmed_iteration_receives_live_events() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            4,
            iteration(true, IterationStatus::Running, vec![event(live_id(9), "x")]),
        );
        let mut baseline_iteration = iteration(false, IterationStatus::Running, vec![]);
        baseline_iteration.session_id.clear();
        let baseline = runs_with("run-1", RunStatus::Running, 4, baseline_iteration);

        let outcome = merge_snapshot(&previous, baseline);
        let merged = &outcome.runs["run-1"].iterations[&4];
        assert_eq!(merged.events.len(), 1);
        assert_eq!(merged.session_id, "s-1");
        assert!(merged.is_live);
    }

    #[test]
    fn terminal_baseline_turns_live_flag_off() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(true, IterationStatus::Running, vec![event(live_id(1), "x")]),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Completed,
            1,
            iteration(false, IterationStatus::Completed, vec![event(5, "x")]),
        );

        let outcome = merge_snapshot(&previous, baseline);
        assert!(!outcome.runs["run-1"].iterations[&1].is_live);
    }

    #[test]
    fn closed_iteration_is_not_reopened_by_lagging_poll() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(false, IterationStatus::Completed, vec![event(5, "x")]),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(true, IterationStatus::Running, vec![event(5, "x")]),
        );

        let outcome = merge_snapshot(&previous, baseline);
        let merged = &outcome.runs["run-1"].iterations[&1];
        assert!(!merged.is_live);
        assert_eq!(merged.status, IterationStatus::Completed);
    }

    #[test]
    fn closed_iteration_with_unconfirmed_events_is_carried() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            3,
            iteration(false, IterationStatus::Completed, vec![event(live_id(2), "done")]),
        );

        let outcome = merge_snapshot(&previous, GroupedRuns::new());
        let merged = &outcome.runs["run-1"].iterations[&3];
        assert_eq!(merged.events.len(), 1);
        assert!(!merged.is_live);
    }

    #[test]
    fn placeholder_run_is_adopted_by_active_baseline_run() {
        let previous = runs_with(
            PLACEHOLDER_RUN_ID,
            RunStatus::Running,
            1,
            iteration(true, IterationStatus::Running, vec![event(live_id(1), "hi")]),
        );
        let mut baseline = runs_with(
            "run-old",
            RunStatus::Completed,
            1,
            iteration(false, IterationStatus::Completed, vec![event(1, "old")]),
        );
        let mut active = RunData {
            status: RunStatus::Running,
            started_at: Some("2026-02-01T00:00:00Z".to_string()),
            ..RunData::default()
        };
        active.iterations.insert(
            1,
            iteration(false, IterationStatus::Running, vec![]),
        );
        baseline.insert("run-new".to_string(), active);

        let outcome = merge_snapshot(&previous, baseline);
        assert_eq!(outcome.adopted_run.as_deref(), Some("run-new"));
        assert!(!outcome.runs.contains_key(PLACEHOLDER_RUN_ID));
        let adopted = &outcome.runs["run-new"].iterations[&1];
        assert_eq!(adopted.events.len(), 1);
        assert!(adopted.is_live);
        assert_eq!(outcome.runs["run-old"].iterations[&1].events.len(), 1);
    }

    #[test]
    fn placeholder_stays_when_no_active_run_exists() {
        let previous = runs_with(
            PLACEHOLDER_RUN_ID,
            RunStatus::Running,
            1,
            iteration(true, IterationStatus::Running, vec![event(live_id(1), "hi")]),
        );

        let outcome = merge_snapshot(&previous, GroupedRuns::new());
        assert!(outcome.adopted_run.is_none());
        assert_eq!(outcome.runs[PLACEHOLDER_RUN_ID].iterations[&1].events.len(), 1);
    }

    #[test]
    fn merging_same_baseline_twice_is_stable() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            2,
            iteration(true, IterationStatus::Running, vec![event(live_id(1), "live")]),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(false, IterationStatus::Completed, vec![event(1, "done")]),
        );

        let first = merge_snapshot(&previous, baseline.clone());
        let second = merge_snapshot(&first.runs, baseline);
        assert_eq!(first.runs, second.runs);
    }

    #[test]
    fn counters_cover_carried_iterations() {
        let previous = runs_with(
            "run-1",
            RunStatus::Running,
            2,
            iteration(true, IterationStatus::Running, vec![event(live_id(1), "a")]),
        );
        let baseline = runs_with(
            "run-1",
            RunStatus::Running,
            1,
            iteration(false, IterationStatus::Completed, vec![event(1, "b"), event(2, "c")]),
        );

        let outcome = merge_snapshot(&previous, baseline);
        let run = &outcome.runs["run-1"];
        assert_eq!(run.iteration_count, 2);
        assert_eq!(run.event_count, 3);
    }
}
