//! Retry scheduling for queue elements.
//!
//! Every function here is pure over a queue slice and the `now_ticks` carried
//! by the command being applied. No clock is consulted, so every replica that
//! applies the same command reaches the same queue.
//!
//! An element moves through these classes:
//!
//! ```text
//!   push ──► Available ──pop──► Running ──outcome/timeout──► AwaitingRetry ──delay──► Available
//!                                  │                               │
//!                                  └──── non-retryable / exhausted ┴──► Finished (removed)
//! ```

use serde::{Deserialize, Serialize};

use crate::state::{seconds_to_ticks, AttemptStatus, QueueElement};

/// Where an element stands at a given tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Can be handed out by the next pop.
    Available,
    /// Handed out and not yet acknowledged or timed out.
    Running,
    /// Last attempt failed retryably; the backoff has not elapsed.
    AwaitingRetry,
    /// Will never be handed out again.
    Finished,
}

/// An element handed out by a pop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoppedItem {
    pub id: String,
    pub value: Vec<u8>,
}

/// What a queue outcome callback did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeReport {
    /// The attempt was closed and the element removed.
    Finished,
    /// The attempt was closed; the element will be retried.
    AwaitingRetry,
    /// The element has no running attempt (late callback after a timeout, or
    /// a duplicate). Nothing changed.
    NotRunning,
    UnknownElement,
}

/// Counts exposed to an external autoscaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Elements not yet finished.
    pub length: usize,
    pub available: usize,
    pub running: usize,
}

/// Classifies an element as of `now_ticks`, without mutating it.
///
/// A running attempt past its timeout reports as the sweep would leave it: a
/// retry due immediately, or finished if attempts are exhausted.
pub fn classify(element: &QueueElement, now_ticks: i64) -> Classification {
    let Some(attempt) = element.current_attempt() else {
        return Classification::Available;
    };
    let status = match attempt.status {
        AttemptStatus::Running if is_overdue(element, now_ticks) => {
            AttemptStatus::TimedOut { end: now_ticks }
        }
        AttemptStatus::Running => return Classification::Running,
        closed => closed,
    };
    classify_closed(element, status, now_ticks)
}

fn classify_closed(element: &QueueElement, status: AttemptStatus, now_ticks: i64) -> Classification {
    let attempts = element.attempts().len();
    if attempts >= element.retry.max_attempts() {
        return Classification::Finished;
    }
    match status {
        AttemptStatus::Running => Classification::Running,
        AttemptStatus::Completed { outcome_code, .. } if !element.retry.is_retryable(outcome_code) => {
            Classification::Finished
        }
        AttemptStatus::Completed { end, .. } => {
            let delay = element.retry.delays_seconds[attempts - 1];
            if now_ticks > end.saturating_add(seconds_to_ticks(delay)) {
                Classification::Available
            } else {
                Classification::AwaitingRetry
            }
        }
        // Timeouts are retried without backoff.
        AttemptStatus::TimedOut { end } => {
            if now_ticks >= end {
                Classification::Available
            } else {
                Classification::AwaitingRetry
            }
        }
    }
}

fn is_overdue(element: &QueueElement, now_ticks: i64) -> bool {
    match element.current_attempt() {
        Some(attempt) if attempt.status == AttemptStatus::Running => {
            let deadline = attempt
                .start
                .saturating_add(seconds_to_ticks(element.retry.timeout_seconds));
            deadline <= now_ticks
        }
        _ => false,
    }
}

/// Step 1: closes every overdue running attempt as timed out at `now_ticks`.
/// Returns how many attempts were closed.
pub fn sweep_timeouts(queue: &mut [QueueElement], now_ticks: i64) -> usize {
    let mut closed = 0;
    for element in queue.iter_mut() {
        if is_overdue(element, now_ticks)
            && element.close_attempt(AttemptStatus::TimedOut { end: now_ticks })
        {
            closed += 1;
        }
    }
    closed
}

/// Step 2: removes every element whose closed attempt makes it finished.
/// Returns the removed ids in queue order.
pub fn sweep_finished(queue: &mut Vec<QueueElement>, now_ticks: i64) -> Vec<String> {
    let mut removed = Vec::new();
    queue.retain(|element| {
        let finished = matches!(
            element.current_attempt().map(|a| a.status),
            Some(status) if status != AttemptStatus::Running
                && classify_closed(element, status, now_ticks) == Classification::Finished
        );
        if finished {
            removed.push(element.id.clone());
        }
        !finished
    });
    removed
}

/// Runs a full pop: timeout sweep, finished sweep, then hands out up to
/// `count` available elements in queue order, opening a running attempt on
/// each.
pub fn pop(queue: &mut Vec<QueueElement>, count: u32, now_ticks: i64) -> Vec<PoppedItem> {
    sweep_timeouts(queue, now_ticks);
    sweep_finished(queue, now_ticks);

    let mut popped = Vec::new();
    for element in queue.iter_mut() {
        if popped.len() >= count as usize {
            break;
        }
        if classify(element, now_ticks) == Classification::Available {
            element.start_attempt(now_ticks);
            popped.push(PoppedItem {
                id: element.id.clone(),
                value: element.value.clone(),
            });
        }
    }
    popped
}

/// Closes the running attempt of element `id` with `outcome_code`, removing
/// the element if that finishes it.
pub fn record_outcome(
    queue: &mut Vec<QueueElement>,
    id: &str,
    outcome_code: i32,
    now_ticks: i64,
) -> OutcomeReport {
    let Some(position) = queue.iter().position(|element| element.id == id) else {
        return OutcomeReport::UnknownElement;
    };
    let element = &mut queue[position];
    let status = AttemptStatus::Completed {
        end: now_ticks,
        outcome_code,
    };
    if !element.close_attempt(status) {
        return OutcomeReport::NotRunning;
    }
    if classify_closed(element, status, now_ticks) == Classification::Finished {
        queue.remove(position);
        OutcomeReport::Finished
    } else {
        OutcomeReport::AwaitingRetry
    }
}

/// Counts elements by class as of `now_ticks`.
pub fn stats(queue: &[QueueElement], now_ticks: i64) -> QueueStats {
    let mut stats = QueueStats::default();
    for element in queue {
        match classify(element, now_ticks) {
            Classification::Available => stats.available += 1,
            Classification::Running => stats.running += 1,
            Classification::AwaitingRetry => {}
            Classification::Finished => continue,
        }
        stats.length += 1;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RetryPolicy, TICKS_PER_SECOND};

    const T: i64 = 1_000 * TICKS_PER_SECOND;

    fn policy(timeout_seconds: i32, delays_seconds: Vec<i32>) -> RetryPolicy {
        RetryPolicy {
            timeout_seconds,
            delays_seconds,
            retryable_status_codes: vec![500, 503],
        }
    }

    fn push(queue: &mut Vec<QueueElement>, id: &str, retry: RetryPolicy) {
        queue.push(QueueElement::new(id.into(), id.as_bytes().to_vec(), T, retry));
    }

    fn secs(n: i64) -> i64 {
        n * TICKS_PER_SECOND
    }

    fn ids(items: &[PoppedItem]) -> Vec<&str> {
        items.iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn fresh_element_is_popped_once() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2, 6]));

        let first = pop(&mut queue, 1, T);
        assert_eq!(ids(&first), ["a"]);
        assert_eq!(first[0].value, b"a");
        assert_eq!(queue[0].attempts().len(), 1);
        assert_eq!(queue[0].attempts()[0].status, AttemptStatus::Running);
        assert_eq!(queue[0].attempts()[0].start, T);

        assert!(pop(&mut queue, 1, T).is_empty());
        assert_eq!(classify(&queue[0], T), Classification::Running);
    }

    #[test]
    fn timed_out_attempt_is_reclaimed() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2, 6]));
        pop(&mut queue, 1, T);

        // Still within the timeout.
        assert!(pop(&mut queue, 1, T + secs(29)).is_empty());

        let again = pop(&mut queue, 1, T + secs(31));
        assert_eq!(ids(&again), ["a"]);
        let attempts = queue[0].attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, AttemptStatus::TimedOut { end: T + secs(31) });
        assert_eq!(attempts[1].status, AttemptStatus::Running);
    }

    #[test]
    fn timeout_at_exact_deadline() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2]));
        pop(&mut queue, 1, T);
        assert_eq!(sweep_timeouts(&mut queue, T + secs(30) - 1), 0);
        assert_eq!(sweep_timeouts(&mut queue, T + secs(30)), 1);
    }

    #[test]
    fn success_finishes_element() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2, 6]));
        pop(&mut queue, 1, T);

        assert_eq!(record_outcome(&mut queue, "a", 200, T + 1), OutcomeReport::Finished);
        assert!(queue.is_empty());
        assert!(pop(&mut queue, 1, T + secs(100)).is_empty());
        assert_eq!(stats(&queue, T + secs(100)).length, 0);
    }

    #[test]
    fn retries_exhaust_after_all_delays() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2, 6]));

        let mut now = T;
        assert_eq!(ids(&pop(&mut queue, 1, now)), ["a"]);
        assert_eq!(record_outcome(&mut queue, "a", 500, now), OutcomeReport::AwaitingRetry);

        now += secs(3);
        assert_eq!(ids(&pop(&mut queue, 1, now)), ["a"]);
        assert_eq!(record_outcome(&mut queue, "a", 500, now), OutcomeReport::AwaitingRetry);

        now += secs(7);
        assert_eq!(ids(&pop(&mut queue, 1, now)), ["a"]);
        assert_eq!(record_outcome(&mut queue, "a", 500, now), OutcomeReport::Finished);
        assert!(queue.is_empty());
    }

    #[test]
    fn backoff_delay_is_respected() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2, 6]));
        pop(&mut queue, 1, T);
        record_outcome(&mut queue, "a", 503, T);

        assert!(pop(&mut queue, 1, T + secs(1)).is_empty());
        // The delay must be strictly exceeded.
        assert!(pop(&mut queue, 1, T + secs(2)).is_empty());
        assert_eq!(classify(&queue[0], T + secs(2)), Classification::AwaitingRetry);
        assert_eq!(ids(&pop(&mut queue, 1, T + secs(2) + 1)), ["a"]);
    }

    #[test]
    fn non_retryable_failure_finishes() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2, 6]));
        pop(&mut queue, 1, T);
        assert_eq!(record_outcome(&mut queue, "a", 404, T), OutcomeReport::Finished);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_delays_means_single_attempt() {
        let mut queue = Vec::new();
        push(&mut queue, "fail", policy(30, Vec::new()));
        push(&mut queue, "slow", policy(30, Vec::new()));
        pop(&mut queue, 2, T);

        assert_eq!(record_outcome(&mut queue, "fail", 500, T), OutcomeReport::Finished);

        // A timeout also finishes it: the sweep closes then removes.
        assert!(pop(&mut queue, 1, T + secs(31)).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn exhausted_by_timeouts() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(10, vec![1]));
        pop(&mut queue, 1, T);
        assert_eq!(ids(&pop(&mut queue, 1, T + secs(10))), ["a"]);
        assert!(pop(&mut queue, 1, T + secs(20)).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_respects_count_and_order() {
        let mut queue = Vec::new();
        for id in ["a", "b", "c", "d"] {
            push(&mut queue, id, policy(30, vec![1]));
        }
        assert_eq!(ids(&pop(&mut queue, 2, T)), ["a", "b"]);
        assert_eq!(ids(&pop(&mut queue, 5, T)), ["c", "d"]);
        assert!(pop(&mut queue, 0, T).is_empty());
    }

    #[test]
    fn simultaneous_retries_follow_insertion_order() {
        let mut queue = Vec::new();
        for id in ["z", "a", "m"] {
            push(&mut queue, id, policy(30, vec![5]));
        }
        pop(&mut queue, 3, T);
        // Fail in reverse order at the same tick.
        for id in ["m", "a", "z"] {
            record_outcome(&mut queue, id, 500, T);
        }
        assert_eq!(ids(&pop(&mut queue, 3, T + secs(6))), ["z", "a", "m"]);
    }

    #[test]
    fn zero_count_still_sweeps() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, Vec::new()));
        pop(&mut queue, 1, T);
        assert!(pop(&mut queue, 0, T + secs(30)).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn outcome_for_missing_or_idle_elements() {
        let mut queue = Vec::new();
        push(&mut queue, "a", policy(30, vec![2]));
        assert_eq!(record_outcome(&mut queue, "nope", 200, T), OutcomeReport::UnknownElement);
        // Not popped yet.
        assert_eq!(record_outcome(&mut queue, "a", 200, T), OutcomeReport::NotRunning);

        pop(&mut queue, 1, T);
        sweep_timeouts(&mut queue, T + secs(30));
        // Late callback after the timeout sweep is ignored.
        assert_eq!(record_outcome(&mut queue, "a", 200, T + secs(31)), OutcomeReport::NotRunning);
        assert_eq!(queue[0].attempts().len(), 1);
    }

    #[test]
    fn stats_reflect_classification() {
        let mut queue = Vec::new();
        for id in ["a", "b", "c"] {
            push(&mut queue, id, policy(30, vec![10]));
        }
        pop(&mut queue, 2, T);
        record_outcome(&mut queue, "b", 500, T);

        assert_eq!(
            stats(&queue, T + secs(1)),
            QueueStats {
                length: 3,
                available: 1,
                running: 1,
            }
        );
        // After the timeout "a" would be retried at once; after the delay "b" is due.
        assert_eq!(
            stats(&queue, T + secs(31)),
            QueueStats {
                length: 3,
                available: 3,
                running: 0,
            }
        );
    }
}
