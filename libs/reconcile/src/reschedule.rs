//! Reschedule policy engine.
//!
//! Decides whether a failed allocation may be replaced and how long to wait
//! first. All functions take `now` explicitly and never read the clock.

use std::time::Duration;

use chrono::{DateTime, Utc};

use convoy_structs::{
    AllocClientStatus, AllocDesiredStatus, Allocation, DelayFunction, RescheduleEvent,
    ReschedulePolicy, RescheduleTracker,
};

/// History retained along a chain when the policy is unlimited.
pub const MAX_PAST_RESCHEDULE_EVENTS: usize = 5;

/// Allocations eligible within this window are replaced immediately.
pub const RESCHEDULE_WINDOW: Duration = Duration::from_secs(1);

/// Reschedule-later allocations within this window share a follow-up eval.
pub const BATCHED_FAILED_ALLOC_WINDOW: Duration = Duration::from_secs(5);

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}

fn from_chrono(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// When the allocation last failed. Falls back to the last modify time for
/// records without state history.
pub fn last_event_time(alloc: &Allocation) -> DateTime<Utc> {
    alloc
        .alloc_states
        .iter()
        .rev()
        .find(|s| s.client_status == AllocClientStatus::Failed)
        .map_or(alloc.modify_time, |s| s.time)
}

/// Delay before the next attempt, given the history so far.
pub fn next_delay(
    policy: &ReschedulePolicy,
    events: &[RescheduleEvent],
    last_event: DateTime<Utc>,
) -> Duration {
    let Some(last) = events.last() else {
        return policy.delay;
    };

    let mut delay = match policy.delay_function {
        DelayFunction::Constant => return policy.delay,
        DelayFunction::Linear => last.delay + policy.delay,
        DelayFunction::Exponential => last.delay * 2,
        DelayFunction::Fibonacci => match events {
            [.., n2, n1] if n2.delay == policy.max_delay && n1.delay == policy.delay => n1.delay,
            [.., n2, n1] => n1.delay + n2.delay,
            _ => policy.delay,
        },
    };

    if !policy.max_delay.is_zero() && delay > policy.max_delay {
        delay = policy.max_delay;
        // A long quiet period after hitting the ceiling starts a new series.
        let since_last = from_chrono(last_event - last.reschedule_time);
        if since_last > delay {
            delay = policy.delay;
        }
    }
    delay
}

/// Number of events inside the policy interval ending at `fail_time`.
pub fn attempts_in_interval(
    policy: &ReschedulePolicy,
    events: &[RescheduleEvent],
    fail_time: DateTime<Utc>,
) -> u32 {
    let interval = to_chrono(policy.interval);
    events
        .iter()
        .filter(|e| fail_time - e.reschedule_time < interval)
        .count() as u32
}

/// Earliest time a replacement may be placed, and whether one is allowed
/// at all, measured from `fail_time`.
pub fn reschedule_time_from(
    alloc: &Allocation,
    policy: &ReschedulePolicy,
    fail_time: DateTime<Utc>,
) -> (DateTime<Utc>, bool) {
    let events = alloc.reschedule_events();
    let delay = next_delay(policy, events, last_event_time(alloc));
    let when = fail_time
        .checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let eligible = if policy.unlimited {
        true
    } else if policy.attempts == 0 {
        false
    } else if events.is_empty() {
        true
    } else {
        attempts_in_interval(policy, events, fail_time) < policy.attempts && delay < policy.interval
    };
    (when, eligible)
}

/// Reschedule time for a failed allocation. Only failed allocations the
/// servers still want running are candidates.
pub fn next_reschedule_time(
    alloc: &Allocation,
    policy: &ReschedulePolicy,
) -> Option<(DateTime<Utc>, bool)> {
    if alloc.desired_status == AllocDesiredStatus::Stop
        || alloc.client_status != AllocClientStatus::Failed
    {
        return None;
    }
    Some(reschedule_time_from(alloc, policy, last_event_time(alloc)))
}

/// Tracker for the replacement of `prev`, carrying over pruned history plus
/// one new event for this attempt.
pub fn next_tracker(
    prev: &Allocation,
    policy: Option<&ReschedulePolicy>,
    now: DateTime<Utc>,
) -> RescheduleTracker {
    let history = prev.reschedule_events();
    let mut events: Vec<RescheduleEvent> = match policy {
        Some(p) if p.attempts > 0 && !p.unlimited => {
            let interval = to_chrono(p.interval);
            history
                .iter()
                .filter(|e| !p.interval.is_zero() && now - e.reschedule_time <= interval)
                .cloned()
                .collect()
        }
        _ => {
            let start = history.len().saturating_sub(MAX_PAST_RESCHEDULE_EVENTS);
            history[start..].to_vec()
        }
    };

    let delay = policy.map_or(Duration::ZERO, |p| next_delay(p, history, last_event_time(prev)));
    events.push(RescheduleEvent {
        reschedule_time: now,
        prev_alloc_id: prev.id,
        prev_node_id: prev.node_id,
        delay,
    });
    RescheduleTracker { events }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_id::{AllocId, NodeId};
    use convoy_structs::{mock, AllocStateEvent};
    use rstest::rstest;

    fn policy(function: DelayFunction, delay: u64, max: u64) -> ReschedulePolicy {
        ReschedulePolicy {
            attempts: 0,
            interval: Duration::ZERO,
            delay: Duration::from_secs(delay),
            delay_function: function,
            max_delay: Duration::from_secs(max),
            unlimited: true,
        }
    }

    fn event(at: DateTime<Utc>, delay: Duration) -> RescheduleEvent {
        RescheduleEvent {
            reschedule_time: at,
            prev_alloc_id: AllocId::new(),
            prev_node_id: NodeId::new(),
            delay,
        }
    }

    /// Simulates `n` back-to-back failures, each failing right when the
    /// previous delay elapsed, and returns the delays chosen.
    fn delay_series(policy: &ReschedulePolicy, n: usize) -> Vec<u64> {
        let mut now = Utc::now();
        let mut events: Vec<RescheduleEvent> = Vec::new();
        let mut out = Vec::new();
        for _ in 0..n {
            let d = next_delay(policy, &events, now);
            out.push(d.as_secs());
            events.push(event(now, d));
            now += chrono::Duration::seconds(1);
        }
        out
    }

    #[rstest]
    #[case(DelayFunction::Constant, vec![5, 5, 5, 5])]
    #[case(DelayFunction::Linear, vec![5, 10, 15, 20])]
    #[case(DelayFunction::Exponential, vec![5, 10, 20, 40, 80, 160, 240, 240])]
    #[case(DelayFunction::Fibonacci, vec![5, 5, 10, 15, 25, 40, 65, 105, 170, 240, 240])]
    fn test_delay_series(#[case] function: DelayFunction, #[case] expected: Vec<u64>) {
        let p = policy(function, 5, 240);
        assert_eq!(delay_series(&p, expected.len()), expected);
    }

    #[test]
    fn test_exponential_matches_closed_form() {
        let p = policy(DelayFunction::Exponential, 5, 240);
        let series = delay_series(&p, 10);
        for (i, d) in series.iter().enumerate() {
            assert_eq!(*d, (5u64 << i).min(240));
        }
    }

    #[test]
    fn test_delay_resets_after_quiet_period() {
        let p = policy(DelayFunction::Exponential, 5, 240);
        let start = Utc::now();
        let events = vec![event(start, Duration::from_secs(240))];

        let soon = start + chrono::Duration::seconds(100);
        assert_eq!(next_delay(&p, &events, soon), Duration::from_secs(240));

        let later = start + chrono::Duration::seconds(300);
        assert_eq!(next_delay(&p, &events, later), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_history_uses_base_delay() {
        let p = policy(DelayFunction::Fibonacci, 7, 100);
        assert_eq!(next_delay(&p, &[], Utc::now()), Duration::from_secs(7));
    }

    #[test]
    fn test_attempts_exhausted_within_interval() {
        let now = Utc::now();
        let p = ReschedulePolicy {
            attempts: 2,
            interval: Duration::from_secs(600),
            delay: Duration::from_secs(5),
            delay_function: DelayFunction::Constant,
            max_delay: Duration::ZERO,
            unlimited: false,
        };

        let mut alloc = mock::alloc();
        alloc.client_status = AllocClientStatus::Failed;
        alloc.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Failed,
            time: now,
        });
        let (_, eligible) = next_reschedule_time(&alloc, &p).unwrap();
        assert!(eligible);

        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![
                event(now - chrono::Duration::seconds(60), Duration::from_secs(5)),
                event(now - chrono::Duration::seconds(30), Duration::from_secs(5)),
            ],
        });
        let (_, eligible) = next_reschedule_time(&alloc, &p).unwrap();
        assert!(!eligible);

        // Old events fall out of the window.
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![
                event(now - chrono::Duration::seconds(3600), Duration::from_secs(5)),
                event(now - chrono::Duration::seconds(30), Duration::from_secs(5)),
            ],
        });
        let (when, eligible) = next_reschedule_time(&alloc, &p).unwrap();
        assert!(eligible);
        assert_eq!(when, now + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_running_allocs_are_not_candidates() {
        let p = policy(DelayFunction::Constant, 5, 0);
        let mut alloc = mock::alloc();
        alloc.client_status = AllocClientStatus::Running;
        assert!(next_reschedule_time(&alloc, &p).is_none());
    }

    #[test]
    fn test_tracker_prunes_history() {
        let now = Utc::now();
        let mut prev = mock::alloc();
        prev.reschedule_tracker = Some(RescheduleTracker {
            events: (0..8)
                .map(|i| event(now - chrono::Duration::minutes(i), Duration::from_secs(5)))
                .collect(),
        });

        let unlimited = policy(DelayFunction::Constant, 5, 0);
        let tracker = next_tracker(&prev, Some(&unlimited), now);
        assert_eq!(tracker.events.len(), MAX_PAST_RESCHEDULE_EVENTS + 1);
        assert_eq!(tracker.events.last().unwrap().prev_alloc_id, prev.id);

        let bounded = ReschedulePolicy {
            attempts: 3,
            interval: Duration::from_secs(150),
            unlimited: false,
            ..unlimited
        };
        let tracker = next_tracker(&prev, Some(&bounded), now);
        // Events at 0, 1 and 2 minutes ago are inside the window.
        assert_eq!(tracker.events.len(), 4);
    }
}
