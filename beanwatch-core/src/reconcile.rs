//! Dedup and ordering engine.
//!
//! Pure in-memory step between classification and dispatch. Given the
//! persisted stream state and the candidates from one fetch batch, it
//! produces the ordered subset of genuinely-new events together with the
//! advanced cursor and pruned seen set. The caller commits the returned
//! state only after dispatch accounting for the batch has completed.
//!
//! Reorg policy: events already dispatched for records a reorg later
//! invalidates are never retracted. The cursor and seen set absorb
//! overlapping fetch windows; stale notifications are accepted.

use crate::stream::{CandidateEvent, OrderingKey, StreamState};

/// Result of reconciling one fetch batch against persisted state.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Genuinely-new events, ascending in `(primary, secondary)`.
    pub events: Vec<CandidateEvent>,
    /// State to persist once the batch has been dispatched.
    pub state: StreamState,
}

/// Reconcile `candidates` against `state`.
///
/// `observed_max` is the highest ordering key among *all* records fetched
/// this cycle, candidates or not, so the cursor advances even on cycles
/// with zero notifiable events. The cursor never decreases. `retention`
/// bounds the seen set in primary-key units.
pub fn reconcile(
    state: &StreamState,
    observed_max: Option<OrderingKey>,
    candidates: Vec<CandidateEvent>,
    retention: u64,
) -> ReconcileOutcome {
    let mut events: Vec<CandidateEvent> = candidates
        .into_iter()
        .filter(|c| c.key > state.cursor && !state.seen.contains(&c.source_record_id))
        .collect();
    events.sort_by_key(|c| c.key);

    let mut cursor = state.cursor;
    if let Some(max) = observed_max {
        cursor = cursor.max(max);
    }
    // A candidate can outrun the reported max if the source misorders.
    if let Some(last) = events.last() {
        cursor = cursor.max(last.key);
    }

    let mut seen = state.seen.clone();
    for event in &events {
        seen.insert(event.source_record_id.clone(), event.key);
    }
    seen.prune(cursor, retention);

    ReconcileOutcome {
        events,
        state: StreamState { cursor, seen },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{EventKind, EventPayload, SeenSet};
    use rust_decimal::Decimal;

    fn candidate(id: &str, primary: u64, secondary: u64) -> CandidateEvent {
        CandidateEvent {
            kind: EventKind::PegCross,
            source_record_id: id.into(),
            key: OrderingKey {
                primary,
                secondary,
            },
            payload: EventPayload::PegCross {
                price: Decimal::ONE,
                direction: crate::stream::CrossDirection::Above,
            },
        }
    }

    fn state(cursor_primary: u64, seen_ids: &[(&str, u64)]) -> StreamState {
        let mut seen = SeenSet::default();
        for (id, primary) in seen_ids {
            seen.insert((*id).into(), OrderingKey::sequence(*primary));
        }
        StreamState {
            cursor: OrderingKey::sequence(cursor_primary),
            seen,
        }
    }

    #[test]
    fn new_event_advances_cursor_and_seen_set() {
        let outcome = reconcile(
            &state(100, &[]),
            Some(OrderingKey::sequence(105)),
            vec![candidate("e1", 105, 0)],
            1000,
        );
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].source_record_id, "e1");
        assert_eq!(outcome.state.cursor, OrderingKey::sequence(105));
        assert!(outcome.state.seen.contains("e1"));
    }

    #[test]
    fn replayed_candidate_is_filtered_by_cursor_and_seen_set() {
        let outcome = reconcile(
            &state(105, &[("e1", 105)]),
            Some(OrderingKey::sequence(110)),
            vec![candidate("e1", 105, 0), candidate("e2", 110, 0)],
            1000,
        );
        let ids: Vec<_> = outcome
            .events
            .iter()
            .map(|e| e.source_record_id.as_str())
            .collect();
        assert_eq!(ids, vec!["e2"]);
        assert_eq!(outcome.state.cursor, OrderingKey::sequence(110));
    }

    #[test]
    fn seen_set_excludes_event_even_beyond_cursor() {
        let outcome = reconcile(
            &state(100, &[("e9", 120)]),
            Some(OrderingKey::sequence(120)),
            vec![candidate("e9", 120, 0)],
            1000,
        );
        assert!(outcome.events.is_empty());
        assert_eq!(outcome.state.cursor, OrderingKey::sequence(120));
    }

    #[test]
    fn events_sorted_by_key_with_secondary_tiebreak() {
        let outcome = reconcile(
            &state(0, &[]),
            Some(OrderingKey::sequence(8)),
            vec![
                candidate("a", 5, 0),
                candidate("b", 2, 1),
                candidate("c", 8, 0),
                candidate("d", 2, 0),
            ],
            1000,
        );
        let keys: Vec<_> = outcome.events.iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![
                OrderingKey {
                    primary: 2,
                    secondary: 0
                },
                OrderingKey {
                    primary: 2,
                    secondary: 1
                },
                OrderingKey::sequence(5),
                OrderingKey::sequence(8),
            ]
        );
    }

    #[test]
    fn reconcile_is_idempotent_for_unchanged_state() {
        let s = state(100, &[]);
        let candidates = vec![candidate("e1", 105, 0), candidate("e2", 110, 0)];
        let first = reconcile(&s, Some(OrderingKey::sequence(110)), candidates.clone(), 1000);
        let second = reconcile(&s, Some(OrderingKey::sequence(110)), candidates, 1000);
        assert_eq!(first.events, second.events);
        assert_eq!(first.state, second.state);
    }

    #[test]
    fn replay_against_committed_state_dispatches_nothing() {
        let s = state(100, &[]);
        let candidates = vec![candidate("e1", 105, 0)];
        let first = reconcile(&s, Some(OrderingKey::sequence(105)), candidates.clone(), 1000);
        let replay = reconcile(&first.state, Some(OrderingKey::sequence(105)), candidates, 1000);
        assert!(replay.events.is_empty());
        assert_eq!(replay.state.cursor, first.state.cursor);
    }

    #[test]
    fn cursor_advances_on_event_free_cycles_and_never_decreases() {
        let s = state(100, &[]);
        let quiet = reconcile(&s, Some(OrderingKey::sequence(140)), vec![], 1000);
        assert!(quiet.events.is_empty());
        assert_eq!(quiet.state.cursor, OrderingKey::sequence(140));

        // A stale observed max cannot move the cursor backwards.
        let stale = reconcile(&quiet.state, Some(OrderingKey::sequence(90)), vec![], 1000);
        assert_eq!(stale.state.cursor, OrderingKey::sequence(140));

        // No observed records at all leaves the cursor untouched.
        let empty = reconcile(&quiet.state, None, vec![], 1000);
        assert_eq!(empty.state.cursor, OrderingKey::sequence(140));
    }

    #[test]
    fn retention_window_bounds_the_seen_set() {
        let mut s = state(0, &[]);
        s.seen.insert("ancient".into(), OrderingKey::sequence(5));
        let outcome = reconcile(
            &s,
            Some(OrderingKey::sequence(500)),
            vec![candidate("fresh", 500, 0)],
            100,
        );
        assert!(!outcome.state.seen.contains("ancient"));
        assert!(outcome.state.seen.contains("fresh"));
    }
}
