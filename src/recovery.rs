//! Startup reconciliation. Runs once, before the polling loop, and brings
//! the persisted picture of the room back in line with what the sensors
//! actually see. Never guesses: anything unexplainable lands in
//! SYSTEM_ERROR instead of a fabricated state.

use crate::config::Tunables;
use crate::error::AppError;
use crate::events::{EventKind, EventLog, EventRecord};
use crate::fusion::{FusionConfig, FusionSignal, Presence, SensorFusion};
use crate::queue::{EntryStatus, QueueStore};
use crate::sensor::SensorRig;
use crate::state::{AccessMethod, OccupancyState, OccupantSession, SessionOutcome, SystemState};
use crate::store::Store;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Sample the sensors long enough to answer recovery's questions: a single
/// `Present`/`Unknown` verdict returns immediately, an `Absent` verdict is
/// held for up to `window` so sustained absence is actually observable.
pub fn observe(
    rig: &mut SensorRig,
    fusion: &mut SensorFusion,
    config: &FusionConfig,
    window: Duration,
    step: Duration,
) -> FusionSignal {
    let started = SystemTime::now();
    loop {
        let now = SystemTime::now();
        let sample = rig.sample(now);
        let signal = fusion.update(sample.inputs, config);
        if signal.presence != Presence::Absent {
            return signal;
        }
        let elapsed = now.duration_since(started).unwrap_or_default();
        if elapsed >= window {
            return signal;
        }
        std::thread::sleep(step.min(window - elapsed));
    }
}

/// Reconcile the persisted system state with the live sensor signal and
/// purge stale queue entries. Idempotent: a second run over the already
/// reconciled state changes nothing.
pub fn recover(
    store: &Store,
    queue: &QueueStore,
    events: &EventLog,
    signal: &FusionSignal,
    tunables: &Tunables,
    now: SystemTime,
) -> Result<SystemState, AppError> {
    let persisted = match store.load_system_state() {
        Ok(persisted) => persisted,
        Err(AppError::Recovery(msg)) => {
            warn!(error = %msg, "Persisted state unreadable, blocking normal operation");
            let state = SystemState {
                occupancy: OccupancyState::SystemError,
                session: None,
                pending_entry: None,
                updated_at: now,
            };
            append(
                events,
                EventRecord::new(
                    now,
                    EventKind::Recovery,
                    OccupancyState::SystemError,
                    OccupancyState::SystemError,
                    queue_size(queue),
                )
                .with_details(msg),
            );
            store.save_system_state(&state)?;
            return Ok(state);
        }
        Err(e) => return Err(e),
    };

    let mut state = persisted.unwrap_or_else(|| SystemState::fresh(now));
    let before = state.clone();

    // Persisted occupancy vs. sustained observed absence
    if state.occupancy.is_occupied() && signal.presence == Presence::Absent {
        let sustained = now.duration_since(signal.since).unwrap_or_default();
        if sustained >= tunables.pir_absence() {
            if let Some(mut session) = state.session.take() {
                session.close(SessionOutcome::Completed, now);
                let mut record = EventRecord::new(
                    now,
                    EventKind::Recovery,
                    state.occupancy,
                    OccupancyState::Free,
                    queue_size(queue),
                )
                .with_duration(session.duration_minutes(now))
                .with_details("interrupted session closed as completed");
                if let Some(user) = session.user_id {
                    record = record.with_user(user);
                }
                append(events, record);
            }
            state.occupancy = OccupancyState::Free;
        }
    }

    // Persisted vacancy vs. observed presence: open a synthetic session so
    // the queue head is not promoted into an occupied room
    if matches!(
        state.occupancy,
        OccupancyState::Free | OccupancyState::QueueActive
    ) && signal.presence == Presence::Present
    {
        state.session = Some(OccupantSession::open(AccessMethod::Direct, None, now));
        append(
            events,
            EventRecord::new(
                now,
                EventKind::Recovery,
                state.occupancy,
                OccupancyState::OccupiedDirect,
                queue_size(queue),
            )
            .with_details("recovered_unknown: presence without a session"),
        );
        state.occupancy = OccupancyState::OccupiedDirect;
    }

    purge_queue(queue, events, &mut state, tunables, now)?;

    // Land on the state the surviving session/queue implies
    state.occupancy = match (&state.session, state.pending_entry) {
        (Some(session), _) if session.outcome.is_none() => match state.occupancy {
            occupied if occupied.is_occupied() => occupied,
            _ => match session.method {
                AccessMethod::Direct => OccupancyState::OccupiedDirect,
                AccessMethod::Reservation => OccupancyState::OccupiedReserved,
            },
        },
        (_, Some(_)) => OccupancyState::ReservedPendingEntry,
        _ if queue_size(queue) > 0 => OccupancyState::QueueActive,
        _ if state.occupancy == OccupancyState::SystemError => OccupancyState::SystemError,
        _ if state.occupancy == OccupancyState::Maintenance => OccupancyState::Maintenance,
        _ => OccupancyState::Free,
    };
    state.updated_at = now;

    if state != before {
        info!(from = ?before.occupancy, to = ?state.occupancy, "Recovery reconciled state");
    }
    store.save_system_state(&state)?;
    Ok(state)
}

fn purge_queue(
    queue: &QueueStore,
    events: &EventLog,
    state: &mut SystemState,
    tunables: &Tunables,
    now: SystemTime,
) -> Result<(), AppError> {
    for entry in queue.entries()? {
        match entry.status {
            EntryStatus::Activated => {
                let elapsed = entry
                    .activation_deadline
                    .map(|deadline| deadline <= now)
                    .unwrap_or(true);
                if elapsed {
                    queue.mark_no_show(entry.id)?;
                    if state.pending_entry == Some(entry.id) {
                        state.pending_entry = None;
                    }
                    append(
                        events,
                        EventRecord::new(
                            now,
                            EventKind::Recovery,
                            state.occupancy,
                            state.occupancy,
                            queue_size(queue),
                        )
                        .with_user(entry.user_id)
                        .with_no_show()
                        .with_details("activation window elapsed during downtime"),
                    );
                } else if state.pending_entry.is_none() && !state.occupancy.is_occupied() {
                    // Promoted entry survived the restart; re-adopt it
                    state.pending_entry = Some(entry.id);
                }
            }
            EntryStatus::Waiting => {
                let age = now.duration_since(entry.enqueued_at).unwrap_or_default();
                if age >= tunables.orphan_age() {
                    queue.cancel(entry.id)?;
                    append(
                        events,
                        EventRecord::new(
                            now,
                            EventKind::Recovery,
                            state.occupancy,
                            state.occupancy,
                            queue_size(queue),
                        )
                        .with_user(entry.user_id)
                        .with_details("orphaned waiting entry cancelled"),
                    );
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn append(events: &EventLog, record: EventRecord) {
    if let Err(e) = events.append(&record) {
        warn!(error = %e, "Failed to append recovery event");
    }
}

fn queue_size(queue: &QueueStore) -> u32 {
    queue.waiting_len().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueOutcome;
    use std::time::UNIX_EPOCH;

    fn harness() -> (Store, QueueStore, EventLog) {
        let store = Store::open_temporary().expect("open temp store");
        let queue = QueueStore::open(store.db()).expect("open queue");
        let events = EventLog::open(store.db()).expect("open events");
        (store, queue, events)
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn absent_since(secs: u64) -> FusionSignal {
        FusionSignal {
            presence: Presence::Absent,
            since: at(secs),
            last_movement: None,
            pir_available: true,
            ultrasonic_available: true,
        }
    }

    fn present() -> FusionSignal {
        FusionSignal {
            presence: Presence::Present,
            since: at(0),
            last_movement: Some(at(0)),
            pir_available: true,
            ultrasonic_available: true,
        }
    }

    #[test]
    fn interrupted_session_closes_as_completed() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        store.save_system_state(&SystemState {
            occupancy: OccupancyState::OccupiedReserved,
            session: Some(OccupantSession::open(
                AccessMethod::Reservation,
                Some("USER_002".to_string()),
                at(0),
            )),
            pending_entry: None,
            updated_at: at(0),
        })?;

        // Absent for 40s against a 30s threshold
        let state = recover(&store, &queue, &events, &absent_since(60), &tunables, at(100))?;

        assert_eq!(state.occupancy, OccupancyState::Free);
        assert!(state.session.is_none());
        let recorded = events.recent(1)?.remove(0);
        assert_eq!(recorded.kind, EventKind::Recovery);
        assert_eq!(recorded.user_id.as_deref(), Some("USER_002"));
        assert_eq!(store.load_system_state()?, Some(state));
        Ok(())
    }

    #[test]
    fn short_absence_keeps_the_session() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        store.save_system_state(&SystemState {
            occupancy: OccupancyState::OccupiedDirect,
            session: Some(OccupantSession::open(AccessMethod::Direct, None, at(0))),
            pending_entry: None,
            updated_at: at(0),
        })?;

        // Only 10s of observed absence
        let state = recover(&store, &queue, &events, &absent_since(90), &tunables, at(100))?;

        assert_eq!(state.occupancy, OccupancyState::OccupiedDirect);
        assert!(state.session.is_some());
        Ok(())
    }

    #[test]
    fn presence_without_session_opens_synthetic_direct_session() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        store.save_system_state(&SystemState::fresh(at(0)))?;
        queue.enqueue("USER_001", at(1), 7)?;

        let state = recover(&store, &queue, &events, &present(), &tunables, at(100))?;

        assert_eq!(state.occupancy, OccupancyState::OccupiedDirect);
        let session = state.session.expect("synthetic session");
        assert_eq!(session.method, AccessMethod::Direct);
        assert_eq!(session.user_id, None);
        // Queue head must not have been promoted into the occupied room
        assert_eq!(queue.activated()?, None);
        let recorded = events.recent(1)?.remove(0);
        assert!(
            recorded
                .details
                .as_deref()
                .is_some_and(|d| d.contains("recovered_unknown"))
        );
        Ok(())
    }

    #[test]
    fn expired_activation_purges_as_no_show() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        let entry = match queue.enqueue("USER_003", at(0), 7)? {
            EnqueueOutcome::Accepted(entry) => entry,
            other => panic!("expected acceptance, got {other:?}"),
        };
        queue.promote(entry.id, at(50))?;
        store.save_system_state(&SystemState {
            occupancy: OccupancyState::ReservedPendingEntry,
            session: None,
            pending_entry: Some(entry.id),
            updated_at: at(0),
        })?;

        let state = recover(&store, &queue, &events, &absent_since(0), &tunables, at(100))?;

        assert_eq!(
            queue.get(entry.id)?.map(|e| e.status),
            Some(EntryStatus::NoShow)
        );
        assert_eq!(state.pending_entry, None);
        assert_eq!(state.occupancy, OccupancyState::Free);
        Ok(())
    }

    #[test]
    fn unexpired_activation_is_readopted() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        let entry = match queue.enqueue("USER_003", at(0), 7)? {
            EnqueueOutcome::Accepted(entry) => entry,
            other => panic!("expected acceptance, got {other:?}"),
        };
        queue.promote(entry.id, at(500))?;
        store.save_system_state(&SystemState {
            occupancy: OccupancyState::ReservedPendingEntry,
            session: None,
            pending_entry: Some(entry.id),
            updated_at: at(0),
        })?;

        let state = recover(&store, &queue, &events, &absent_since(90), &tunables, at(100))?;

        assert_eq!(state.occupancy, OccupancyState::ReservedPendingEntry);
        assert_eq!(state.pending_entry, Some(entry.id));
        Ok(())
    }

    #[test]
    fn orphaned_waiting_entries_are_cancelled() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        let orphan = match queue.enqueue("USER_001", at(0), 7)? {
            EnqueueOutcome::Accepted(entry) => entry,
            other => panic!("expected acceptance, got {other:?}"),
        };
        let orphan_age = tunables.orphan_age().as_secs();
        let fresh = match queue.enqueue("USER_002", at(orphan_age), 7)? {
            EnqueueOutcome::Accepted(entry) => entry,
            other => panic!("expected acceptance, got {other:?}"),
        };

        let now = at(orphan_age + 10);
        let state = recover(&store, &queue, &events, &absent_since(0), &tunables, now)?;

        assert_eq!(
            queue.get(orphan.id)?.map(|e| e.status),
            Some(EntryStatus::Cancelled)
        );
        assert_eq!(
            queue.get(fresh.id)?.map(|e| e.status),
            Some(EntryStatus::Waiting)
        );
        assert_eq!(state.occupancy, OccupancyState::QueueActive);
        Ok(())
    }

    #[test]
    fn recovery_is_idempotent() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        store.save_system_state(&SystemState {
            occupancy: OccupancyState::OccupiedReserved,
            session: Some(OccupantSession::open(
                AccessMethod::Reservation,
                Some("USER_002".to_string()),
                at(0),
            )),
            pending_entry: None,
            updated_at: at(0),
        })?;
        let signal = absent_since(60);

        let first = recover(&store, &queue, &events, &signal, &tunables, at(100))?;
        let events_after_first = events.len();
        let second = recover(&store, &queue, &events, &signal, &tunables, at(100))?;

        assert_eq!(first, second);
        assert_eq!(events.len(), events_after_first);
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_blocks_in_system_error() -> Result<(), AppError> {
        let (store, queue, events) = harness();
        let tunables = Tunables::default();
        store
            .db()
            .open_tree(crate::store::SYSTEM_TREE)?
            .insert(b"state", &b"garbage"[..])?;

        let state = recover(&store, &queue, &events, &absent_since(0), &tunables, at(100))?;

        assert_eq!(state.occupancy, OccupancyState::SystemError);
        Ok(())
    }
}
