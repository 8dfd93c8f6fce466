//! The occupancy state machine and its tick loop. One thread owns the
//! single mutable `SystemState`; every other component either submits
//! triggers through a channel or reads the per-tick snapshot. At most one
//! transition is ever in flight.

use crate::clock::{DeadlineSet, DeadlineTag};
use crate::config::{ConflictPriority, Tunables};
use crate::error::AppError;
use crate::events::{EventKind, EventLog, EventRecord};
use crate::fusion::{FusionConfig, FusionSignal, Presence, SensorFusion};
use crate::notify::Notification;
use crate::queue::{EnqueueOutcome, QueueStore, RejectReason};
use crate::sensor::SensorRig;
use crate::state::{
    AccessMethod, AppState, OccupancyState, OccupantSession, QueuePosition, SessionOutcome,
    StatusSnapshot, SystemHealth, SystemState,
};
use crate::store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AdminAction {
    ForceUnlock,
    Reset,
    ClearQueue,
    EnterMaintenance,
    ExitMaintenance,
    UpdateTunables(Tunables),
}

/// Everything that can ask the machine to move. Transport-layer callers
/// submit these through a channel; the tick drains and evaluates them in
/// order, admin actions first.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    DirectPress,
    Booking { user_id: String },
    CancelBooking { user_id: String },
    ReplaceBooking { user_id: String, new_user_id: String },
    Admin(AdminAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCause {
    Sensors,
    Persistence,
}

#[derive(Debug, Default)]
pub struct StepOutcome {
    pub notifications: Vec<Notification>,
}

pub struct Orchestrator {
    state: SystemState,
    deadlines: DeadlineSet,
    tunables: Tunables,
    queue: QueueStore,
    events: EventLog,
    store: Store,
    notifications: Vec<Notification>,
    error_cause: Option<ErrorCause>,
    dirty: bool,
}

impl Orchestrator {
    pub fn new(
        initial: SystemState,
        tunables: Tunables,
        queue: QueueStore,
        events: EventLog,
        store: Store,
        now: SystemTime,
    ) -> Self {
        let mut orchestrator = Self {
            state: initial,
            deadlines: DeadlineSet::new(),
            tunables,
            queue,
            events,
            store,
            notifications: Vec::new(),
            error_cause: None,
            dirty: true,
        };
        orchestrator.arm_deadlines(now);
        orchestrator
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn storage_ok(&self) -> bool {
        self.error_cause != Some(ErrorCause::Persistence)
    }

    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            mode: self.tunables.fusion_mode,
            presence_threshold_cm: self.tunables.presence_threshold_cm,
            movement_timeout: self.tunables.movement_timeout(),
        }
    }

    fn arm_deadlines(&mut self, now: SystemTime) {
        self.deadlines
            .schedule(DeadlineTag::DailyReset, self.tunables.next_daily_reset(now));
        if let Some(session) = self.state.session.as_ref().filter(|s| s.outcome.is_none()) {
            self.deadlines.schedule(
                DeadlineTag::MaxOccupancy,
                session.started_at + self.tunables.max_occupancy(),
            );
            self.deadlines.schedule(
                DeadlineTag::MovementWarning,
                now + self.tunables.movement_warning(),
            );
        }
        if self.state.occupancy == OccupancyState::ReservedPendingEntry {
            let deadline = self
                .state
                .pending_entry
                .and_then(|id| self.queue.get(id).ok().flatten())
                .and_then(|entry| entry.activation_deadline);
            if let Some(at) = deadline {
                self.deadlines.schedule(DeadlineTag::ReservationEntry, at);
            }
        }
    }

    /// One evaluation cycle. Triggers were drained from the serialized
    /// stream by the caller; admin actions run first, then user triggers in
    /// arrival order, then sensor-driven transitions, expired deadlines, and
    /// queue promotion.
    pub fn tick(
        &mut self,
        now: SystemTime,
        signal: &FusionSignal,
        triggers: Vec<Trigger>,
    ) -> StepOutcome {
        let (admin, user): (Vec<_>, Vec<_>) = triggers
            .into_iter()
            .partition(|t| matches!(t, Trigger::Admin(_)));
        for trigger in admin.into_iter().chain(user) {
            self.handle_trigger(trigger, now);
        }

        self.evaluate_sensors(now, signal);
        self.evaluate_deadlines(now, signal);
        self.evaluate_promotion(now, signal);
        self.persist(now);

        StepOutcome {
            notifications: std::mem::take(&mut self.notifications),
        }
    }

    /// Read-only fan-out value for the API and displays.
    pub fn snapshot(&self, now: SystemTime) -> StatusSnapshot {
        let waiting = self.queue.waiting().unwrap_or_default();
        let base = self.base_wait_minutes(now);
        let queue: Vec<QueuePosition> = waiting
            .iter()
            .enumerate()
            .map(|(index, entry)| QueuePosition {
                position: index as u32 + 1,
                user_id: entry.user_id.clone(),
                wait_minutes: base + index as u32 * self.tunables.max_occupancy_minutes,
            })
            .collect();
        let pending = self
            .state
            .pending_entry
            .and_then(|id| self.queue.get(id).ok().flatten());

        StatusSnapshot {
            state: self.state.occupancy,
            occupied_by: self.state.session.as_ref().and_then(|s| s.user_id.clone()),
            occupation_start: self.state.session.as_ref().map(|s| s.started_at),
            pending_user: pending.as_ref().map(|e| e.user_id.clone()),
            pending_deadline: pending.as_ref().and_then(|e| e.activation_deadline),
            next_user: pending
                .as_ref()
                .map(|e| e.user_id.clone())
                .or_else(|| waiting.first().map(|e| e.user_id.clone())),
            queue_size: queue.len() as u32,
            queue,
            estimated_wait_minutes: base,
            updated_at: now,
        }
    }

    // Trigger handling

    fn handle_trigger(&mut self, trigger: Trigger, now: SystemTime) {
        match trigger {
            Trigger::DirectPress => self.handle_direct_press(now),
            Trigger::Booking { user_id } => self.handle_booking(&user_id, now),
            Trigger::CancelBooking { user_id } => self.handle_cancel(&user_id, now),
            Trigger::ReplaceBooking {
                user_id,
                new_user_id,
            } => self.handle_replace(&user_id, &new_user_id, now),
            Trigger::Admin(action) => self.handle_admin(action, now),
        }
    }

    fn handle_direct_press(&mut self, now: SystemTime) {
        match self.state.occupancy {
            OccupancyState::Free => {
                self.open_session(AccessMethod::Direct, None, now);
                let from = self.transition(OccupancyState::OccupiedDirect, now);
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::UserEnteredOffice,
                        from,
                        OccupancyState::OccupiedDirect,
                        self.queue_size(),
                    )
                    .with_details("direct access"),
                );
            }
            OccupancyState::QueueActive
            | OccupancyState::ReservedPendingEntry
            | OccupancyState::OccupiedReserved => self.resolve_conflict(now),
            other => self.diagnostic(now, other, "direct press ignored"),
        }
    }

    fn resolve_conflict(&mut self, now: SystemTime) {
        match self.tunables.conflict_priority {
            ConflictPriority::Presence => {
                let from = self.state.occupancy;
                // At most one active or pending reservation loses
                match from {
                    OccupancyState::OccupiedReserved => {
                        if let Some(session) = self.close_session(SessionOutcome::ForcedUnlock, now)
                        {
                            let mut record = EventRecord::new(
                                now,
                                EventKind::ConflictResolved,
                                from,
                                from,
                                self.queue_size(),
                            )
                            .with_conflict()
                            .with_duration(session.duration_minutes(now))
                            .with_details("reserved session displaced by direct access");
                            if let Some(user) = session.user_id {
                                record = record.with_user(user);
                            }
                            self.record(record);
                        }
                    }
                    OccupancyState::ReservedPendingEntry => {
                        if let Some(id) = self.state.pending_entry.take() {
                            self.deadlines.cancel(DeadlineTag::ReservationEntry);
                            match self.queue.cancel(id) {
                                Ok(entry) => self.record(
                                    EventRecord::new(
                                        now,
                                        EventKind::ConflictResolved,
                                        from,
                                        from,
                                        self.queue_size(),
                                    )
                                    .with_conflict()
                                    .with_user(entry.user_id)
                                    .with_details("pending reservation displaced by direct access"),
                                ),
                                Err(e) => {
                                    self.enter_system_error(
                                        ErrorCause::Persistence,
                                        now,
                                        &format!("cancelling displaced reservation: {e}"),
                                    );
                                    return;
                                }
                            }
                        }
                    }
                    // Queue order survives; only the room is taken
                    _ => {}
                }
                self.open_session(AccessMethod::Direct, None, now);
                let from = self.transition(OccupancyState::OccupiedDirect, now);
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::UserEnteredOffice,
                        from,
                        OccupancyState::OccupiedDirect,
                        self.queue_size(),
                    )
                    .with_conflict()
                    .with_details("direct access won conflict"),
                );
            }
            ConflictPriority::Reservation => {
                let state = self.state.occupancy;
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::DirectAccessRejected,
                        state,
                        state,
                        self.queue_size(),
                    )
                    .with_conflict()
                    .with_details("reservation priority holds"),
                );
            }
        }
    }

    fn handle_booking(&mut self, user_id: &str, now: SystemTime) {
        match self.state.occupancy {
            OccupancyState::SystemError | OccupancyState::Maintenance => {
                let state = self.state.occupancy;
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::BookingRejected,
                        state,
                        state,
                        self.queue_size(),
                    )
                    .with_user(user_id)
                    .with_details("bookings unavailable in this state"),
                );
            }
            OccupancyState::Free => {
                let queue_empty = match self.queue.waiting_len() {
                    Ok(len) => len == 0,
                    Err(e) => {
                        self.enter_system_error(
                            ErrorCause::Persistence,
                            now,
                            &format!("reading queue length: {e}"),
                        );
                        return;
                    }
                };
                if queue_empty {
                    // Room free and nobody waiting: the booking takes the
                    // room immediately
                    self.open_session(AccessMethod::Reservation, Some(user_id.to_string()), now);
                    let from = self.transition(OccupancyState::OccupiedReserved, now);
                    self.record(
                        EventRecord::new(
                            now,
                            EventKind::BookingConfirmed,
                            from,
                            OccupancyState::OccupiedReserved,
                            self.queue_size(),
                        )
                        .with_user(user_id)
                        .with_details("room free, session opened immediately"),
                    );
                    self.notifications.push(Notification::ReservationConfirmed {
                        user_id: user_id.to_string(),
                        position: 1,
                        wait_minutes: 0,
                    });
                } else {
                    self.enqueue_booking(user_id, now);
                }
            }
            _ => self.enqueue_booking(user_id, now),
        }
    }

    fn enqueue_booking(&mut self, user_id: &str, now: SystemTime) {
        match self
            .queue
            .enqueue(user_id, now, self.tunables.max_queue_size)
        {
            Ok(EnqueueOutcome::Accepted(entry)) => {
                let from = self.state.occupancy;
                if from == OccupancyState::Free {
                    self.transition(OccupancyState::QueueActive, now);
                }
                let position = self.queue_size();
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::BookingConfirmed,
                        from,
                        self.state.occupancy,
                        position,
                    )
                    .with_user(entry.user_id.clone()),
                );
                self.notifications.push(Notification::ReservationConfirmed {
                    user_id: entry.user_id,
                    position,
                    wait_minutes: self.base_wait_minutes(now)
                        + position.saturating_sub(1) * self.tunables.max_occupancy_minutes,
                });
            }
            Ok(EnqueueOutcome::Rejected(reason)) => {
                let state = self.state.occupancy;
                let details = match reason {
                    RejectReason::DuplicateUser => "user already holds a queue slot",
                    RejectReason::QueueFull => "queue full",
                };
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::BookingRejected,
                        state,
                        state,
                        self.queue_size(),
                    )
                    .with_user(user_id)
                    .with_details(details),
                );
            }
            Err(e) => self.enter_system_error(
                ErrorCause::Persistence,
                now,
                &format!("enqueue failed: {e}"),
            ),
        }
    }

    fn handle_cancel(&mut self, user_id: &str, now: SystemTime) {
        let entry = match self.queue.live_entry_for(user_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.diagnostic(now, self.state.occupancy, "cancel for user not in queue");
                return;
            }
            Err(e) => {
                self.enter_system_error(
                    ErrorCause::Persistence,
                    now,
                    &format!("looking up queue entry: {e}"),
                );
                return;
            }
        };

        match self.queue.cancel(entry.id) {
            Ok(cancelled) => {
                let from = self.state.occupancy;
                if self.state.pending_entry == Some(cancelled.id) {
                    self.state.pending_entry = None;
                    self.deadlines.cancel(DeadlineTag::ReservationEntry);
                    if from == OccupancyState::ReservedPendingEntry {
                        self.transition(OccupancyState::Free, now);
                    }
                }
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::ReservationCancelled,
                        from,
                        self.state.occupancy,
                        self.queue_size(),
                    )
                    .with_user(cancelled.user_id),
                );
            }
            Err(e) => self.enter_system_error(
                ErrorCause::Persistence,
                now,
                &format!("cancelling queue entry: {e}"),
            ),
        }
    }

    fn handle_replace(&mut self, user_id: &str, new_user_id: &str, now: SystemTime) {
        let entry = match self.queue.live_entry_for(user_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.diagnostic(now, self.state.occupancy, "replace for user not in queue");
                return;
            }
            Err(e) => {
                self.enter_system_error(
                    ErrorCause::Persistence,
                    now,
                    &format!("looking up queue entry: {e}"),
                );
                return;
            }
        };

        match self.queue.replace(entry.id, new_user_id) {
            Ok(updated) => {
                let state = self.state.occupancy;
                self.dirty = true;
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::ReservationReplaced,
                        state,
                        state,
                        self.queue_size(),
                    )
                    .with_user(user_id)
                    .with_details(format!("slot handed to {}", updated.user_id)),
                );
            }
            Err(AppError::Validation(msg)) => {
                let state = self.state.occupancy;
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::BookingRejected,
                        state,
                        state,
                        self.queue_size(),
                    )
                    .with_user(new_user_id)
                    .with_details(msg),
                );
            }
            Err(e) => self.enter_system_error(
                ErrorCause::Persistence,
                now,
                &format!("replacing queue entry: {e}"),
            ),
        }
    }

    fn handle_admin(&mut self, action: AdminAction, now: SystemTime) {
        match action {
            AdminAction::ForceUnlock => {
                let from = self.state.occupancy;
                let session = self.close_session(SessionOutcome::ForcedUnlock, now);
                self.drop_pending_activation();
                self.error_cause = None;
                self.transition(OccupancyState::Free, now);
                let mut record = EventRecord::new(
                    now,
                    EventKind::ForceUnlock,
                    from,
                    OccupancyState::Free,
                    self.queue_size(),
                );
                if let Some(session) = session {
                    record = record.with_duration(session.duration_minutes(now));
                    if let Some(user) = session.user_id {
                        record = record.with_user(user);
                    }
                }
                self.record(record);
            }
            AdminAction::Reset => {
                let from = self.state.occupancy;
                self.close_session(SessionOutcome::ForcedUnlock, now);
                self.drop_pending_activation();
                let cancelled = match self.queue.cancel_all_open() {
                    Ok(cancelled) => cancelled.len(),
                    Err(e) => {
                        self.enter_system_error(
                            ErrorCause::Persistence,
                            now,
                            &format!("clearing queue on reset: {e}"),
                        );
                        return;
                    }
                };
                self.error_cause = None;
                self.transition(OccupancyState::Free, now);
                self.record(
                    EventRecord::new(now, EventKind::QueueCleared, from, OccupancyState::Free, 0)
                        .with_details(format!("admin reset, {cancelled} entries cancelled")),
                );
                self.notifications.push(Notification::QueueCleared);
            }
            AdminAction::ClearQueue => {
                let from = self.state.occupancy;
                self.drop_pending_activation();
                let cancelled = match self.queue.cancel_all_open() {
                    Ok(cancelled) => cancelled.len(),
                    Err(e) => {
                        self.enter_system_error(
                            ErrorCause::Persistence,
                            now,
                            &format!("clearing queue: {e}"),
                        );
                        return;
                    }
                };
                if matches!(
                    from,
                    OccupancyState::QueueActive | OccupancyState::ReservedPendingEntry
                ) {
                    self.transition(OccupancyState::Free, now);
                }
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::QueueCleared,
                        from,
                        self.state.occupancy,
                        0,
                    )
                    .with_details(format!("{cancelled} entries cancelled")),
                );
                self.notifications.push(Notification::QueueCleared);
            }
            AdminAction::EnterMaintenance => {
                let from = self.state.occupancy;
                self.close_session(SessionOutcome::ForcedUnlock, now);
                self.drop_pending_activation();
                self.transition(OccupancyState::Maintenance, now);
                self.record(EventRecord::new(
                    now,
                    EventKind::MaintenanceEntered,
                    from,
                    OccupancyState::Maintenance,
                    self.queue_size(),
                ));
            }
            AdminAction::ExitMaintenance => {
                if self.state.occupancy == OccupancyState::Maintenance {
                    self.transition(OccupancyState::Free, now);
                    self.record(EventRecord::new(
                        now,
                        EventKind::MaintenanceExited,
                        OccupancyState::Maintenance,
                        OccupancyState::Free,
                        self.queue_size(),
                    ));
                } else {
                    self.diagnostic(now, self.state.occupancy, "not in maintenance");
                }
            }
            AdminAction::UpdateTunables(tunables) => self.apply_tunables(tunables, now),
        }
    }

    /// Swap the configuration snapshot. Runs between evaluations only;
    /// the caller guarantees no transition is mid-flight.
    pub fn apply_tunables(&mut self, tunables: Tunables, now: SystemTime) {
        if let Err(e) = tunables.validate() {
            self.diagnostic(now, self.state.occupancy, &format!("config rejected: {e}"));
            return;
        }
        if let Err(e) = self.store.save_tunables(&tunables) {
            warn!(error = %e, "Failed to persist tunables override");
        }
        self.tunables = tunables;
        self.deadlines
            .schedule(DeadlineTag::DailyReset, self.tunables.next_daily_reset(now));
        self.dirty = true;
        let state = self.state.occupancy;
        self.record(EventRecord::new(
            now,
            EventKind::ConfigUpdated,
            state,
            state,
            self.queue_size(),
        ));
    }

    // Sensor-driven transitions

    fn evaluate_sensors(&mut self, now: SystemTime, signal: &FusionSignal) {
        if signal.presence == Presence::Unknown {
            if !matches!(
                self.state.occupancy,
                OccupancyState::SystemError | OccupancyState::Maintenance
            ) {
                self.enter_system_error(ErrorCause::Sensors, now, "no usable sensor signal");
            }
            return;
        }

        if self.state.occupancy == OccupancyState::SystemError
            && self.error_cause == Some(ErrorCause::Sensors)
        {
            self.error_cause = None;
            let to = match self.state.session.as_ref().filter(|s| s.outcome.is_none()) {
                Some(session) => match session.method {
                    AccessMethod::Direct => OccupancyState::OccupiedDirect,
                    AccessMethod::Reservation => OccupancyState::OccupiedReserved,
                },
                None if self.state.pending_entry.is_some() => {
                    // Re-arm the entry window; an elapsed deadline fires on
                    // this same tick
                    if let Some(at) = self
                        .state
                        .pending_entry
                        .and_then(|id| self.queue.get(id).ok().flatten())
                        .and_then(|entry| entry.activation_deadline)
                    {
                        self.deadlines.schedule(DeadlineTag::ReservationEntry, at);
                    }
                    OccupancyState::ReservedPendingEntry
                }
                None => OccupancyState::Free,
            };
            let from = self.transition(to, now);
            self.record(
                EventRecord::new(now, EventKind::SystemRecovered, from, to, self.queue_size())
                    .with_details("sensor signal restored"),
            );
        }

        match self.state.occupancy {
            OccupancyState::ReservedPendingEntry if signal.presence == Presence::Present => {
                self.confirm_entry(now);
            }
            state if state.is_occupied() && signal.presence == Presence::Absent => {
                // Absence counts from the session start at the earliest, so a
                // fresh session is not closed by staleness that predates it
                let absence_started = match self.state.session.as_ref().map(|s| s.started_at) {
                    Some(started) if started > signal.since => started,
                    _ => signal.since,
                };
                let sustained = now.duration_since(absence_started).unwrap_or_default();
                if sustained >= self.tunables.pir_absence() {
                    self.vacate(now);
                }
            }
            _ => {}
        }
    }

    fn confirm_entry(&mut self, now: SystemTime) {
        let Some(id) = self.state.pending_entry else {
            // Pending state without an entry: repair to FREE
            self.transition(OccupancyState::Free, now);
            self.diagnostic(
                now,
                OccupancyState::Free,
                "pending entry state without queue entry",
            );
            return;
        };
        match self.queue.mark_completed(id) {
            Ok(entry) => {
                self.deadlines.cancel(DeadlineTag::ReservationEntry);
                self.state.pending_entry = None;
                self.open_session(AccessMethod::Reservation, Some(entry.user_id.clone()), now);
                let from = self.transition(OccupancyState::OccupiedReserved, now);
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::UserEnteredOffice,
                        from,
                        OccupancyState::OccupiedReserved,
                        self.queue_size(),
                    )
                    .with_user(entry.user_id),
                );
            }
            Err(e) => self.enter_system_error(
                ErrorCause::Persistence,
                now,
                &format!("confirming entry: {e}"),
            ),
        }
    }

    fn vacate(&mut self, now: SystemTime) {
        let from = self.state.occupancy;
        let session = self.close_session(SessionOutcome::Completed, now);
        self.transition(OccupancyState::Free, now);
        let mut record = EventRecord::new(
            now,
            EventKind::UserLeftOffice,
            from,
            OccupancyState::Free,
            self.queue_size(),
        );
        if let Some(session) = session {
            record = record.with_duration(session.duration_minutes(now));
            if let Some(user) = session.user_id {
                record = record.with_user(user);
            }
        }
        self.record(record);
    }

    // Deadline-driven transitions

    fn evaluate_deadlines(&mut self, now: SystemTime, signal: &FusionSignal) {
        for tag in self.deadlines.expired(now) {
            match tag {
                DeadlineTag::ReservationEntry => self.entry_window_elapsed(now),
                DeadlineTag::MaxOccupancy => self.occupancy_exceeded(now),
                DeadlineTag::MovementWarning => self.movement_warning(now, signal),
                DeadlineTag::DailyReset => self.daily_reset(now),
            }
        }
    }

    fn entry_window_elapsed(&mut self, now: SystemTime) {
        if self.state.occupancy != OccupancyState::ReservedPendingEntry {
            return;
        }
        let Some(id) = self.state.pending_entry.take() else {
            self.transition(OccupancyState::Free, now);
            return;
        };
        match self.queue.mark_no_show(id) {
            Ok(entry) => {
                let from = self.transition(OccupancyState::Free, now);
                self.record(
                    EventRecord::new(
                        now,
                        EventKind::ReservationNoShow,
                        from,
                        OccupancyState::Free,
                        self.queue_size(),
                    )
                    .with_user(entry.user_id.clone())
                    .with_no_show(),
                );
                self.notifications.push(Notification::NoShow {
                    user_id: entry.user_id,
                });
            }
            Err(e) => self.enter_system_error(
                ErrorCause::Persistence,
                now,
                &format!("marking no-show: {e}"),
            ),
        }
    }

    fn occupancy_exceeded(&mut self, now: SystemTime) {
        if !self.state.occupancy.is_occupied() {
            return;
        }
        let from = self.transition(OccupancyState::WarningTimeout, now);
        let user = self.state.session.as_ref().and_then(|s| s.user_id.clone());
        // Advisory only: the session stays open and absence still closes it
        let mut record = EventRecord::new(
            now,
            EventKind::OccupancyTimeout,
            from,
            OccupancyState::WarningTimeout,
            self.queue_size(),
        )
        .with_details("max occupancy exceeded");
        if let Some(user) = user.clone() {
            record = record.with_user(user);
        }
        self.record(record);
        self.notifications
            .push(Notification::TimeoutWarning { user_id: user });
    }

    fn movement_warning(&mut self, now: SystemTime, signal: &FusionSignal) {
        if !self.state.occupancy.is_occupied() {
            return;
        }
        let warning = self.tunables.movement_warning();
        if let Some(last) = signal.last_movement {
            let next = last + warning;
            if next > now {
                // Movement seen since the warning was armed
                self.deadlines.schedule(DeadlineTag::MovementWarning, next);
                return;
            }
        }
        let state = self.state.occupancy;
        let user = self.state.session.as_ref().and_then(|s| s.user_id.clone());
        let mut record = EventRecord::new(
            now,
            EventKind::MovementWarning,
            state,
            state,
            self.queue_size(),
        )
        .with_details("no movement while occupied");
        if let Some(user) = user {
            record = record.with_user(user);
        }
        self.record(record);
        self.deadlines
            .schedule(DeadlineTag::MovementWarning, now + warning);
    }

    fn daily_reset(&mut self, now: SystemTime) {
        let from = self.state.occupancy;
        self.close_session(SessionOutcome::ForcedUnlock, now);
        self.drop_pending_activation();
        let cancelled = match self.queue.cancel_all_open() {
            Ok(cancelled) => cancelled.len(),
            Err(e) => {
                self.enter_system_error(
                    ErrorCause::Persistence,
                    now,
                    &format!("daily reset queue clear: {e}"),
                );
                self.deadlines
                    .schedule(DeadlineTag::DailyReset, self.tunables.next_daily_reset(now));
                return;
            }
        };
        self.error_cause = None;
        self.transition(OccupancyState::Free, now);
        self.record(
            EventRecord::new(now, EventKind::DailyReset, from, OccupancyState::Free, 0)
                .with_details(format!("{cancelled} entries cancelled")),
        );
        if cancelled > 0 {
            self.notifications.push(Notification::QueueCleared);
        }
        self.deadlines
            .schedule(DeadlineTag::DailyReset, self.tunables.next_daily_reset(now));
    }

    // Promotion

    fn evaluate_promotion(&mut self, now: SystemTime, signal: &FusionSignal) {
        if !matches!(
            self.state.occupancy,
            OccupancyState::Free | OccupancyState::QueueActive
        ) {
            return;
        }
        // Never promote into a room that reads as occupied
        if signal.presence == Presence::Present {
            return;
        }

        // An activated entry can survive recovery or an error excursion;
        // re-adopt it before promoting anyone else
        match self.queue.activated() {
            Ok(Some(entry)) => {
                let deadline = entry
                    .activation_deadline
                    .unwrap_or(now + self.tunables.reservation_timeout());
                self.state.pending_entry = Some(entry.id);
                self.deadlines
                    .schedule(DeadlineTag::ReservationEntry, deadline);
                self.transition(OccupancyState::ReservedPendingEntry, now);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                self.enter_system_error(
                    ErrorCause::Persistence,
                    now,
                    &format!("reading activated entry: {e}"),
                );
                return;
            }
        }

        match self.queue.peek_head() {
            Ok(Some(head)) => {
                let deadline = now + self.tunables.reservation_timeout();
                match self.queue.promote(head.id, deadline) {
                    Ok(entry) => {
                        self.state.pending_entry = Some(entry.id);
                        self.deadlines
                            .schedule(DeadlineTag::ReservationEntry, deadline);
                        let from = self.transition(OccupancyState::ReservedPendingEntry, now);
                        self.record(
                            EventRecord::new(
                                now,
                                EventKind::ReservationActivated,
                                from,
                                OccupancyState::ReservedPendingEntry,
                                self.queue_size(),
                            )
                            .with_user(entry.user_id.clone()),
                        );
                        self.notifications.push(Notification::YourTurn {
                            user_id: entry.user_id,
                            timeout_minutes: self.tunables.reservation_timeout_minutes,
                        });
                    }
                    Err(e) => self.enter_system_error(
                        ErrorCause::Persistence,
                        now,
                        &format!("promoting queue head: {e}"),
                    ),
                }
            }
            Ok(None) => {
                if self.state.occupancy == OccupancyState::QueueActive {
                    self.transition(OccupancyState::Free, now);
                }
            }
            Err(e) => self.enter_system_error(
                ErrorCause::Persistence,
                now,
                &format!("reading queue head: {e}"),
            ),
        }
    }

    // Shared plumbing

    fn open_session(&mut self, method: AccessMethod, user_id: Option<String>, now: SystemTime) {
        self.state.session = Some(OccupantSession::open(method, user_id, now));
        self.deadlines.schedule(
            DeadlineTag::MaxOccupancy,
            now + self.tunables.max_occupancy(),
        );
        self.deadlines.schedule(
            DeadlineTag::MovementWarning,
            now + self.tunables.movement_warning(),
        );
        self.dirty = true;
    }

    fn close_session(
        &mut self,
        outcome: SessionOutcome,
        now: SystemTime,
    ) -> Option<OccupantSession> {
        let mut session = self.state.session.take()?;
        session.close(outcome, now);
        self.deadlines.cancel(DeadlineTag::MaxOccupancy);
        self.deadlines.cancel(DeadlineTag::MovementWarning);
        self.dirty = true;
        Some(session)
    }

    fn drop_pending_activation(&mut self) {
        if let Some(id) = self.state.pending_entry.take() {
            self.deadlines.cancel(DeadlineTag::ReservationEntry);
            if let Err(e) = self.queue.cancel(id) {
                warn!(error = %e, entry = id, "Failed to cancel pending activation");
            }
            self.dirty = true;
        }
    }

    fn transition(&mut self, to: OccupancyState, now: SystemTime) -> OccupancyState {
        let from = self.state.occupancy;
        if from != to {
            info!(from = ?from, to = ?to, "State transition");
        }
        self.state.occupancy = to;
        self.state.updated_at = now;
        self.dirty = true;
        from
    }

    fn enter_system_error(&mut self, cause: ErrorCause, now: SystemTime, details: &str) {
        if self.state.occupancy == OccupancyState::SystemError {
            if cause == ErrorCause::Persistence {
                self.error_cause = Some(ErrorCause::Persistence);
            }
            return;
        }
        error!(details = details, "Entering SYSTEM_ERROR");
        self.error_cause = Some(cause);
        let from = self.transition(OccupancyState::SystemError, now);
        self.record(
            EventRecord::new(
                now,
                EventKind::SystemError,
                from,
                OccupancyState::SystemError,
                self.queue_size(),
            )
            .with_details(details),
        );
        self.notifications.push(Notification::SystemError);
    }

    /// Unlisted (state, trigger) pairs are no-ops that still leave a trace.
    fn diagnostic(&mut self, now: SystemTime, state: OccupancyState, details: &str) {
        self.record(
            EventRecord::new(now, EventKind::IgnoredTrigger, state, state, self.queue_size())
                .with_details(details),
        );
    }

    fn record(&mut self, record: EventRecord) {
        if let Err(e) = self.events.append(&record) {
            warn!(error = %e, kind = ?record.kind, "Failed to append event record");
        }
    }

    fn queue_size(&self) -> u32 {
        self.queue.waiting_len().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read queue length");
            0
        })
    }

    fn base_wait_minutes(&self, now: SystemTime) -> u32 {
        if let Some(session) = self.state.session.as_ref().filter(|s| s.outcome.is_none()) {
            let elapsed = session.duration_minutes(now);
            self.tunables.max_occupancy_minutes.saturating_sub(elapsed)
        } else if self.state.occupancy == OccupancyState::ReservedPendingEntry {
            self.tunables.reservation_timeout_minutes
        } else {
            0
        }
    }

    fn persist(&mut self, now: SystemTime) {
        if !self.dirty {
            return;
        }
        match self.store.save_system_state(&self.state) {
            Ok(()) => self.dirty = false,
            Err(e) => {
                error!(error = %e, "Failed to persist system state");
                self.enter_system_error(
                    ErrorCause::Persistence,
                    now,
                    &format!("state snapshot write failed: {e}"),
                );
            }
        }
    }
}

// Tick loop

/// One full polling cycle: sample sensors, fuse, drain the trigger stream,
/// evaluate, publish.
pub fn run_tick(
    orchestrator: &mut Orchestrator,
    rig: &mut SensorRig,
    fusion: &mut SensorFusion,
    app_state: &Arc<RwLock<AppState>>,
    triggers: &mut UnboundedReceiver<Trigger>,
    notifications: &std::sync::mpsc::Sender<Notification>,
    now: SystemTime,
) {
    let mut drained = Vec::new();
    while let Ok(trigger) = triggers.try_recv() {
        drained.push(trigger);
    }
    // The physical button is just another trigger in the serialized stream
    if rig.button_pressed() {
        drained.push(Trigger::DirectPress);
    }

    // Config replacements apply between evaluations, before anything else
    let mut pending = Vec::with_capacity(drained.len());
    for trigger in drained {
        match trigger {
            Trigger::Admin(AdminAction::UpdateTunables(tunables)) => {
                orchestrator.apply_tunables(tunables, now);
            }
            other => pending.push(other),
        }
    }

    let sample = rig.sample(now);
    let signal = fusion.update(sample.inputs, &orchestrator.fusion_config());

    let outcome = orchestrator.tick(now, &signal, pending);
    for notification in outcome.notifications {
        if notifications.send(notification).is_err() {
            warn!("Notification channel closed");
        }
    }

    match app_state.write() {
        Ok(mut guard) => {
            guard.set_tunables(orchestrator.tunables().clone());
            if let Err(e) = guard.set_status(orchestrator.snapshot(now)) {
                warn!(error = %e, "Failed to publish status snapshot");
            }
            let health = SystemHealth {
                pir: sample.pir,
                ultrasonic: sample.ultrasonic,
                storage_ok: orchestrator.storage_ok(),
            };
            if let Err(e) = guard.set_health(health) {
                warn!(error = %e, "Failed to publish health");
            }
        }
        Err(_) => warn!("State lock poisoned while publishing snapshot"),
    }
}

pub fn spawn_poll_thread(
    mut orchestrator: Orchestrator,
    mut rig: SensorRig,
    mut fusion: SensorFusion,
    app_state: Arc<RwLock<AppState>>,
    mut triggers: UnboundedReceiver<Trigger>,
    notifications: std::sync::mpsc::Sender<Notification>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        info!(interval_ms = interval.as_millis(), "Polling loop started");
        while !stop.load(Ordering::Relaxed) {
            let cycle_start = Instant::now();
            run_tick(
                &mut orchestrator,
                &mut rig,
                &mut fusion,
                &app_state,
                &mut triggers,
                &notifications,
                SystemTime::now(),
            );
            sleep_with_stop(interval, &stop, cycle_start);
        }
    })
}

fn sleep_with_stop(duration: Duration, stop: &AtomicBool, start: Instant) {
    let elapsed = start.elapsed();
    if elapsed >= duration {
        return;
    }
    let remaining = duration - elapsed;
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;

    while slept < remaining {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        std::thread::sleep(step.min(remaining - slept));
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::queue::EntryStatus;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn harness() -> Orchestrator {
        harness_with(Tunables::default())
    }

    fn harness_with(tunables: Tunables) -> Orchestrator {
        let store = Store::open_temporary().expect("open temp store");
        let queue = QueueStore::open(store.db()).expect("open queue");
        let events = EventLog::open(store.db()).expect("open events");
        Orchestrator::new(
            SystemState::fresh(at(0)),
            tunables,
            queue,
            events,
            store,
            at(0),
        )
    }

    fn present(since_secs: u64) -> FusionSignal {
        FusionSignal {
            presence: Presence::Present,
            since: at(since_secs),
            last_movement: Some(at(since_secs)),
            pir_available: true,
            ultrasonic_available: true,
        }
    }

    fn absent(since_secs: u64) -> FusionSignal {
        FusionSignal {
            presence: Presence::Absent,
            since: at(since_secs),
            last_movement: None,
            pir_available: true,
            ultrasonic_available: true,
        }
    }

    fn unknown(since_secs: u64) -> FusionSignal {
        FusionSignal {
            presence: Presence::Unknown,
            since: at(since_secs),
            last_movement: None,
            pir_available: false,
            ultrasonic_available: false,
        }
    }

    fn booking(user_id: &str) -> Trigger {
        Trigger::Booking {
            user_id: user_id.to_string(),
        }
    }

    fn events_of(orchestrator: &Orchestrator, kind: EventKind) -> usize {
        orchestrator
            .events
            .recent(200)
            .expect("read events")
            .iter()
            .filter(|record| record.kind == kind)
            .count()
    }

    #[test]
    fn booking_when_free_and_queue_empty_opens_reserved_session() {
        let mut orchestrator = harness();

        let outcome = orchestrator.tick(at(10), &absent(10), vec![booking("USER_001")]);

        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::OccupiedReserved
        );
        let session = orchestrator.state.session.as_ref().expect("session open");
        assert_eq!(session.method, AccessMethod::Reservation);
        assert_eq!(session.user_id.as_deref(), Some("USER_001"));
        assert_eq!(orchestrator.queue.waiting_len().expect("len"), 0);
        assert!(outcome.notifications.iter().any(|n| matches!(
            n,
            Notification::ReservationConfirmed { user_id, .. } if user_id == "USER_001"
        )));
    }

    #[test]
    fn booking_while_occupied_enqueues_waiting_entry() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);

        orchestrator.tick(at(20), &present(10), vec![booking("USER_001")]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);
        let waiting = orchestrator.queue.waiting().expect("waiting");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].user_id, "USER_001");
        assert_eq!(waiting[0].status, EntryStatus::Waiting);
    }

    #[test]
    fn vacancy_promotes_head_and_times_out_as_no_show() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        orchestrator.tick(at(20), &present(10), vec![booking("USER_001")]);

        // Absent for 40s against the 30s threshold: session closes, head
        // is promoted with a 3 minute entry window
        let outcome = orchestrator.tick(at(100), &absent(60), vec![]);

        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::ReservedPendingEntry
        );
        assert!(orchestrator.state.session.is_none());
        let promoted = orchestrator
            .queue
            .activated()
            .expect("read activated")
            .expect("entry promoted");
        assert_eq!(promoted.user_id, "USER_001");
        assert_eq!(promoted.activation_deadline, Some(at(280)));
        assert!(outcome.notifications.iter().any(|n| matches!(
            n,
            Notification::YourTurn { user_id, timeout_minutes: 3 } if user_id == "USER_001"
        )));

        // Window elapses with no confirmation
        let outcome = orchestrator.tick(at(281), &absent(100), vec![]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
        assert_eq!(
            orchestrator
                .queue
                .get(promoted.id)
                .expect("get entry")
                .map(|e| e.status),
            Some(EntryStatus::NoShow)
        );
        assert!(outcome.notifications.iter().any(|n| matches!(
            n,
            Notification::NoShow { user_id } if user_id == "USER_001"
        )));

        // Re-running the timeout check is a no-op
        let outcome = orchestrator.tick(at(282), &absent(100), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
        assert!(outcome.notifications.is_empty());
        assert_eq!(events_of(&orchestrator, EventKind::ReservationNoShow), 1);
    }

    #[test]
    fn pending_entry_confirmed_by_presence_opens_session() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        orchestrator.tick(at(20), &present(10), vec![booking("USER_001")]);
        orchestrator.tick(at(100), &absent(60), vec![]);
        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::ReservedPendingEntry
        );

        orchestrator.tick(at(150), &present(150), vec![]);

        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::OccupiedReserved
        );
        let session = orchestrator.state.session.as_ref().expect("session open");
        assert_eq!(session.user_id.as_deref(), Some("USER_001"));
        assert_eq!(orchestrator.state.pending_entry, None);
    }

    #[test]
    fn sustained_absence_is_required_before_vacancy() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        // 29s of absence: still occupied
        orchestrator.tick(at(129), &absent(100), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);

        // 30s: vacated
        orchestrator.tick(at(130), &absent(100), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
        assert_eq!(events_of(&orchestrator, EventKind::UserLeftOffice), 1);
    }

    #[test]
    fn stale_absence_does_not_close_a_fresh_session() {
        let mut orchestrator = harness();

        // Button pressed in a room that has read absent for a long time
        orchestrator.tick(at(1000), &absent(0), vec![Trigger::DirectPress]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);

        // The grace window runs from the session start, not from stale absence
        orchestrator.tick(at(1029), &absent(0), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);
        orchestrator.tick(at(1030), &absent(0), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
    }

    #[test]
    fn presence_priority_direct_press_displaces_reserved_session() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &absent(10), vec![booking("USER_001")]);
        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::OccupiedReserved
        );

        orchestrator.tick(at(20), &present(20), vec![Trigger::DirectPress]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);
        let session = orchestrator.state.session.as_ref().expect("session open");
        assert_eq!(session.method, AccessMethod::Direct);
        assert_eq!(session.user_id, None);
        assert_eq!(events_of(&orchestrator, EventKind::ConflictResolved), 1);
    }

    #[test]
    fn presence_priority_cancels_at_most_one_pending_reservation() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        orchestrator.tick(
            at(20),
            &present(10),
            vec![booking("USER_001"), booking("USER_002")],
        );
        orchestrator.tick(at(100), &absent(60), vec![]);
        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::ReservedPendingEntry
        );
        let promoted = orchestrator
            .queue
            .activated()
            .expect("read activated")
            .expect("entry promoted");

        orchestrator.tick(at(110), &absent(110), vec![Trigger::DirectPress]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);
        assert_eq!(
            orchestrator
                .queue
                .get(promoted.id)
                .expect("get entry")
                .map(|e| e.status),
            Some(EntryStatus::Cancelled)
        );
        // The rest of the queue is untouched
        let waiting = orchestrator.queue.waiting().expect("waiting");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].user_id, "USER_002");
    }

    #[test]
    fn reservation_priority_rejects_direct_press_while_reserved() {
        let mut orchestrator = harness_with(Tunables {
            conflict_priority: ConflictPriority::Reservation,
            ..Tunables::default()
        });
        orchestrator.tick(at(10), &absent(10), vec![booking("USER_001")]);

        orchestrator.tick(at(20), &present(20), vec![Trigger::DirectPress]);

        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::OccupiedReserved
        );
        let session = orchestrator.state.session.as_ref().expect("session kept");
        assert_eq!(session.user_id.as_deref(), Some("USER_001"));
        assert_eq!(events_of(&orchestrator, EventKind::DirectAccessRejected), 1);
    }

    #[test]
    fn reservation_priority_rejects_direct_press_in_queue_active() {
        // Documented edge: queue order is authoritative even before anyone
        // has been promoted
        let mut orchestrator = harness_with(Tunables {
            conflict_priority: ConflictPriority::Reservation,
            ..Tunables::default()
        });
        orchestrator.state.occupancy = OccupancyState::QueueActive;
        orchestrator
            .queue
            .enqueue("USER_001", at(5), 7)
            .expect("enqueue");

        orchestrator.tick(at(10), &absent(10), vec![Trigger::DirectPress]);

        // The press was rejected; the queue head takes the room instead
        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::ReservedPendingEntry
        );
        assert!(orchestrator.state.session.is_none());
        assert_eq!(events_of(&orchestrator, EventKind::DirectAccessRejected), 1);
        let promoted = orchestrator
            .queue
            .activated()
            .expect("read activated")
            .expect("head promoted");
        assert_eq!(promoted.user_id, "USER_001");
    }

    #[test]
    fn max_occupancy_is_advisory_only() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        // 10 minutes later the warning fires but the session survives
        let outcome = orchestrator.tick(at(10 + 600), &present(10), vec![]);

        assert_eq!(
            orchestrator.state.occupancy,
            OccupancyState::WarningTimeout
        );
        assert!(orchestrator.state.session.is_some());
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, Notification::TimeoutWarning { .. })));

        // Departure still closes it as completed
        orchestrator.tick(at(700), &absent(660), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
        assert_eq!(events_of(&orchestrator, EventKind::UserLeftOffice), 1);
    }

    #[test]
    fn daily_reset_clears_session_and_queue() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        orchestrator.tick(
            at(20),
            &present(10),
            vec![booking("USER_001"), booking("USER_002")],
        );

        // 23:59 of day zero
        let reset_at = 23 * 3600 + 59 * 60;
        let outcome = orchestrator.tick(at(reset_at), &present(10), vec![]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
        assert!(orchestrator.state.session.is_none());
        assert!(orchestrator.queue.waiting().expect("waiting").is_empty());
        assert_eq!(events_of(&orchestrator, EventKind::DailyReset), 1);
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, Notification::QueueCleared)));
        // Re-armed for the next day
        assert_eq!(
            orchestrator.deadlines.deadline(DeadlineTag::DailyReset),
            Some(at(reset_at as u64 + 86_400))
        );
    }

    #[test]
    fn admin_force_unlock_closes_session_as_forced() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        orchestrator.tick(
            at(20),
            &present(10),
            vec![Trigger::Admin(AdminAction::ForceUnlock)],
        );

        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
        assert!(orchestrator.state.session.is_none());
        assert_eq!(events_of(&orchestrator, EventKind::ForceUnlock), 1);
    }

    #[test]
    fn unknown_sensors_enter_system_error_and_recover() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        let outcome = orchestrator.tick(at(20), &unknown(20), vec![]);

        assert_eq!(orchestrator.state.occupancy, OccupancyState::SystemError);
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, Notification::SystemError)));

        // Bookings are refused while in error
        orchestrator.tick(at(30), &unknown(20), vec![booking("USER_001")]);
        assert_eq!(orchestrator.queue.waiting_len().expect("len"), 0);
        assert_eq!(events_of(&orchestrator, EventKind::BookingRejected), 1);

        // Sensors return: the surviving session decides the state
        orchestrator.tick(at(40), &present(40), vec![]);
        assert_eq!(orchestrator.state.occupancy, OccupancyState::OccupiedDirect);
        assert!(orchestrator.state.session.is_some());
        assert_eq!(events_of(&orchestrator, EventKind::SystemRecovered), 1);
    }

    #[test]
    fn duplicate_booking_is_rejected_at_the_machine() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        orchestrator.tick(
            at(20),
            &present(10),
            vec![booking("USER_001"), booking("USER_001")],
        );

        assert_eq!(orchestrator.queue.waiting_len().expect("len"), 1);
        assert_eq!(events_of(&orchestrator, EventKind::BookingRejected), 1);
    }

    #[test]
    fn queue_cap_is_enforced() {
        let mut orchestrator = harness_with(Tunables {
            max_queue_size: 2,
            ..Tunables::default()
        });
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        orchestrator.tick(
            at(20),
            &present(10),
            vec![
                booking("USER_001"),
                booking("USER_002"),
                booking("USER_003"),
            ],
        );

        assert_eq!(orchestrator.queue.waiting_len().expect("len"), 2);
        assert_eq!(events_of(&orchestrator, EventKind::BookingRejected), 1);
    }

    #[test]
    fn cancel_booking_releases_the_slot() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        orchestrator.tick(
            at(20),
            &present(10),
            vec![booking("USER_001"), booking("USER_002")],
        );

        orchestrator.tick(
            at(30),
            &present(10),
            vec![Trigger::CancelBooking {
                user_id: "USER_001".to_string(),
            }],
        );

        let waiting = orchestrator.queue.waiting().expect("waiting");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].user_id, "USER_002");
        assert_eq!(events_of(&orchestrator, EventKind::ReservationCancelled), 1);
    }

    #[test]
    fn replace_booking_swaps_the_holder() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);
        orchestrator.tick(at(20), &present(10), vec![booking("USER_001")]);

        orchestrator.tick(
            at(30),
            &present(10),
            vec![Trigger::ReplaceBooking {
                user_id: "USER_001".to_string(),
                new_user_id: "USER_009".to_string(),
            }],
        );

        let waiting = orchestrator.queue.waiting().expect("waiting");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].user_id, "USER_009");
        assert_eq!(events_of(&orchestrator, EventKind::ReservationReplaced), 1);
    }

    #[test]
    fn maintenance_is_an_admin_sink() {
        let mut orchestrator = harness();
        orchestrator.tick(at(10), &present(10), vec![Trigger::DirectPress]);

        orchestrator.tick(
            at(20),
            &present(10),
            vec![Trigger::Admin(AdminAction::EnterMaintenance)],
        );
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Maintenance);
        assert!(orchestrator.state.session.is_none());

        // Neither presses nor bookings move the machine
        orchestrator.tick(
            at(30),
            &present(10),
            vec![Trigger::DirectPress, booking("USER_001")],
        );
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Maintenance);
        assert_eq!(orchestrator.queue.waiting_len().expect("len"), 0);

        orchestrator.tick(
            at(40),
            &absent(40),
            vec![Trigger::Admin(AdminAction::ExitMaintenance)],
        );
        assert_eq!(orchestrator.state.occupancy, OccupancyState::Free);
    }

    #[test]
    fn tunables_update_applies_and_persists() {
        let mut orchestrator = harness();
        let updated = Tunables {
            max_queue_size: 1,
            ..Tunables::default()
        };

        orchestrator.tick(
            at(10),
            &present(10),
            vec![
                Trigger::DirectPress,
                Trigger::Admin(AdminAction::UpdateTunables(updated.clone())),
            ],
        );

        assert_eq!(orchestrator.tunables().max_queue_size, 1);
        assert_eq!(events_of(&orchestrator, EventKind::ConfigUpdated), 1);
        assert_eq!(
            orchestrator.store.load_tunables().expect("load"),
            Some(updated)
        );

        // The new cap binds immediately on the next evaluation
        orchestrator.tick(
            at(20),
            &present(10),
            vec![booking("USER_001"), booking("USER_002")],
        );
        assert_eq!(orchestrator.queue.waiting_len().expect("len"), 1);
    }

    #[test]
    fn invalid_tunables_update_is_ignored() {
        let mut orchestrator = harness();
        let broken = Tunables {
            max_queue_size: 0,
            ..Tunables::default()
        };

        orchestrator.tick(
            at(10),
            &absent(10),
            vec![Trigger::Admin(AdminAction::UpdateTunables(broken))],
        );

        assert_eq!(orchestrator.tunables().max_queue_size, 7);
        assert_eq!(events_of(&orchestrator, EventKind::ConfigUpdated), 0);
    }

    #[test]
    fn state_snapshot_is_persisted_on_transition() {
        let mut orchestrator = harness();

        orchestrator.tick(at(10), &absent(10), vec![booking("USER_001")]);

        let persisted = orchestrator
            .store
            .load_system_state()
            .expect("load state")
            .expect("state persisted");
        assert_eq!(persisted.occupancy, OccupancyState::OccupiedReserved);
        assert_eq!(
            persisted.session.and_then(|s| s.user_id).as_deref(),
            Some("USER_001")
        );
    }

    #[test]
    fn status_snapshot_reports_queue_and_wait_estimates() {
        let mut orchestrator = harness();
        orchestrator.tick(at(0), &present(0), vec![Trigger::DirectPress]);
        orchestrator.tick(
            at(60),
            &present(0),
            vec![booking("USER_001"), booking("USER_002")],
        );

        let snapshot = orchestrator.snapshot(at(120));

        assert_eq!(snapshot.state, OccupancyState::OccupiedDirect);
        assert_eq!(snapshot.queue_size, 2);
        // 2 minutes elapsed of a 10 minute allowance: 8 remaining
        assert_eq!(snapshot.estimated_wait_minutes, 8);
        assert_eq!(snapshot.queue[0].wait_minutes, 8);
        assert_eq!(snapshot.queue[1].wait_minutes, 18);
        assert_eq!(snapshot.next_user.as_deref(), Some("USER_001"));
    }
}
