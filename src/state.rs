use crate::config::Tunables;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyState {
    Free,
    OccupiedDirect,
    OccupiedReserved,
    QueueActive,
    ReservedPendingEntry,
    WarningTimeout,
    SystemError,
    Maintenance,
}

impl OccupancyState {
    /// True while an occupant session is physically in the room.
    pub fn is_occupied(self) -> bool {
        matches!(
            self,
            Self::OccupiedDirect | Self::OccupiedReserved | Self::WarningTimeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMethod {
    Direct,
    Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    NoShow,
    ForcedUnlock,
}

/// One use of the room. Created at entry, closed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupantSession {
    pub method: AccessMethod,
    pub user_id: Option<String>,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub outcome: Option<SessionOutcome>,
}

impl OccupantSession {
    pub fn open(method: AccessMethod, user_id: Option<String>, started_at: SystemTime) -> Self {
        Self {
            method,
            user_id,
            started_at,
            ended_at: None,
            outcome: None,
        }
    }

    pub fn close(&mut self, outcome: SessionOutcome, at: SystemTime) {
        self.ended_at = Some(at);
        self.outcome = Some(outcome);
    }

    pub fn duration_minutes(&self, now: SystemTime) -> u32 {
        let end = self.ended_at.unwrap_or(now);
        let secs = end
            .duration_since(self.started_at)
            .unwrap_or_default()
            .as_secs();
        (secs / 60) as u32
    }
}

/// The single mutable value owned by the orchestrator. Persisted on every
/// transition and reloaded by recovery at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub occupancy: OccupancyState,
    pub session: Option<OccupantSession>,
    pub pending_entry: Option<EntryId>,
    pub updated_at: SystemTime,
}

impl SystemState {
    pub fn fresh(now: SystemTime) -> Self {
        Self {
            occupancy: OccupancyState::Free,
            session: None,
            pending_entry: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuePosition {
    pub position: u32,
    pub user_id: String,
    pub wait_minutes: u32,
}

/// Read-only fan-out value rebuilt once per tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: OccupancyState,
    pub occupied_by: Option<String>,
    pub occupation_start: Option<SystemTime>,
    pub pending_user: Option<String>,
    pub pending_deadline: Option<SystemTime>,
    pub queue: Vec<QueuePosition>,
    pub queue_size: u32,
    pub next_user: Option<String>,
    pub estimated_wait_minutes: u32,
    pub updated_at: SystemTime,
}

impl StatusSnapshot {
    pub fn empty(at: SystemTime) -> Self {
        Self {
            state: OccupancyState::Free,
            occupied_by: None,
            occupation_start: None,
            pending_user: None,
            pending_deadline: None,
            queue: Vec::new(),
            queue_size: 0,
            next_user: None,
            estimated_wait_minutes: 0,
            updated_at: at,
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::empty(UNIX_EPOCH)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorHealth {
    Ok,
    Error { message: String },
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemHealth {
    pub pir: SensorHealth,
    pub ultrasonic: SensorHealth,
    pub storage_ok: bool,
}

impl Default for SystemHealth {
    fn default() -> Self {
        Self {
            pir: SensorHealth::Ok,
            ultrasonic: SensorHealth::Ok,
            storage_ok: true,
        }
    }
}

#[derive(Debug)]
pub struct AppState {
    status: StatusSnapshot,
    status_tx: watch::Sender<StatusSnapshot>,
    // Held so publishing never fails between external subscriptions
    _status_rx: watch::Receiver<StatusSnapshot>,
    health: SystemHealth,
    health_tx: watch::Sender<SystemHealth>,
    _health_rx: watch::Receiver<SystemHealth>,
    tunables: Tunables,
}

impl AppState {
    pub fn new(tunables: Tunables) -> Self {
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let (health_tx, health_rx) = watch::channel(SystemHealth::default());
        Self {
            status: StatusSnapshot::default(),
            status_tx,
            _status_rx: status_rx,
            health: SystemHealth::default(),
            health_tx,
            _health_rx: health_rx,
            tunables,
        }
    }

    pub fn status(&self) -> &StatusSnapshot {
        &self.status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn set_status(&mut self, status: StatusSnapshot) -> Result<(), AppError> {
        self.status = status.clone();
        self.status_tx.send(status).map_err(|_| AppError::WatchSend)
    }

    pub fn health(&self) -> &SystemHealth {
        &self.health
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SystemHealth> {
        self.health_tx.subscribe()
    }

    pub fn set_health(&mut self, health: SystemHealth) -> Result<(), AppError> {
        self.health = health.clone();
        self.health_tx.send(health).map_err(|_| AppError::WatchSend)
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn set_tunables(&mut self, tunables: Tunables) {
        self.tunables = tunables;
    }
}
