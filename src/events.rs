//! Append-only audit log. Records are write-once; analytics and recovery
//! diagnostics read them, nothing rewrites them.

use crate::error::AppError;
use crate::state::OccupancyState;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub const TREE_NAME: &str = "events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    UserEnteredOffice,
    UserLeftOffice,
    BookingConfirmed,
    BookingRejected,
    ReservationActivated,
    ReservationNoShow,
    ReservationCancelled,
    ReservationReplaced,
    ConflictResolved,
    DirectAccessRejected,
    OccupancyTimeout,
    MovementWarning,
    ForceUnlock,
    QueueCleared,
    DailyReset,
    Recovery,
    SystemError,
    SystemRecovered,
    ConfigUpdated,
    MaintenanceEntered,
    MaintenanceExited,
    IgnoredTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: SystemTime,
    pub kind: EventKind,
    pub user_id: Option<String>,
    pub state_from: OccupancyState,
    pub state_to: OccupancyState,
    pub queue_size: u32,
    pub duration_minutes: Option<u32>,
    pub no_show: bool,
    pub conflict_occurred: bool,
    pub details: Option<String>,
}

impl EventRecord {
    pub fn new(
        timestamp: SystemTime,
        kind: EventKind,
        state_from: OccupancyState,
        state_to: OccupancyState,
        queue_size: u32,
    ) -> Self {
        Self {
            timestamp,
            kind,
            user_id: None,
            state_from,
            state_to,
            queue_size,
            duration_minutes: None,
            no_show: false,
            conflict_occurred: false,
            details: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }

    pub fn with_no_show(mut self) -> Self {
        self.no_show = true;
        self
    }

    pub fn with_conflict(mut self) -> Self {
        self.conflict_occurred = true;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Clone)]
pub struct EventLog {
    db: sled::Db,
    tree: sled::Tree,
}

impl EventLog {
    pub fn open(db: &sled::Db) -> Result<Self, AppError> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self {
            db: db.clone(),
            tree,
        })
    }

    pub fn append(&self, record: &EventRecord) -> Result<(), AppError> {
        let key = self.db.generate_id()?.to_be_bytes();
        let value = serde_json::to_vec(record)?;
        self.tree.insert(key, value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<EventRecord>, AppError> {
        let mut records = Vec::with_capacity(limit);
        for item in self.tree.iter().rev() {
            if records.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
