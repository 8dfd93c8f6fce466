//! Durable FIFO of reservation requests. Every mutation is flushed to disk
//! before it is acknowledged, so an entry that was confirmed to a caller
//! survives a crash on the very next instruction.

use crate::error::AppError;
use crate::state::EntryId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub const TREE_NAME: &str = "queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Waiting,
    Activated,
    Completed,
    NoShow,
    Cancelled,
}

impl EntryStatus {
    /// Waiting and activated entries hold a live claim on the room.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Waiting | Self::Activated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub user_id: String,
    pub enqueued_at: SystemTime,
    pub status: EntryStatus,
    pub activation_deadline: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateUser,
    QueueFull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Accepted(QueueEntry),
    Rejected(RejectReason),
}

#[derive(Clone)]
pub struct QueueStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl QueueStore {
    pub fn open(db: &sled::Db) -> Result<Self, AppError> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self {
            db: db.clone(),
            tree,
        })
    }

    pub fn enqueue(
        &self,
        user_id: &str,
        now: SystemTime,
        max_queue_size: u32,
    ) -> Result<EnqueueOutcome, AppError> {
        if self.live_entry_for(user_id)?.is_some() {
            return Ok(EnqueueOutcome::Rejected(RejectReason::DuplicateUser));
        }
        if self.waiting_len()? >= max_queue_size {
            return Ok(EnqueueOutcome::Rejected(RejectReason::QueueFull));
        }

        let entry = QueueEntry {
            id: self.db.generate_id()?,
            user_id: user_id.to_string(),
            enqueued_at: now,
            status: EntryStatus::Waiting,
            activation_deadline: None,
        };
        self.persist(&entry)?;
        Ok(EnqueueOutcome::Accepted(entry))
    }

    pub fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, AppError> {
        match self.tree.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Result<Vec<QueueEntry>, AppError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Waiting entries in strict enqueue order.
    pub fn waiting(&self) -> Result<Vec<QueueEntry>, AppError> {
        let mut waiting: Vec<QueueEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Waiting)
            .collect();
        waiting.sort_by(|a, b| (a.enqueued_at, a.id).cmp(&(b.enqueued_at, b.id)));
        Ok(waiting)
    }

    pub fn waiting_len(&self) -> Result<u32, AppError> {
        Ok(self.waiting()?.len() as u32)
    }

    pub fn peek_head(&self) -> Result<Option<QueueEntry>, AppError> {
        Ok(self.waiting()?.into_iter().next())
    }

    /// The entry currently promoted to "next", if any.
    pub fn activated(&self) -> Result<Option<QueueEntry>, AppError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.status == EntryStatus::Activated))
    }

    pub fn live_entry_for(&self, user_id: &str) -> Result<Option<QueueEntry>, AppError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.status.is_open() && e.user_id == user_id))
    }

    pub fn promote(&self, id: EntryId, deadline: SystemTime) -> Result<QueueEntry, AppError> {
        self.update(id, |entry| {
            entry.status = EntryStatus::Activated;
            entry.activation_deadline = Some(deadline);
        })
    }

    pub fn mark_completed(&self, id: EntryId) -> Result<QueueEntry, AppError> {
        self.update(id, |entry| entry.status = EntryStatus::Completed)
    }

    pub fn mark_no_show(&self, id: EntryId) -> Result<QueueEntry, AppError> {
        self.update(id, |entry| entry.status = EntryStatus::NoShow)
    }

    pub fn cancel(&self, id: EntryId) -> Result<QueueEntry, AppError> {
        self.update(id, |entry| {
            entry.status = EntryStatus::Cancelled;
            entry.activation_deadline = None;
        })
    }

    /// Swap the holder of a queued slot. Position and (for an activated
    /// entry) the confirmation deadline are kept.
    pub fn replace(&self, id: EntryId, new_user_id: &str) -> Result<QueueEntry, AppError> {
        if let Some(existing) = self.live_entry_for(new_user_id)? {
            if existing.id != id {
                return Err(AppError::Validation(format!(
                    "user {new_user_id} already holds a queue slot"
                )));
            }
        }
        self.update(id, |entry| entry.user_id = new_user_id.to_string())
    }

    /// Cancel every waiting and activated entry. Returns the entries that
    /// were cancelled.
    pub fn cancel_all_open(&self) -> Result<Vec<QueueEntry>, AppError> {
        let mut cancelled = Vec::new();
        for entry in self.entries()? {
            if entry.status.is_open() {
                cancelled.push(self.cancel(entry.id)?);
            }
        }
        Ok(cancelled)
    }

    fn update(
        &self,
        id: EntryId,
        mutate: impl FnOnce(&mut QueueEntry),
    ) -> Result<QueueEntry, AppError> {
        let mut entry = self
            .get(id)?
            .ok_or_else(|| AppError::Validation(format!("no queue entry with id {id}")))?;
        mutate(&mut entry);
        self.persist(&entry)?;
        Ok(entry)
    }

    fn persist(&self, entry: &QueueEntry) -> Result<(), AppError> {
        let value = serde_json::to_vec(entry)?;
        self.tree.insert(entry.id.to_be_bytes(), value)?;
        self.tree.flush()?;
        Ok(())
    }
}
