//! Embedded database handle. Owns the sled `Db` and the snapshot trees for
//! system state and the tunables override; the queue and event log open
//! their own trees from the same database.

use crate::config::Tunables;
use crate::error::AppError;
use crate::state::SystemState;
use std::path::Path;

pub const SYSTEM_TREE: &str = "system";
pub const CONFIG_TREE: &str = "config";
const STATE_KEY: &[u8] = b"state";
const TUNABLES_KEY: &[u8] = b"tunables";

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    system: sled::Tree,
    config: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed on drop. Test harness entry point.
    pub fn open_temporary() -> Result<Self, AppError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, AppError> {
        let system = db.open_tree(SYSTEM_TREE)?;
        let config = db.open_tree(CONFIG_TREE)?;
        Ok(Self { db, system, config })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn save_system_state(&self, state: &SystemState) -> Result<(), AppError> {
        let value = serde_json::to_vec(state)?;
        self.system.insert(STATE_KEY, value)?;
        self.system.flush()?;
        Ok(())
    }

    /// `Ok(None)` when no snapshot was ever written; `Err` when a snapshot
    /// exists but cannot be decoded (corruption — the caller must not guess).
    pub fn load_system_state(&self) -> Result<Option<SystemState>, AppError> {
        match self.system.get(STATE_KEY)? {
            Some(bytes) => {
                let state = serde_json::from_slice(&bytes).map_err(|e| {
                    AppError::Recovery(format!("persisted system state unreadable: {e}"))
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn save_tunables(&self, tunables: &Tunables) -> Result<(), AppError> {
        let value = serde_json::to_vec(tunables)?;
        self.config.insert(TUNABLES_KEY, value)?;
        self.config.flush()?;
        Ok(())
    }

    /// Persisted admin override, if any. A corrupt override is discarded
    /// (the file config still applies), unlike a corrupt state snapshot.
    pub fn load_tunables(&self) -> Result<Option<Tunables>, AppError> {
        match self.config.get(TUNABLES_KEY)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(tunables) => Ok(Some(tunables)),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable tunables override");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}
