use crate::error::AppError;
use crate::fusion::FusionMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use time::{OffsetDateTime, Time};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_STORAGE_PATH: &str = "data/ufficio";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub storage: Option<StorageSection>,
    #[serde(default)]
    pub sensors: Option<SensorsSection>,
    #[serde(default)]
    pub tunables: Tunables,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
    /// Orchestrator tick interval in milliseconds (default: 500)
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSection {
    /// Directory for the embedded database (default: data/ufficio)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorsSection {
    #[serde(default = "default_true")]
    pub use_pir: bool,
    #[serde(default = "default_true")]
    pub use_ultrasonic: bool,
    /// BCM pin for the PIR output
    pub pir_pin: Option<u8>,
    /// BCM pins for the HC-SR04 trigger/echo pair
    pub trig_pin: Option<u8>,
    pub echo_pin: Option<u8>,
    /// BCM pin for the direct-access button
    pub button_pin: Option<u8>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPriority {
    Presence,
    Reservation,
}

/// Admin-mutable snapshot of the runtime tunables. Validated when an admin
/// replaces it; the orchestrator reads it without re-checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunables {
    #[serde(default = "defaults::reservation_timeout_minutes")]
    pub reservation_timeout_minutes: u32,
    #[serde(default = "defaults::max_occupancy_minutes")]
    pub max_occupancy_minutes: u32,
    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: u32,
    #[serde(default = "defaults::conflict_priority")]
    pub conflict_priority: ConflictPriority,
    #[serde(default = "defaults::fusion_mode")]
    pub fusion_mode: FusionMode,
    #[serde(default = "defaults::pir_absence_seconds")]
    pub pir_absence_seconds: u32,
    #[serde(default = "defaults::movement_timeout_minutes")]
    pub movement_timeout_minutes: u32,
    #[serde(default = "defaults::movement_warning_minutes")]
    pub movement_warning_minutes: u32,
    #[serde(default = "defaults::presence_threshold_cm")]
    pub presence_threshold_cm: f64,
    /// Daily reset instant as "HH:MM" (UTC)
    #[serde(default = "defaults::auto_reset_time")]
    pub auto_reset_time: String,
    #[serde(default = "defaults::orphan_age_minutes")]
    pub orphan_age_minutes: u32,
}

mod defaults {
    use super::ConflictPriority;
    use crate::fusion::FusionMode;

    pub fn reservation_timeout_minutes() -> u32 {
        3
    }
    pub fn max_occupancy_minutes() -> u32 {
        10
    }
    pub fn max_queue_size() -> u32 {
        7
    }
    pub fn conflict_priority() -> ConflictPriority {
        ConflictPriority::Presence
    }
    pub fn fusion_mode() -> FusionMode {
        FusionMode::And
    }
    pub fn pir_absence_seconds() -> u32 {
        30
    }
    pub fn movement_timeout_minutes() -> u32 {
        5
    }
    pub fn movement_warning_minutes() -> u32 {
        3
    }
    pub fn presence_threshold_cm() -> f64 {
        200.0
    }
    pub fn auto_reset_time() -> String {
        "23:59".to_string()
    }
    pub fn orphan_age_minutes() -> u32 {
        120
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            reservation_timeout_minutes: defaults::reservation_timeout_minutes(),
            max_occupancy_minutes: defaults::max_occupancy_minutes(),
            max_queue_size: defaults::max_queue_size(),
            conflict_priority: defaults::conflict_priority(),
            fusion_mode: defaults::fusion_mode(),
            pir_absence_seconds: defaults::pir_absence_seconds(),
            movement_timeout_minutes: defaults::movement_timeout_minutes(),
            movement_warning_minutes: defaults::movement_warning_minutes(),
            presence_threshold_cm: defaults::presence_threshold_cm(),
            auto_reset_time: defaults::auto_reset_time(),
            orphan_age_minutes: defaults::orphan_age_minutes(),
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.reservation_timeout_minutes == 0 {
            return Err(AppError::Validation(
                "reservation_timeout_minutes must be at least 1".to_string(),
            ));
        }
        if self.max_occupancy_minutes == 0 {
            return Err(AppError::Validation(
                "max_occupancy_minutes must be at least 1".to_string(),
            ));
        }
        if self.max_queue_size == 0 || self.max_queue_size > 100 {
            return Err(AppError::Validation(
                "max_queue_size must be between 1 and 100".to_string(),
            ));
        }
        if !(2.0..=400.0).contains(&self.presence_threshold_cm) {
            return Err(AppError::Validation(
                "presence_threshold_cm must be between 2 and 400".to_string(),
            ));
        }
        if parse_reset_time(&self.auto_reset_time).is_none() {
            return Err(AppError::Validation(format!(
                "auto_reset_time not in HH:MM form: {}",
                self.auto_reset_time
            )));
        }
        Ok(())
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.reservation_timeout_minutes) * 60)
    }

    pub fn max_occupancy(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_occupancy_minutes) * 60)
    }

    pub fn pir_absence(&self) -> Duration {
        Duration::from_secs(u64::from(self.pir_absence_seconds))
    }

    pub fn movement_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.movement_timeout_minutes) * 60)
    }

    pub fn movement_warning(&self) -> Duration {
        Duration::from_secs(u64::from(self.movement_warning_minutes) * 60)
    }

    pub fn orphan_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.orphan_age_minutes) * 60)
    }

    /// Next daily-reset instant strictly after `now` (UTC).
    pub fn next_daily_reset(&self, now: SystemTime) -> SystemTime {
        let (hour, minute) = parse_reset_time(&self.auto_reset_time).unwrap_or((23, 59));
        let target = Time::from_hms(hour, minute, 0).unwrap_or(Time::MIDNIGHT);
        let dt = OffsetDateTime::from(now);
        let mut candidate = dt.replace_time(target);
        if candidate <= dt {
            candidate += time::Duration::days(1);
        }
        SystemTime::from(candidate)
    }
}

fn parse_reset_time(value: &str) -> Option<(u8, u8)> {
    let (hh, mm) = value.split_once(':')?;
    let hour: u8 = hh.parse().ok()?;
    let minute: u8 = mm.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

impl Config {
    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Returns the orchestrator tick interval (default: 500 ms)
    pub fn poll_interval(&self) -> Duration {
        let ms = self
            .server
            .as_ref()
            .and_then(|s| s.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        Duration::from_millis(ms)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH))
    }

    pub fn sensors(&self) -> SensorsSection {
        self.sensors.clone().unwrap_or(SensorsSection {
            use_pir: true,
            use_ultrasonic: true,
            pir_pin: None,
            trig_pin: None,
            echo_pin: None,
            button_pin: None,
        })
    }
}
