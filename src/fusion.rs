//! Sensor fusion: folds the latest PIR and ultrasonic samples into a single
//! presence verdict. Ultrasonic alone false-positives on static objects, PIR
//! alone misses stationary occupants; the mode picks which failure class a
//! deployment prefers.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FusionMode {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// Not enough working sensors to tell.
    Unknown,
}

/// One tick's worth of raw samples. `None` means the sensor is unavailable
/// this tick (read fault or disabled).
#[derive(Debug, Clone, Copy)]
pub struct FusionInputs {
    pub pir_motion: Option<bool>,
    pub distance_cm: Option<f64>,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    pub mode: FusionMode,
    pub presence_threshold_cm: f64,
    pub movement_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionSignal {
    pub presence: Presence,
    /// Instant the current verdict was first observed.
    pub since: SystemTime,
    pub last_movement: Option<SystemTime>,
    pub pir_available: bool,
    pub ultrasonic_available: bool,
}

#[derive(Debug, Default)]
pub struct SensorFusion {
    last_movement: Option<SystemTime>,
    verdict: Option<(Presence, SystemTime)>,
}

impl SensorFusion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_movement(&self) -> Option<SystemTime> {
        self.last_movement
    }

    pub fn update(&mut self, inputs: FusionInputs, config: &FusionConfig) -> FusionSignal {
        if inputs.pir_motion == Some(true) {
            self.last_movement = Some(inputs.at);
        }

        let ultrasonic = inputs
            .distance_cm
            .map(|d| d < config.presence_threshold_cm);
        let movement = inputs.pir_motion.map(|_| {
            self.last_movement.is_some_and(|last| {
                inputs
                    .at
                    .duration_since(last)
                    .map(|elapsed| elapsed < config.movement_timeout)
                    .unwrap_or(true)
            })
        });

        let presence = match (ultrasonic, movement) {
            (None, None) => Presence::Unknown,
            // One sensor out: degrade to the survivor in either mode
            (Some(u), None) => presence_from(u),
            (None, Some(m)) => presence_from(m),
            (Some(u), Some(m)) => match config.mode {
                FusionMode::And => presence_from(u && m),
                FusionMode::Or => presence_from(u || m),
            },
        };

        let since = match self.verdict {
            Some((prior, since)) if prior == presence => since,
            _ => inputs.at,
        };
        self.verdict = Some((presence, since));

        FusionSignal {
            presence,
            since,
            last_movement: self.last_movement,
            pir_available: inputs.pir_motion.is_some(),
            ultrasonic_available: inputs.distance_cm.is_some(),
        }
    }
}

fn presence_from(present: bool) -> Presence {
    if present {
        Presence::Present
    } else {
        Presence::Absent
    }
}
