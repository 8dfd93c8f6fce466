use crate::error::AppError;
use crate::fusion::FusionInputs;
use crate::state::SensorHealth;
use std::time::SystemTime;

pub mod mock;

#[cfg(target_os = "linux")]
pub mod gpio;

/// Echo timeout / out-of-range sentinel, in centimeters. Far enough that it
/// can never read as presence.
pub const MAX_RANGE_CM: f64 = 999.0;

pub trait MotionSensor {
    /// True when the PIR currently reports movement.
    fn sample(&mut self) -> Result<bool, AppError>;
}

pub trait RangeSensor {
    fn measure_cm(&mut self) -> Result<f64, AppError>;
}

pub trait ButtonInput {
    /// True exactly once per physical press (edge, not level).
    fn pressed(&mut self) -> Result<bool, AppError>;
}

/// Per-tick readout of both sensors plus their health.
#[derive(Debug)]
pub struct RigSample {
    pub inputs: FusionInputs,
    pub pir: SensorHealth,
    pub ultrasonic: SensorHealth,
}

/// The physical sensor pair. Either half may be absent (disabled in config
/// or failed at discovery); a read fault degrades that half to `None` for
/// the tick instead of failing the rig.
pub struct SensorRig {
    motion: Option<Box<dyn MotionSensor + Send>>,
    range: Option<Box<dyn RangeSensor + Send>>,
    button: Option<Box<dyn ButtonInput + Send>>,
}

impl SensorRig {
    pub fn new(
        motion: Option<Box<dyn MotionSensor + Send>>,
        range: Option<Box<dyn RangeSensor + Send>>,
        button: Option<Box<dyn ButtonInput + Send>>,
    ) -> Self {
        Self {
            motion,
            range,
            button,
        }
    }

    pub fn has_any_sensor(&self) -> bool {
        self.motion.is_some() || self.range.is_some()
    }

    /// Poll the direct-access button. A read fault is logged and reads as
    /// "not pressed"; the button is an input edge, not a health concern.
    pub fn button_pressed(&mut self) -> bool {
        match self.button.as_mut() {
            Some(button) => match button.pressed() {
                Ok(pressed) => pressed,
                Err(e) => {
                    tracing::warn!(error = %e, "Button read failed");
                    false
                }
            },
            None => false,
        }
    }

    pub fn sample(&mut self, now: SystemTime) -> RigSample {
        let (pir_motion, pir) = match self.motion.as_mut() {
            Some(sensor) => match sensor.sample() {
                Ok(motion) => (Some(motion), SensorHealth::Ok),
                Err(e) => (
                    None,
                    SensorHealth::Error {
                        message: e.to_string(),
                    },
                ),
            },
            None => (None, SensorHealth::Disabled),
        };

        let (distance_cm, ultrasonic) = match self.range.as_mut() {
            Some(sensor) => match sensor.measure_cm() {
                Ok(distance) => (Some(distance), SensorHealth::Ok),
                Err(e) => (
                    None,
                    SensorHealth::Error {
                        message: e.to_string(),
                    },
                ),
            },
            None => (None, SensorHealth::Disabled),
        };

        RigSample {
            inputs: FusionInputs {
                pir_motion,
                distance_cm,
                at: now,
            },
            pir,
            ultrasonic,
        }
    }
}
