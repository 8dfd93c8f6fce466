use crate::error::AppError;
use crate::sensor::{ButtonInput, MotionSensor, RangeSensor};

#[derive(Debug, Clone, Copy)]
pub struct MockMotionSensor {
    motion: bool,
    read_ok: bool,
}

impl MockMotionSensor {
    pub fn with_motion(motion: bool) -> Self {
        Self {
            motion,
            read_ok: true,
        }
    }

    pub fn failing() -> Self {
        Self {
            motion: false,
            read_ok: false,
        }
    }

    pub fn set_motion(&mut self, motion: bool) {
        self.motion = motion;
    }
}

impl MotionSensor for MockMotionSensor {
    fn sample(&mut self) -> Result<bool, AppError> {
        if self.read_ok {
            Ok(self.motion)
        } else {
            Err(AppError::Sensor("mock pir read failed".to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MockRangeSensor {
    distance_cm: f64,
    read_ok: bool,
}

impl MockRangeSensor {
    pub fn with_distance(distance_cm: f64) -> Self {
        Self {
            distance_cm,
            read_ok: true,
        }
    }

    pub fn failing() -> Self {
        Self {
            distance_cm: 0.0,
            read_ok: false,
        }
    }

    pub fn set_distance(&mut self, distance_cm: f64) {
        self.distance_cm = distance_cm;
    }
}

impl RangeSensor for MockRangeSensor {
    fn measure_cm(&mut self) -> Result<f64, AppError> {
        if self.read_ok {
            Ok(self.distance_cm)
        } else {
            Err(AppError::Sensor("mock distance read failed".to_string()))
        }
    }
}

#[derive(Debug, Default)]
pub struct MockButton {
    presses: u32,
}

impl MockButton {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn pressed_once() -> Self {
        Self { presses: 1 }
    }

    pub fn press(&mut self) {
        self.presses += 1;
    }
}

impl ButtonInput for MockButton {
    fn pressed(&mut self) -> Result<bool, AppError> {
        if self.presses > 0 {
            self.presses -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
