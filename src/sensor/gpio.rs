//! Raspberry Pi drivers: PIR motion input and HC-SR04 ultrasonic ranging
//! over GPIO. Only compiled on Linux targets.

use crate::error::AppError;
use crate::sensor::{ButtonInput, MAX_RANGE_CM, MotionSensor, RangeSensor};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use std::time::{Duration, Instant};

// Sound travels ~343 m/s at room temperature; the echo covers the distance
// twice, so pulse seconds * 17150 gives centimeters.
const CM_PER_PULSE_SECOND: f64 = 17150.0;
const ECHO_TIMEOUT: Duration = Duration::from_millis(100);
const TRIGGER_PULSE: Duration = Duration::from_micros(10);

pub struct PirSensor {
    pin: InputPin,
}

impl PirSensor {
    pub fn new(bcm_pin: u8) -> Result<Self, AppError> {
        let gpio = Gpio::new().map_err(|e| AppError::Gpio(e.to_string()))?;
        let pin = gpio
            .get(bcm_pin)
            .map_err(|e| AppError::Gpio(e.to_string()))?
            .into_input();
        Ok(Self { pin })
    }
}

impl MotionSensor for PirSensor {
    fn sample(&mut self) -> Result<bool, AppError> {
        Ok(self.pin.is_high())
    }
}

pub struct HcSr04Sensor {
    trig: OutputPin,
    echo: InputPin,
}

impl HcSr04Sensor {
    pub fn new(trig_pin: u8, echo_pin: u8) -> Result<Self, AppError> {
        let gpio = Gpio::new().map_err(|e| AppError::Gpio(e.to_string()))?;
        let trig = gpio
            .get(trig_pin)
            .map_err(|e| AppError::Gpio(e.to_string()))?
            .into_output_low();
        let echo = gpio
            .get(echo_pin)
            .map_err(|e| AppError::Gpio(e.to_string()))?
            .into_input();
        Ok(Self { trig, echo })
    }

    fn wait_for(&self, high: bool) -> Option<Instant> {
        let start = Instant::now();
        while self.echo.is_high() != high {
            if start.elapsed() > ECHO_TIMEOUT {
                return None;
            }
        }
        Some(Instant::now())
    }
}

impl RangeSensor for HcSr04Sensor {
    fn measure_cm(&mut self) -> Result<f64, AppError> {
        self.trig.set_high();
        std::thread::sleep(TRIGGER_PULSE);
        self.trig.set_low();

        // A missing echo means nothing in range, not a fault
        let Some(pulse_start) = self.wait_for(true) else {
            return Ok(MAX_RANGE_CM);
        };
        let Some(pulse_end) = self.wait_for(false) else {
            return Ok(MAX_RANGE_CM);
        };

        let pulse = pulse_end.duration_since(pulse_start);
        let distance = pulse.as_secs_f64() * CM_PER_PULSE_SECOND;
        Ok(distance.min(MAX_RANGE_CM))
    }
}

pub struct PushButton {
    pin: InputPin,
    was_high: bool,
}

impl PushButton {
    pub fn new(bcm_pin: u8) -> Result<Self, AppError> {
        let gpio = Gpio::new().map_err(|e| AppError::Gpio(e.to_string()))?;
        let pin = gpio
            .get(bcm_pin)
            .map_err(|e| AppError::Gpio(e.to_string()))?
            .into_input_pulldown();
        Ok(Self {
            pin,
            was_high: false,
        })
    }
}

impl ButtonInput for PushButton {
    fn pressed(&mut self) -> Result<bool, AppError> {
        let high = self.pin.is_high();
        let edge = high && !self.was_high;
        self.was_high = high;
        Ok(edge)
    }
}
