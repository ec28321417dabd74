//! Sensor devices.
//!
//! Each device owns its pin bindings for its whole lifetime and knows how to
//! take one sample and express it in its native unit. Scheduling, conversion
//! to published units and failure accounting live in `manager.rs`.

mod dht22;
mod soil;

pub use dht22::{Dht22Sensor, DHT22_MIN_INTERVAL};
pub use soil::SoilMoistureSensor;

use crate::domain::{Quantity, SensorReading};
use std::time::Duration;

pub trait SensorDevice: Send {
    /// short identifier used in logs and diagnostics (e.g. "dht22-GPIO4")
    fn label(&self) -> &str;

    /// quantities one `read` produces, in order
    fn quantities(&self) -> &'static [Quantity];

    /// the sensor's physical minimum time between two reads
    fn min_sample_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// take one sample. a failed read yields one `valid = false` reading per
    /// quantity; the cause is returned alongside for logging.
    fn read(&mut self) -> Sample;
}

/// result of one `SensorDevice::read`
#[derive(Debug, Clone)]
pub struct Sample {
    pub readings: Vec<SensorReading>,
    pub fault: Option<crate::error::SensorError>,
}

impl Sample {
    pub fn ok(readings: Vec<SensorReading>) -> Self {
        Self {
            readings,
            fault: None,
        }
    }

    pub fn failed(quantities: &[Quantity], fault: crate::error::SensorError) -> Self {
        Self {
            readings: quantities.iter().map(|q| SensorReading::invalid(*q)).collect(),
            fault: Some(fault),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fault.is_none() && self.readings.iter().all(|r| r.valid)
    }
}
