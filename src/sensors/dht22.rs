use super::{Sample, SensorDevice};
use crate::domain::{Quantity, SensorReading};
use crate::error::SensorError;
use crate::hal::{HardwareProvider, PinId};
use std::sync::Arc;
use std::time::Duration;

/// DHT22 datasheet: at most one conversion every two seconds
pub const DHT22_MIN_INTERVAL: Duration = Duration::from_secs(2);

const TEMPERATURE_RANGE_TENTHS: std::ops::RangeInclusive<f32> = -400.0..=800.0;
const HUMIDITY_RANGE_TENTHS: std::ops::RangeInclusive<f32> = 0.0..=1000.0;

const QUANTITIES: &[Quantity] = &[Quantity::Temperature, Quantity::Humidity];

/// DHT22 temperature/humidity sensor on a single data pin.
///
/// The handshake itself is delegated to [`HardwareProvider::read_dht22`]; this
/// type only validates the decoded frame. Reads are never retried inline.
pub struct Dht22Sensor {
    label: String,
    pin: PinId,
    hal: Arc<dyn HardwareProvider>,
}

impl Dht22Sensor {
    pub fn new(pin: PinId, hal: Arc<dyn HardwareProvider>) -> Self {
        Self {
            label: format!("dht22-{}", pin),
            pin,
            hal,
        }
    }
}

fn check(quantity: Quantity, value: f32, range: &std::ops::RangeInclusive<f32>) -> Result<f32, SensorError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(SensorError::OutOfRange { quantity, value })
    }
}

impl SensorDevice for Dht22Sensor {
    fn label(&self) -> &str {
        &self.label
    }

    fn quantities(&self) -> &'static [Quantity] {
        QUANTITIES
    }

    fn min_sample_interval(&self) -> Duration {
        DHT22_MIN_INTERVAL
    }

    fn read(&mut self) -> Sample {
        let frame = match self.hal.read_dht22(self.pin) {
            Ok(frame) => frame,
            Err(e) => return Sample::failed(QUANTITIES, e.into()),
        };

        let decoded = check(
            Quantity::Temperature,
            frame.temperature_tenths as f32,
            &TEMPERATURE_RANGE_TENTHS,
        )
        .and_then(|t| {
            check(
                Quantity::Humidity,
                frame.humidity_tenths as f32,
                &HUMIDITY_RANGE_TENTHS,
            )
            .map(|h| (t, h))
        });

        match decoded {
            Ok((t, h)) => Sample::ok(vec![
                SensorReading::valid(Quantity::Temperature, t),
                SensorReading::valid(Quantity::Humidity, h),
            ]),
            Err(e) => Sample::failed(QUANTITIES, e),
        }
    }
}
