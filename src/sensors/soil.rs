use super::{Sample, SensorDevice};
use crate::domain::{MoistureThresholds, Quantity, SensorReading};
use crate::error::{HalError, SensorError};
use crate::hal::{AdcChannel, HardwareProvider, Level, PinId, PinMode};
use std::sync::Arc;
use std::time::Duration;

const QUANTITIES: &[Quantity] = &[Quantity::SoilMoisture];

/// Resistive soil moisture probe with a switched supply.
///
/// The probe is only powered for the settling delay plus one conversion, which
/// keeps electrolytic corrosion of the electrodes down. The power pin is LOW
/// after construction, after every read and after drop.
pub struct SoilMoistureSensor {
    label: String,
    signal: AdcChannel,
    power: PinId,
    thresholds: MoistureThresholds,
    adc_max: u16,
    settle: Duration,
    hal: Arc<dyn HardwareProvider>,
}

impl SoilMoistureSensor {
    pub fn new(
        signal: AdcChannel,
        power: PinId,
        thresholds: MoistureThresholds,
        adc_max: u16,
        settle: Duration,
        hal: Arc<dyn HardwareProvider>,
    ) -> Result<Self, HalError> {
        hal.set_pin_mode(power, PinMode::Output)?;
        hal.write_pin(power, Level::Low)?;
        Ok(Self {
            label: format!("soil-{}", signal),
            signal,
            power,
            thresholds,
            adc_max,
            settle,
            hal,
        })
    }

    fn sample_raw(&self) -> Result<u16, SensorError> {
        let _powered = PowerGuard::energize(self.hal.as_ref(), self.power)?;
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        let raw = self.hal.read_analog(self.signal)?;
        if raw > self.adc_max {
            return Err(SensorError::OutOfRange {
                quantity: Quantity::SoilMoisture,
                value: raw as f32,
            });
        }
        Ok(raw)
    }
}

impl SensorDevice for SoilMoistureSensor {
    fn label(&self) -> &str {
        &self.label
    }

    fn quantities(&self) -> &'static [Quantity] {
        QUANTITIES
    }

    fn read(&mut self) -> Sample {
        match self.sample_raw() {
            Ok(raw) => {
                let level = self.thresholds.classify(raw);
                tracing::trace!("{}: raw={} level={:?}", self.label, raw, level);
                Sample::ok(vec![
                    SensorReading::valid(Quantity::SoilMoisture, raw as f32).with_level(level)
                ])
            }
            Err(e) => Sample::failed(QUANTITIES, e),
        }
    }
}

impl Drop for SoilMoistureSensor {
    fn drop(&mut self) {
        if let Err(e) = self.hal.write_pin(self.power, Level::Low) {
            tracing::error!("{}: failed to power down probe on teardown: {}", self.label, e);
        }
    }
}

/// holds the probe supply high until dropped
struct PowerGuard<'a> {
    hal: &'a dyn HardwareProvider,
    pin: PinId,
}

impl<'a> PowerGuard<'a> {
    fn energize(hal: &'a dyn HardwareProvider, pin: PinId) -> Result<Self, HalError> {
        let guard = Self { hal, pin };
        // constructed first so a failed write still ends with a LOW attempt
        hal.write_pin(pin, Level::High)?;
        Ok(guard)
    }
}

impl Drop for PowerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.hal.write_pin(self.pin, Level::Low) {
            tracing::error!("failed to de-energise {}: {}", self.pin, e);
        }
    }
}
