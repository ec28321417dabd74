//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     the pin / driver boundary the sampling core depends on but does not
//!     implement: digital writes, analog reads and the DHT22 single-wire read.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (gpio.rs, using `rppal`) and a development machine (MockHal below).
//!
//! design:
//!     - "Compile Anywhere": MockHal is always built; RpiHal only with
//!       `--features hardware`.
//!     - MockHal records every pin write so tests can assert the soil probe's
//!       power pin is never left high.
//!
//! relationships:
//!     - used by: sensors/*, motor.rs, main.rs
//!     - implemented by: MockHal (here), RpiHal (gpio.rs)
//!
//! ==============================================================================

use crate::error::HalError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// highest BCM gpio number on the 40-pin header
pub const MAX_BCM_PIN: u8 = 27;

/// highest channel on an MCP3008
pub const MAX_ADC_CHANNEL: u8 = 7;

/// a BCM-numbered digital pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId(pub u8);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// an analog input channel on the external ADC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdcChannel(pub u8);

impl fmt::Display for AdcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// every pin the core drives is an output; inputs go through the ADC or the
/// DHT22 driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// decoded DHT22 frame, both values in tenths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhtFrame {
    pub humidity_tenths: u16,
    pub temperature_tenths: i16,
}

pub trait HardwareProvider: Send + Sync {
    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError>;
    fn write_pin(&self, pin: PinId, level: Level) -> Result<(), HalError>;
    /// duty cycle in 0.0..=1.0
    fn write_pwm(&self, pin: PinId, duty: f64) -> Result<(), HalError>;
    fn read_analog(&self, channel: AdcChannel) -> Result<u16, HalError>;
    /// one complete DHT22 handshake; blocks for the duration of the transfer
    fn read_dht22(&self, pin: PinId) -> Result<DhtFrame, HalError>;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (development machines and tests)
// ==============================================================================================

/// a pin-level event recorded by [`MockHal`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinEvent {
    Mode(PinId, PinMode),
    Write(PinId, Level),
    Pwm(PinId, f64),
    AnalogRead(AdcChannel),
}

#[derive(Default)]
struct MockInner {
    modes: HashMap<PinId, PinMode>,
    // inspected by tests only
    #[cfg_attr(not(test), allow(dead_code))]
    levels: HashMap<PinId, Level>,
    #[cfg_attr(not(test), allow(dead_code))]
    events: Vec<PinEvent>,
    analog_queue: HashMap<AdcChannel, VecDeque<Result<u16, HalError>>>,
    analog_default: HashMap<AdcChannel, u16>,
    dht_queue: VecDeque<Result<DhtFrame, HalError>>,
    dht_default: Option<DhtFrame>,
}

/// in-memory hardware: queued results are consumed first, then the sticky
/// default for that input is returned
pub struct MockHal {
    inner: Mutex<MockInner>,
}

impl MockHal {
    pub fn new() -> Self {
        tracing::info!("Using MOCK HAL (no hardware access)");
        let inner = MockInner {
            dht_default: Some(DhtFrame {
                humidity_tenths: 450,
                temperature_tenths: 225,
            }),
            ..MockInner::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        // a panicking test thread must not hide the pin log from the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// scripting and inspection
#[cfg(test)]
impl MockHal {
    pub fn set_analog(&self, channel: AdcChannel, raw: u16) {
        self.lock().analog_default.insert(channel, raw);
    }

    pub fn push_analog(&self, channel: AdcChannel, result: Result<u16, HalError>) {
        self.lock()
            .analog_queue
            .entry(channel)
            .or_default()
            .push_back(result);
    }

    pub fn set_dht(&self, frame: Option<DhtFrame>) {
        self.lock().dht_default = frame;
    }

    pub fn push_dht(&self, result: Result<DhtFrame, HalError>) {
        self.lock().dht_queue.push_back(result);
    }

    pub fn level(&self, pin: PinId) -> Option<Level> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn mode(&self, pin: PinId) -> Option<PinMode> {
        self.lock().modes.get(&pin).copied()
    }

    pub fn events(&self) -> Vec<PinEvent> {
        self.lock().events.clone()
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProvider for MockHal {
    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError> {
        tracing::debug!("[MOCK GPIO] {} set to {:?}", pin, mode);
        let mut inner = self.lock();
        inner.modes.insert(pin, mode);
        inner.events.push(PinEvent::Mode(pin, mode));
        Ok(())
    }

    fn write_pin(&self, pin: PinId, level: Level) -> Result<(), HalError> {
        tracing::debug!("[MOCK GPIO] {} write {:?}", pin, level);
        let mut inner = self.lock();
        if inner.modes.get(&pin) != Some(&PinMode::Output) {
            return Err(HalError::Unconfigured(pin.0));
        }
        inner.levels.insert(pin, level);
        inner.events.push(PinEvent::Write(pin, level));
        Ok(())
    }

    fn write_pwm(&self, pin: PinId, duty: f64) -> Result<(), HalError> {
        tracing::debug!("[MOCK PWM] {} duty {:.2}", pin, duty);
        let mut inner = self.lock();
        if inner.modes.get(&pin) != Some(&PinMode::Output) {
            return Err(HalError::Unconfigured(pin.0));
        }
        let level = if duty > 0.0 { Level::High } else { Level::Low };
        inner.levels.insert(pin, level);
        inner.events.push(PinEvent::Pwm(pin, duty));
        Ok(())
    }

    fn read_analog(&self, channel: AdcChannel) -> Result<u16, HalError> {
        let mut inner = self.lock();
        inner.events.push(PinEvent::AnalogRead(channel));
        if let Some(result) = inner
            .analog_queue
            .get_mut(&channel)
            .and_then(|q| q.pop_front())
        {
            return result;
        }
        Ok(inner.analog_default.get(&channel).copied().unwrap_or(320))
    }

    fn read_dht22(&self, pin: PinId) -> Result<DhtFrame, HalError> {
        tracing::debug!("[MOCK DHT22] Reading {}", pin);
        let mut inner = self.lock();
        if let Some(result) = inner.dht_queue.pop_front() {
            return result;
        }
        inner.dht_default.ok_or(HalError::Timeout)
    }
}
