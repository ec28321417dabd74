//! ==============================================================================
//! error.rs - typed errors for the sampling core
//! ==============================================================================
//!
//! purpose:
//!     sensor faults are absorbed by the managers and only counted, so they need
//!     a type that can be matched and logged. configuration errors stop the node
//!     at startup.
//!
//! relationships:
//!     - HalError: raised by hal.rs / gpio.rs implementations
//!     - SensorError: raised by sensors/*, absorbed by manager.rs
//!     - ConfigError: raised by config.rs, store.rs and manager.rs at startup
//!
//! ==============================================================================

use crate::domain::Quantity;
use thiserror::Error;

/// Failure at the pin / low-level driver boundary.
#[derive(Debug, Clone, Error, PartialEq)]
// handshake and bus failures only come from the rppal provider
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
pub enum HalError {
    #[error("handshake timed out")]
    Timeout,
    #[error("checksum mismatch")]
    Checksum,
    #[error("pin {0} is not configured")]
    Unconfigured(u8),
    #[error("{0}")]
    Io(String),
}

/// A single failed sample. Every variant is transient: the next scheduled poll
/// is the only recovery.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("sensor read timed out")]
    Timeout,
    #[error("sensor frame failed its checksum")]
    Checksum,
    #[error("{quantity} value {value} is outside the plausible range")]
    OutOfRange { quantity: Quantity, value: f32 },
    #[error("hardware fault: {0}")]
    Hardware(String),
}

impl From<HalError> for SensorError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::Timeout => SensorError::Timeout,
            HalError::Checksum => SensorError::Checksum,
            other => SensorError::Hardware(other.to_string()),
        }
    }
}

/// Invalid wiring or timing configuration. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{role}: pin {pin} is out of range (max {max})")]
    InvalidPin { role: &'static str, pin: u8, max: u8 },
    #[error("pin {pin} is bound to both {first} and {second}")]
    PinConflict {
        pin: u8,
        first: &'static str,
        second: &'static str,
    },
    #[error("dry threshold {dry} must be below wet threshold {wet} and within 0..={adc_max}")]
    InvalidThresholds { dry: u16, wet: u16, adc_max: u16 },
    #[error("moisture calibration dry={dry} wet={wet} must differ")]
    InvalidCalibration { dry: u16, wet: u16 },
    #[error("{manager}: polling period {period_ms}ms is below the {minimum_ms}ms minimum of its sensors")]
    PollingTooFast {
        manager: String,
        period_ms: u64,
        minimum_ms: u64,
    },
    #[error("{manager}: polling period must be non-zero")]
    InvalidPeriod { manager: String },
    #[error("variable {0} already has a writer")]
    VariableAlreadyOwned(&'static str),
    #[error("{manager}: no variable bound for {quantity}")]
    UnboundQuantity { manager: String, quantity: Quantity },
}
