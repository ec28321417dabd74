//! ==============================================================================
//! config.rs - Node Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `node.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - PollingConfig: period of each sensor manager.
//!     - PinsConfig: which pin / adc channel each sensor role is wired to.
//!     - MoistureConfig: probe thresholds, calibration and settling delay.
//!     - MotorConfig: switch or pwm motor, number of speed steps.
//!     - FailuresConfig: optional auto-disable of failing sensors.
//!     - ServerConfig / LoggingConfig.
//!
//! ==============================================================================

use crate::domain::{MoistureCalibration, MoistureThresholds};
use crate::error::ConfigError;
use crate::hal::{AdcChannel, PinId, MAX_ADC_CHANNEL, MAX_BCM_PIN};
use crate::motor::MotorKind;
use crate::sensors::DHT22_MIN_INTERVAL;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub pins: PinsConfig,
    #[serde(default)]
    pub moisture: MoistureConfig,
    #[serde(default)]
    pub motor: MotorConfig,
    #[serde(default)]
    pub failures: FailuresConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub moisture_period_ms: u64,
    /// slow-moving values; five minutes keeps well clear of the DHT22's
    /// two-second floor
    pub climate_period_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            moisture_period_ms: 5000,
            climate_period_ms: 5 * 60 * 1000,
        }
    }
}

impl PollingConfig {
    pub fn moisture_period(&self) -> Duration {
        Duration::from_millis(self.moisture_period_ms)
    }

    pub fn climate_period(&self) -> Duration {
        Duration::from_millis(self.climate_period_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PinsConfig {
    pub dht: u8,
    pub soil_signal_channel: u8,
    pub soil_power: u8,
    pub status_led: u8,
    pub motor: u8,
}

impl Default for PinsConfig {
    fn default() -> Self {
        Self {
            dht: 4,
            soil_signal_channel: 0,
            soil_power: 22,
            status_led: 27,
            motor: 17,
        }
    }
}

impl PinsConfig {
    pub fn dht(&self) -> PinId {
        PinId(self.dht)
    }

    pub fn soil_signal(&self) -> AdcChannel {
        AdcChannel(self.soil_signal_channel)
    }

    pub fn soil_power(&self) -> PinId {
        PinId(self.soil_power)
    }

    pub fn status_led(&self) -> PinId {
        PinId(self.status_led)
    }

    pub fn motor(&self) -> PinId {
        PinId(self.motor)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MoistureConfig {
    pub dry_threshold: u16,
    pub wet_threshold: u16,
    /// full-scale count of the adc (1023 for an MCP3008)
    pub adc_max: u16,
    pub settle_ms: u64,
    /// raw count mapped to 0 %
    pub dry_calibration: u16,
    /// raw count mapped to 100 %
    pub wet_calibration: u16,
}

impl Default for MoistureConfig {
    fn default() -> Self {
        Self {
            dry_threshold: MoistureThresholds::DEFAULT.dry,
            wet_threshold: MoistureThresholds::DEFAULT.wet,
            adc_max: 1023,
            settle_ms: 10,
            dry_calibration: 0,
            wet_calibration: 1023,
        }
    }
}

impl MoistureConfig {
    pub fn thresholds(&self) -> MoistureThresholds {
        MoistureThresholds {
            dry: self.dry_threshold,
            wet: self.wet_threshold,
        }
    }

    pub fn calibration(&self) -> MoistureCalibration {
        MoistureCalibration {
            dry: self.dry_calibration,
            wet: self.wet_calibration,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    pub kind: MotorKind,
    pub max_speed: u8,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            kind: MotorKind::Switch,
            max_speed: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct FailuresConfig {
    #[serde(default)]
    pub disable_after: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// first existing `node.toml` in the usual places
    ///
    /// a file that exists but fails to parse or validate is an error for the
    /// caller: silently running with default pins could energise the wrong output.
    pub fn locate() -> Option<PathBuf> {
        [
            PathBuf::from("config").join("node.toml"),
            PathBuf::from("..").join("config").join("node.toml"),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    /// Load with default fallback; returns the file used, if any
    pub fn load_or_default() -> anyhow::Result<(Self, Option<PathBuf>)> {
        match Self::locate() {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// check pin ranges, pin conflicts, thresholds and the DHT22 period floor
    pub fn validate(&self) -> Result<(), ConfigError> {
        let digital = [
            ("dht", self.pins.dht),
            ("soil_power", self.pins.soil_power),
            ("status_led", self.pins.status_led),
            ("motor", self.pins.motor),
        ];
        for (i, &(role, pin)) in digital.iter().enumerate() {
            if pin > MAX_BCM_PIN {
                return Err(ConfigError::InvalidPin {
                    role,
                    pin,
                    max: MAX_BCM_PIN,
                });
            }
            if let Some(&(first, _)) = digital[..i].iter().find(|(_, p)| *p == pin) {
                return Err(ConfigError::PinConflict {
                    pin,
                    first,
                    second: role,
                });
            }
        }
        if self.pins.soil_signal_channel > MAX_ADC_CHANNEL {
            return Err(ConfigError::InvalidPin {
                role: "soil_signal_channel",
                pin: self.pins.soil_signal_channel,
                max: MAX_ADC_CHANNEL,
            });
        }

        let m = &self.moisture;
        if m.dry_threshold >= m.wet_threshold || m.wet_threshold > m.adc_max {
            return Err(ConfigError::InvalidThresholds {
                dry: m.dry_threshold,
                wet: m.wet_threshold,
                adc_max: m.adc_max,
            });
        }
        if m.dry_calibration == m.wet_calibration {
            return Err(ConfigError::InvalidCalibration {
                dry: m.dry_calibration,
                wet: m.wet_calibration,
            });
        }

        if self.polling.moisture_period_ms == 0 {
            return Err(ConfigError::InvalidPeriod {
                manager: "moisture".into(),
            });
        }
        if self.polling.climate_period() < DHT22_MIN_INTERVAL {
            return Err(ConfigError::PollingTooFast {
                manager: "climate".into(),
                period_ms: self.polling.climate_period_ms,
                minimum_ms: DHT22_MIN_INTERVAL.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│           NODE CONFIGURATION            │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Moisture poll: {}ms", self.polling.moisture_period_ms);
        tracing::info!("│ Climate poll: {}ms", self.polling.climate_period_ms);
        tracing::info!(
            "│ DHT22: {} | Probe: {} (power {})",
            self.pins.dht(),
            self.pins.soil_signal(),
            self.pins.soil_power()
        );
        tracing::info!(
            "│ Thresholds: dry<{} wet>{}",
            self.moisture.dry_threshold,
            self.moisture.wet_threshold
        );
        tracing::info!("│ Motor: {:?} on {}", self.motor.kind, self.pins.motor());
        tracing::info!("│ Server: {}", self.server.bind);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}
