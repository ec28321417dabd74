use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// physical quantity a reading measures, in the sensor's native unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// tenths of a degree celsius
    Temperature,
    /// tenths of a percent relative humidity
    Humidity,
    /// raw adc count
    SoilMoisture,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
            Quantity::SoilMoisture => "soil moisture",
        })
    }
}

/// one sample from one sensor channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub quantity: Quantity,
    /// measurement in the native unit of `quantity`
    pub value: f32,
    /// false if the read failed; never published
    pub valid: bool,
    /// monotonic acquisition time
    pub timestamp: Instant,
    /// soil classification, only present on valid soil moisture readings
    pub level: Option<MoistureLevel>,
}

impl SensorReading {
    pub fn valid(quantity: Quantity, value: f32) -> Self {
        Self {
            quantity,
            value,
            valid: true,
            timestamp: Instant::now(),
            level: None,
        }
    }

    pub fn invalid(quantity: Quantity) -> Self {
        Self {
            quantity,
            value: 0.0,
            valid: false,
            timestamp: Instant::now(),
            level: None,
        }
    }

    pub fn with_level(mut self, level: MoistureLevel) -> Self {
        self.level = Some(level);
        self
    }
}

/// soil state derived from the raw probe count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MoistureLevel {
    Dry,
    Normal,
    Wet,
}

/// classification bounds for a resistive soil probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoistureThresholds {
    /// counts strictly below this are DRY
    pub dry: u16,
    /// counts strictly above this are WET
    pub wet: u16,
}

impl MoistureThresholds {
    pub const DEFAULT: MoistureThresholds = MoistureThresholds { dry: 250, wet: 400 };

    pub fn classify(&self, raw: u16) -> MoistureLevel {
        if raw < self.dry {
            MoistureLevel::Dry
        } else if raw > self.wet {
            MoistureLevel::Wet
        } else {
            MoistureLevel::Normal
        }
    }
}

/// externally visible variables, named exactly as the web layer expects them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishedVariable {
    #[serde(rename = "Temperature_Fahrenheit")]
    TemperatureFahrenheit,
    #[serde(rename = "Humidity_Percentage")]
    HumidityPercentage,
    #[serde(rename = "Moisture_Percentage")]
    MoisturePercentage,
}

impl PublishedVariable {
    pub const ALL: [PublishedVariable; 3] = [
        PublishedVariable::TemperatureFahrenheit,
        PublishedVariable::HumidityPercentage,
        PublishedVariable::MoisturePercentage,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            PublishedVariable::TemperatureFahrenheit => "Temperature_Fahrenheit",
            PublishedVariable::HumidityPercentage => "Humidity_Percentage",
            PublishedVariable::MoisturePercentage => "Moisture_Percentage",
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            PublishedVariable::TemperatureFahrenheit => 0,
            PublishedVariable::HumidityPercentage => 1,
            PublishedVariable::MoisturePercentage => 2,
        }
    }
}

impl fmt::Display for PublishedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublishedVariable {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublishedVariable::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or(())
    }
}

/// maps a raw probe count onto 0..=100 % between two calibration points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoistureCalibration {
    /// count read in completely dry soil (0 %)
    pub dry: u16,
    /// count read in saturated soil (100 %)
    pub wet: u16,
}

impl MoistureCalibration {
    pub fn percentage(&self, raw: f32) -> f32 {
        let span = self.wet as f32 - self.dry as f32;
        ((raw - self.dry as f32) * 100.0 / span).clamp(0.0, 100.0)
    }
}

/// convert a native-unit value into the float form of its published unit
///
/// rounding to the published integer happens after aggregation.
pub fn to_published_unit(
    quantity: Quantity,
    value: f32,
    calibration: &MoistureCalibration,
) -> f32 {
    match quantity {
        Quantity::Temperature => (value / 10.0) * 9.0 / 5.0 + 32.0,
        Quantity::Humidity => value / 10.0,
        Quantity::SoilMoisture => calibration.percentage(value),
    }
}
