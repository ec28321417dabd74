//! ==============================================================================
//! gpio.rs - Raspberry Pi hardware provider
//! ==============================================================================
//!
//! purpose:
//!     REAL pin access for the node, behind the `hardware` feature.
//!     - digital outputs (probe power, motor, status led) via rppal::gpio
//!     - analog inputs via an MCP3008 on SPI0 / CE0 (the Pi has no ADC)
//!     - the DHT22 via python's adafruit_dht in a subprocess
//!
//! why subprocess to python?:
//!     dht22 sensors require precise bit-banging timing (~microseconds).
//!     pure rust in userspace is unreliable due to lack of real-time guarantees.
//!     adafruit_dht handles this correctly with timing compensation and reports
//!     checksum failures, which we map onto HalError::Checksum.
//!
//! relationships:
//!     - implements: hal.rs (HardwareProvider)
//!     - used by: main.rs when built with --features hardware
//!
//! ==============================================================================

use crate::error::HalError;
use crate::hal::{AdcChannel, DhtFrame, HardwareProvider, Level, PinId, PinMode};
use rppal::gpio::{Gpio, OutputPin};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;

/// software pwm carrier for the motor pin
const PWM_FREQUENCY_HZ: f64 = 200.0;

/// MCP3008 SPI clock
const ADC_CLOCK_HZ: u32 = 1_000_000;

pub struct RpiHal {
    gpio: Gpio,
    spi: Mutex<Spi>,
    outputs: Mutex<HashMap<PinId, OutputPin>>,
}

fn io<E: std::fmt::Display>(e: E) -> HalError {
    HalError::Io(e.to_string())
}

impl RpiHal {
    pub fn new() -> anyhow::Result<Self> {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        let gpio = Gpio::new()?;
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, ADC_CLOCK_HZ, Mode::Mode0)?;
        Ok(Self {
            gpio,
            spi: Mutex::new(spi),
            outputs: Mutex::new(HashMap::new()),
        })
    }
}

impl HardwareProvider for RpiHal {
    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError> {
        let mut outputs = self.outputs.lock().map_err(io)?;
        match mode {
            PinMode::Output => {
                // starts low so nothing is energised before the first write
                let out = self.gpio.get(pin.0).map_err(io)?.into_output_low();
                outputs.insert(pin, out);
            }
        }
        Ok(())
    }

    fn write_pin(&self, pin: PinId, level: Level) -> Result<(), HalError> {
        let mut outputs = self.outputs.lock().map_err(io)?;
        let out = outputs.get_mut(&pin).ok_or(HalError::Unconfigured(pin.0))?;
        match level {
            Level::High => out.set_high(),
            Level::Low => out.set_low(),
        }
        Ok(())
    }

    fn write_pwm(&self, pin: PinId, duty: f64) -> Result<(), HalError> {
        let mut outputs = self.outputs.lock().map_err(io)?;
        let out = outputs.get_mut(&pin).ok_or(HalError::Unconfigured(pin.0))?;
        if duty <= 0.0 {
            out.clear_pwm().map_err(io)?;
            out.set_low();
        } else {
            out.set_pwm_frequency(PWM_FREQUENCY_HZ, duty.min(1.0))
                .map_err(io)?;
        }
        Ok(())
    }

    fn read_analog(&self, channel: AdcChannel) -> Result<u16, HalError> {
        // single-ended conversion: start bit, SGL/DIFF + channel, padding
        let tx = [0x01, (0x08 | channel.0) << 4, 0x00];
        let mut rx = [0u8; 3];
        let spi = self.spi.lock().map_err(io)?;
        spi.transfer(&mut rx, &tx).map_err(io)?;
        Ok((((rx[1] & 0x03) as u16) << 8) | rx[2] as u16)
    }

    fn read_dht22(&self, pin: PinId) -> Result<DhtFrame, HalError> {
        let script = format!(
            r#"
import sys, json
try:
    import adafruit_dht, board
    dht = adafruit_dht.DHT22(board.D{}, use_pulseio=False)
    try:
        t, h = dht.temperature, dht.humidity
        print(json.dumps({{"t": t, "h": h}}) if t is not None and h is not None else "null")
    finally:
        dht.exit()
except Exception as e:
    print(str(e), file=sys.stderr)
    sys.exit(1)
"#,
            pin.0
        );

        let output = Command::new("python3")
            .args(["-c", &script])
            .output()
            .map_err(|e| HalError::Io(format!("failed to run python3: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(if stderr.contains("Checksum") {
                HalError::Checksum
            } else if stderr.contains("timed out") || stderr.contains("full buffer") {
                HalError::Timeout
            } else {
                HalError::Io(stderr.trim().to_string())
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout == "null" || stdout.is_empty() {
            return Err(HalError::Timeout);
        }

        let parsed: serde_json::Value = serde_json::from_str(stdout)
            .map_err(|e| HalError::Io(format!("json parse error: {} (got: {})", e, stdout)))?;
        let t = parsed["t"].as_f64().ok_or(HalError::Timeout)?;
        let h = parsed["h"].as_f64().ok_or(HalError::Timeout)?;

        Ok(DhtFrame {
            humidity_tenths: (h * 10.0).round() as u16,
            temperature_tenths: (t * 10.0).round() as i16,
        })
    }
}
