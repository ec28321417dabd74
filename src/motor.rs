//! Motor control entry point for the `motorControl` REST function.
//!
//! Commands are plain strings (`increase`, `decrease`, `reset`, `stop`); the
//! answer is a two-value [`CommandOutcome`].

use crate::error::HalError;
use crate::hal::{HardwareProvider, Level, PinId, PinMode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// name the web layer calls this entry point by
pub const MOTOR_CONTROL_FN: &str = "motorControl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Increase,
    Decrease,
    Reset,
    Stop,
}

impl FromStr for MotorCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "increase" => Ok(MotorCommand::Increase),
            "decrease" => Ok(MotorCommand::Decrease),
            "reset" => Ok(MotorCommand::Reset),
            "stop" => Ok(MotorCommand::Stop),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum CommandOutcome {
    Failure = 0,
    Success = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorKind {
    /// on/off only: the pin is high whenever speed > 0
    Switch,
    /// software pwm, duty = speed / max_speed
    Pwm,
}

pub struct MotorController {
    pin: PinId,
    kind: MotorKind,
    max_speed: u8,
    speed: u8,
    status_led: Option<PinId>,
    hal: Arc<dyn HardwareProvider>,
}

impl MotorController {
    /// speed after `reset`
    pub const DEFAULT_SPEED: u8 = 1;

    pub fn new(
        pin: PinId,
        kind: MotorKind,
        max_speed: u8,
        status_led: Option<PinId>,
        hal: Arc<dyn HardwareProvider>,
    ) -> Result<Self, HalError> {
        hal.set_pin_mode(pin, PinMode::Output)?;
        hal.write_pin(pin, Level::Low)?;
        if let Some(led) = status_led {
            hal.set_pin_mode(led, PinMode::Output)?;
            hal.write_pin(led, Level::Low)?;
        }
        Ok(Self {
            pin,
            kind,
            max_speed: max_speed.max(1),
            speed: 0,
            status_led,
            hal,
        })
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// parse and apply one command string
    pub fn handle(&mut self, raw: &str) -> CommandOutcome {
        self.set_led(Level::High);
        let outcome = match raw.parse::<MotorCommand>() {
            Ok(cmd) => self.apply(cmd),
            Err(()) => {
                tracing::warn!("unknown motor command {:?}", raw);
                CommandOutcome::Failure
            }
        };
        self.set_led(Level::Low);
        outcome
    }

    pub fn apply(&mut self, cmd: MotorCommand) -> CommandOutcome {
        let target = match cmd {
            MotorCommand::Increase if self.speed < self.max_speed => self.speed + 1,
            MotorCommand::Decrease if self.speed > 0 => self.speed - 1,
            MotorCommand::Reset => Self::DEFAULT_SPEED.min(self.max_speed),
            MotorCommand::Stop => 0,
            _ => {
                tracing::debug!("motor command {:?} rejected at speed {}", cmd, self.speed);
                return CommandOutcome::Failure;
            }
        };

        if let Err(e) = self.drive(target) {
            tracing::error!("failed to drive motor on {}: {}", self.pin, e);
            return CommandOutcome::Failure;
        }
        tracing::info!("motor {:?}: speed {} -> {}", cmd, self.speed, target);
        self.speed = target;
        CommandOutcome::Success
    }

    fn drive(&self, speed: u8) -> Result<(), HalError> {
        match self.kind {
            MotorKind::Switch => {
                let level = if speed > 0 { Level::High } else { Level::Low };
                self.hal.write_pin(self.pin, level)
            }
            MotorKind::Pwm => self
                .hal
                .write_pwm(self.pin, speed as f64 / self.max_speed as f64),
        }
    }

    fn set_led(&self, level: Level) {
        if let Some(led) = self.status_led {
            if let Err(e) = self.hal.write_pin(led, level) {
                tracing::debug!("status led {}: {}", led, e);
            }
        }
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        if let Err(e) = self.drive(0) {
            tracing::error!("failed to stop motor on teardown: {}", e);
        }
    }
}
