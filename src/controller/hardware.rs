//! Power, sources, limits, tags and pass-through commands.

use super::Controller;
use crate::error::{DhiError, OpResult};
use crate::geometry::HeadSel;
use crate::protocol::{Command, Response, Verb, CP_ADDRESS};
use log::{info, warn};

pub const MAX_HIGH_VOLTAGE: u16 = 1500;
pub const MAX_TEMPERATURE_C: u8 = 60;
const TIME_WINDOW_NS: std::ops::RangeInclusive<u8> = 2..=15;
const TRAJECTORY_PATTERNS: std::ops::RangeInclusive<u8> = 0..=3;
const TRAJECTORY_SPEEDS: std::ops::RangeInclusive<u8> = 1..=10;

impl Controller {
    pub fn set_high_voltage(&mut self, heads: HeadSel, on: bool) -> OpResult<()> {
        self.run_each("set_high_voltage", heads, |c, head| {
            c.transact(&Command::new(head, Verb::HighVoltage).arg(u8::from(on)))?;
            info!("Head {} high voltage {}", head, if on { "on" } else { "off" });
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_high_voltage_level(&mut self, head: u8, volts: u16) -> OpResult<()> {
        self.run("set_high_voltage_level", Some(head), |c| {
            c.check_head(head)?;
            if volts > MAX_HIGH_VOLTAGE {
                return Err(DhiError::argument(format!(
                    "{} V above the {} V limit",
                    volts, MAX_HIGH_VOLTAGE
                )));
            }
            c.transact(&Command::new(head, Verb::HighVoltageLevel).arg(volts))?;
            Ok(())
        })
    }

    /// Extends or retracts the rotating point source of `head`.
    pub fn set_point_source(&mut self, head: u8, on: bool) -> OpResult<()> {
        self.run("set_point_source", Some(head), |c| {
            if !c.geometry.head(head)?.point_source {
                return Err(DhiError::argument(format!("head {} has no point source", head)));
            }
            c.transact(&Command::new(head, Verb::PointSource).arg(u8::from(on)))?;
            Ok(())
        })
    }

    pub fn set_temperature_limits(&mut self, head: u8, low: u8, high: u8) -> OpResult<()> {
        self.run("set_temperature_limits", Some(head), |c| {
            c.check_head(head)?;
            if low >= high || high > MAX_TEMPERATURE_C {
                return Err(DhiError::argument(format!(
                    "temperature limits {}..{} C invalid, need low < high <= {}",
                    low, high, MAX_TEMPERATURE_C
                )));
            }
            c.transact(&Command::new(head, Verb::TemperatureLimits).arg(low).arg(high))?;
            Ok(())
        })
    }

    /// Current (low, high) temperature limits of `head` in degrees C.
    pub fn temperature_limits(&mut self, head: u8) -> OpResult<(u8, u8)> {
        self.run("temperature_limits", Some(head), |c| {
            c.check_head(head)?;
            let r = c.transact(&Command::new(head, Verb::TemperatureLimits))?;
            r.require_fields(2)?;
            Ok((r.field(0, "low")?, r.field(1, "high")?))
        })
    }

    /// Starts the transmission source moving along `pattern` at `speed`.
    pub fn transmission_trajectory(&mut self, pattern: u8, speed: u8) -> OpResult<()> {
        self.run("transmission_trajectory", None, |c| {
            if !TRAJECTORY_PATTERNS.contains(&pattern) || !TRAJECTORY_SPEEDS.contains(&speed) {
                return Err(DhiError::argument(format!(
                    "trajectory pattern {} speed {} outside {:?} / {:?}",
                    pattern, speed, TRAJECTORY_PATTERNS, TRAJECTORY_SPEEDS
                )));
            }
            c.transact(&c.cp_command(Verb::Transmission).arg(2).arg(pattern).arg(speed))?;
            Ok(())
        })
    }

    /// Coincidence window width in nanoseconds.
    pub fn set_time_window(&mut self, ns: u8) -> OpResult<()> {
        self.run("set_time_window", None, |c| {
            if !TIME_WINDOW_NS.contains(&ns) {
                return Err(DhiError::argument(format!(
                    "time window {} ns outside {:?}",
                    ns, TIME_WINDOW_NS
                )));
            }
            c.transact(&c.cp_command(Verb::SetAnalog).arg(0).arg(0).arg(0).arg(ns))?;
            Ok(())
        })
    }

    /// Coincidence (window, offset) in nanoseconds.
    pub fn time_window(&mut self) -> OpResult<(u8, u8)> {
        self.run("time_window", None, |c| {
            let r = c.transact(&c.cp_command(Verb::GetAnalog).arg(0).arg(0))?;
            r.require_fields(2)?;
            Ok((r.field(0, "window")?, r.field(1, "offset")?))
        })
    }

    /// Sends caller-supplied command text such as `"3Q 1"` unchanged.
    ///
    /// Commands that can change mode or settings behind the controller's
    /// back drop the corresponding local beliefs.
    pub fn raw_command(&mut self, text: &str) -> OpResult<Response> {
        let cmd = match Command::parse(text) {
            Ok(cmd) => cmd,
            Err(e) => return self.run("raw_command", None, |_| Err(e)),
        };
        let head = cmd.head();
        self.run("raw_command", Some(head), |c| {
            if head != CP_ADDRESS {
                c.check_head(head)?;
                match cmd.verb() {
                    Verb::SetMode | Verb::SelectBlock | Verb::Reboot => c.forget_head(head),
                    Verb::SetAnalog | Verb::Zap | Verb::Calibrate => c.cache.invalidate_head(head),
                    _ => {}
                }
            } else if cmd.verb() == Verb::SetMode {
                c.cp_mode = None;
            }
            c.transact(&cmd)
        })
    }

    /// Runs `text` on the head's embedded operating system.
    pub fn os_command(&mut self, head: u8, text: &str) -> OpResult<String> {
        self.run("os_command", Some(head), |c| {
            c.check_head(head)?;
            if text.trim().is_empty() {
                return Err(DhiError::argument("empty OS command"));
            }
            let cmd = text
                .split_whitespace()
                .fold(Command::new(head, Verb::OsCommand), |cmd, word| cmd.arg(word));
            Ok(c.transact(&cmd)?.joined())
        })
    }

    /// Restarts the selected heads. Their mode and settings are unknown
    /// afterwards.
    pub fn reboot(&mut self, heads: HeadSel) -> OpResult<()> {
        self.run_each("reboot", heads, |c, head| {
            c.forget_head(head);
            c.transact(&Command::new(head, Verb::Reboot).arg(999))?;
            warn!("Head {} rebooted", head);
            Ok(())
        })?;
        Ok(())
    }

    /// Inserts `tag` into the list-mode stream.
    pub fn insert_tag(&mut self, tag: u64) -> OpResult<()> {
        self.run("insert_tag", None, |c| {
            c.transact(&c.cp_command(Verb::Transmission).arg(0).arg(format!("{:X}", tag)))?;
            Ok(())
        })
    }

    pub fn set_tag_control(&mut self, on: bool) -> OpResult<()> {
        self.run("set_tag_control", None, |c| {
            c.transact(&c.cp_command(Verb::Transmission).arg(1).arg(u8::from(on)))?;
            Ok(())
        })
    }
}
