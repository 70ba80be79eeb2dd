//! Long-running head operations: zap and the delay/offset calibrations.
//!
//! Each one is triggered once and then followed by progress polling; the
//! trigger itself is never retried. A calibration value out of range is
//! recorded and reported but does not stop the remaining heads.

use super::Controller;
use crate::error::{DeviceCode, DhiError, OpResult};
use crate::geometry::HeadSel;
use crate::protocol::{Command, Verb};
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Calibration {
    Zap,
    Delay,
    Offsets,
}

impl Calibration {
    fn name(self) -> &'static str {
        match self {
            Calibration::Zap => "zap",
            Calibration::Delay => "determine_delay",
            Calibration::Offsets => "determine_offsets",
        }
    }

    fn command(self, head: u8, config: u8, block: u16) -> Command {
        let cmd = match self {
            Calibration::Zap => Command::new(head, Verb::Zap),
            Calibration::Delay => Command::new(head, Verb::Calibrate).arg(0),
            Calibration::Offsets => Command::new(head, Verb::Calibrate).arg(1),
        };
        cmd.arg(config).arg(block)
    }
}

/// Per-head outcome of a long operation that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationReport {
    pub head: u8,
    /// Benign device code the head finished with, if any.
    pub warning: Option<DeviceCode>,
}

impl Controller {
    /// Returns the analog settings of `block` (or all blocks) to defaults.
    pub fn zap(&mut self, heads: HeadSel, block: u16) -> OpResult<Vec<CalibrationReport>> {
        self.calibrate(Calibration::Zap, heads, block)
    }

    pub fn determine_delay(&mut self, heads: HeadSel, block: u16) -> OpResult<Vec<CalibrationReport>> {
        self.calibrate(Calibration::Delay, heads, block)
    }

    pub fn determine_offsets(
        &mut self,
        heads: HeadSel,
        block: u16,
    ) -> OpResult<Vec<CalibrationReport>> {
        self.calibrate(Calibration::Offsets, heads, block)
    }

    fn calibrate(
        &mut self,
        kind: Calibration,
        heads: HeadSel,
        block: u16,
    ) -> OpResult<Vec<CalibrationReport>> {
        let op = kind.name();
        self.run(op, heads.single(), |c| c.geometry.check_block(block))?;
        let config = self.config.configuration;
        self.run_each(op, heads, |c, head| {
            // The device changes its own settings from here on.
            c.cache.invalidate(config, head);
            if kind == Calibration::Zap {
                // After a reset the head mode is unknown.
                c.modes.forget(head);
            }
            c.transact(&kind.command(head, config, block))?;
            let warning = match c.wait_for_completion(head) {
                Ok(()) => None,
                Err(e) if e.is_benign() => {
                    let code = e.device_code();
                    c.note_error(op, Some(head), e);
                    code
                }
                Err(e) => return Err(e),
            };
            info!("{} finished on head {} block {}", op, head, block);
            Ok(CalibrationReport { head, warning })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_commands() {
        assert_eq!(Calibration::Zap.command(2, 0, 255).text(), "2Z 0 255");
        assert_eq!(Calibration::Delay.command(1, 3, 7).text(), "1X 0 3 7");
        assert_eq!(Calibration::Offsets.command(0, 1, 255).text(), "0X 1 1 255");
    }
}
