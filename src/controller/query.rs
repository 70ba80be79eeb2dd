//! Read-only queries: statistics, singles, progress and liveness.

use super::Controller;
use crate::error::{DhiError, OpResult};
use crate::protocol::{Command, Response, Verb, ALL_BLOCKS};
use log::{info, warn};

/// Event counters of one head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub total: u64,
    pub valid: u64,
    pub dropped: u64,
    pub elapsed_ms: u64,
}

/// Coincidence processor rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRate {
    pub prompts: u64,
    pub randoms: u64,
    pub singles: u64,
    pub dead_time_pct: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: u32,
    pub remaining_s: u64,
    /// Final status of the last long operation, negative on failure.
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voltages {
    pub temperature_c: f64,
    pub high_voltage: i32,
    pub plus_5v_mv: i32,
    pub minus_5v_mv: i32,
    pub plus_24v_mv: i32,
}

/// Result of pinging one head during a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadHealth {
    pub head: u8,
    /// Firmware identification, `None` when the head did not answer.
    pub firmware: Option<String>,
}

impl HeadHealth {
    pub fn alive(&self) -> bool {
        self.firmware.is_some()
    }
}

fn u64_fields(response: &Response) -> Result<Vec<u64>, DhiError> {
    response
        .int_fields()?
        .into_iter()
        .map(|v| {
            u64::try_from(v).map_err(|_| DhiError::Parse(format!("negative count {}", v)))
        })
        .collect()
}

impl Controller {
    pub fn statistics(&mut self, head: u8) -> OpResult<Statistics> {
        self.run("statistics", Some(head), |c| {
            c.check_head(head)?;
            let r = c.transact(&Command::new(head, Verb::Query).arg(0))?;
            r.require_fields(4)?;
            Ok(Statistics {
                total: r.field(0, "total")?,
                valid: r.field(1, "valid")?,
                dropped: r.field(2, "dropped")?,
                elapsed_ms: r.field(3, "elapsed")?,
            })
        })
    }

    /// Singles of one block, or of every block with [`ALL_BLOCKS`].
    pub fn singles(&mut self, head: u8, block: u16) -> OpResult<Vec<u64>> {
        self.run("singles", Some(head), |c| c.read_singles(head, block))
    }

    pub(crate) fn read_singles(&mut self, head: u8, block: u16) -> Result<Vec<u64>, DhiError> {
        self.check_head(head)?;
        self.geometry.check_block(block)?;
        let r = self.transact(&Command::new(head, Verb::Singles).arg(block))?;
        let counts = u64_fields(&r)?;
        let expected = if block == ALL_BLOCKS {
            self.geometry.blocks() as usize
        } else {
            1
        };
        if counts.len() != expected {
            return Err(DhiError::Parse(format!(
                "head {} returned {} singles, expected {}",
                head,
                counts.len(),
                expected
            )));
        }
        Ok(counts)
    }

    /// Singles per head as seen by the coincidence processor.
    pub fn ring_singles(&mut self) -> OpResult<Vec<u64>> {
        self.run("ring_singles", None, |c| {
            let r = c.transact(&c.cp_command(Verb::Singles))?;
            let counts = u64_fields(&r)?;
            r.require_fields(c.geometry.heads().len())?;
            Ok(counts)
        })
    }

    pub fn count_rate(&mut self) -> OpResult<CountRate> {
        self.run("count_rate", None, |c| {
            let r = c.transact(&c.cp_command(Verb::Query).arg(0))?;
            r.require_fields(4)?;
            Ok(CountRate {
                prompts: r.field(0, "prompts")?,
                randoms: r.field(1, "randoms")?,
                singles: r.field(2, "singles")?,
                dead_time_pct: r.field(3, "dead time")?,
            })
        })
    }

    pub fn progress(&mut self, head: u8) -> OpResult<Progress> {
        self.run("progress", Some(head), |c| {
            c.check_head(head)?;
            c.read_progress(head)
        })
    }

    pub(crate) fn read_progress(&mut self, head: u8) -> Result<Progress, DhiError> {
        let r = self.transact(&Command::new(head, Verb::Progress))?;
        r.require_fields(3)?;
        Ok(Progress {
            percent: r.field(0, "percent")?,
            remaining_s: r.field(1, "remaining")?,
            status: r.field(2, "status")?,
        })
    }

    /// Firmware identification string of `head`.
    pub fn ping(&mut self, head: u8) -> OpResult<String> {
        self.run("ping", Some(head), |c| {
            c.check_head(head)?;
            c.ping_inner(head)
        })
    }

    fn ping_inner(&mut self, head: u8) -> Result<String, DhiError> {
        let r = self.transact(&Command::new(head, Verb::Query).arg(2))?;
        r.require_fields(1)?;
        Ok(r.joined())
    }

    /// Self-test codes reported by the head; all zero when healthy.
    pub fn diagnostics(&mut self, head: u8) -> OpResult<Vec<i64>> {
        self.run("diagnostics", Some(head), |c| {
            c.check_head(head)?;
            let r = c.transact(&Command::new(head, Verb::Query).arg(3))?;
            r.int_fields()
        })
    }

    /// Pings every head of the geometry. Heads that stay silent are marked
    /// absent, heads that answer are marked present again.
    pub fn health_check(&mut self) -> OpResult<Vec<HeadHealth>> {
        self.run("health_check", None, |c| {
            let mut report = Vec::new();
            for head in 0..c.geometry.heads().len() as u8 {
                match c.ping_inner(head) {
                    Ok(firmware) => {
                        c.geometry.mark_present(head);
                        report.push(HeadHealth {
                            head,
                            firmware: Some(firmware),
                        });
                    }
                    Err(e @ (DhiError::Timeout(_) | DhiError::RetryExhausted { .. })) => {
                        warn!("Head {} did not answer, marking absent", head);
                        c.geometry.mark_absent(head);
                        c.forget_head(head);
                        c.note_error("health_check", Some(head), e);
                        report.push(HeadHealth {
                            head,
                            firmware: None,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            let alive = report.iter().filter(|h| h.alive()).count();
            info!("Health check: {}/{} heads alive", alive, report.len());
            Ok(report)
        })
    }

    pub fn voltages(&mut self, head: u8) -> OpResult<Voltages> {
        self.run("voltages", Some(head), |c| {
            c.check_head(head)?;
            let r = c.transact(&Command::new(head, Verb::Voltage))?;
            r.require_fields(5)?;
            let tenths: i32 = r.field(0, "temperature")?;
            Ok(Voltages {
                temperature_c: f64::from(tenths) / 10.0,
                high_voltage: r.field(1, "high voltage")?,
                plus_5v_mv: r.field(2, "+5V")?,
                minus_5v_mv: r.field(3, "-5V")?,
                plus_24v_mv: r.field(4, "+24V")?,
            })
        })
    }
}
