//! Head and coincidence processor mode control.

use super::Controller;
use crate::error::{DeviceCode, DhiError, OpResult};
use crate::geometry::HeadSel;
use crate::modes::{counts_contradict, CoincidenceMode, EnergyWindow, HeadMode, ModeState};
use crate::protocol::{Command, Verb, ALL_BLOCKS};
use log::{debug, info, warn};

impl Controller {
    /// Puts the selected heads into `mode`, stopping at the first failure.
    /// Test mode has its own entry point and is refused here.
    pub fn set_head_mode(
        &mut self,
        heads: HeadSel,
        mode: HeadMode,
        block: u16,
        window: EnergyWindow,
    ) -> OpResult<()> {
        self.run("set_head_mode", heads.single(), |c| {
            if mode == HeadMode::Test {
                return Err(DhiError::argument(
                    "test mode is not valid here, use set_test_mode",
                ));
            }
            c.geometry.check_block(block)
        })?;
        self.run_each("set_head_mode", heads, |c, head| {
            let wanted = c.mode_state(mode, block, window);
            c.apply_mode(head, wanted)
        })?;
        Ok(())
    }

    /// Issues the mode change only when `head` is not already in the
    /// wanted state. Returns whether any mode command was sent.
    pub fn ensure_mode(
        &mut self,
        head: u8,
        mode: HeadMode,
        block: u16,
        window: EnergyWindow,
    ) -> OpResult<bool> {
        self.run("ensure_mode", Some(head), |c| {
            c.ensure_mode_inner(head, mode, block, window)
        })
    }

    fn ensure_mode_inner(
        &mut self,
        head: u8,
        mode: HeadMode,
        block: u16,
        window: EnergyWindow,
    ) -> Result<bool, DhiError> {
        if mode == HeadMode::Test {
            return Err(DhiError::argument(
                "test mode is not valid here, use set_test_mode",
            ));
        }
        self.check_head(head)?;
        self.geometry.check_block(block)?;
        let wanted = self.mode_state(mode, block, window);
        if self.modes.matches(head, &wanted) && self.belief_holds(head, &wanted)? {
            debug!("Head {} already in {:?} block {}", head, mode, block);
            return Ok(false);
        }
        let config = self.config.configuration;
        self.settings_inner(config, head)?;
        self.apply_mode(head, wanted)?;
        Ok(true)
    }

    /// Puts `head` into the internal test-pulse mode.
    pub fn set_test_mode(&mut self, head: u8, block: u16) -> OpResult<()> {
        self.run("set_test_mode", Some(head), |c| {
            c.check_head(head)?;
            c.geometry.check_block(block)?;
            let wanted = c.mode_state(HeadMode::Test, block, EnergyWindow::default());
            c.apply_mode(head, wanted)
        })
    }

    /// Asks `head` which mode it is in and adopts the answer. `None` when
    /// the head reports no mode set since it started.
    pub fn verify_head_mode(&mut self, head: u8) -> OpResult<Option<ModeState>> {
        self.run("verify_head_mode", Some(head), |c| {
            c.check_head(head)?;
            let r = match c.transact(&Command::new(head, Verb::Query).arg(1)) {
                Ok(r) => r,
                Err(e) if e.device_code() == Some(DeviceCode::WrongMode) => {
                    c.modes.forget(head);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            r.require_fields(5)?;
            let code: u8 = r.field(0, "mode")?;
            let mode = HeadMode::from_code(code)
                .ok_or_else(|| DhiError::Parse(format!("head {} reports mode {}", head, code)))?;
            let actual = ModeState {
                mode,
                config: r.field(1, "configuration")?,
                block: r.field(2, "block")?,
                window: EnergyWindow {
                    lld: r.field(3, "lld")?,
                    uld: r.field(4, "uld")?,
                },
            };
            if c.modes.get(head) != Some(actual) {
                info!("Head {} is in {:?}, correcting local belief", head, actual);
            }
            c.modes.set(head, actual);
            Ok(Some(actual))
        })
    }

    /// Normal coincidence detection between heads up to `span` apart.
    pub fn set_coincidence_mode(&mut self, span: u8) -> OpResult<()> {
        self.run("set_coincidence_mode", None, |c| {
            let heads = c.geometry.heads().len() as u8;
            if span == 0 || span >= heads.max(2) {
                return Err(DhiError::argument(format!(
                    "span {} outside 1..{}",
                    span,
                    heads.max(2)
                )));
            }
            c.apply_cp_mode(CoincidenceMode::Coincidence { span })
        })
    }

    /// Passes the singles of `heads` straight through.
    pub fn set_passthrough_mode(&mut self, heads: &[u8]) -> OpResult<()> {
        self.run("set_passthrough_mode", None, |c| {
            if heads.is_empty() {
                return Err(DhiError::argument("no heads selected for passthrough"));
            }
            let mut mask = 0u64;
            for &head in heads {
                c.check_head(head)?;
                mask |= 1 << head;
            }
            c.apply_cp_mode(CoincidenceMode::Passthrough { heads: mask })
        })
    }

    pub fn set_tagword_mode(&mut self) -> OpResult<()> {
        self.run("set_tagword_mode", None, |c| {
            c.apply_cp_mode(CoincidenceMode::Tagword)
        })
    }

    /// Coincidence processor pattern generator, `pattern` 0..16.
    pub fn set_cp_test_mode(&mut self, pattern: u8) -> OpResult<()> {
        self.run("set_cp_test_mode", None, |c| {
            if pattern >= 16 {
                return Err(DhiError::argument(format!("test pattern {} outside 0..16", pattern)));
            }
            c.apply_cp_mode(CoincidenceMode::Test { pattern })
        })
    }

    /// Timing spectrum of `head` against the rest of the ring.
    pub fn set_time_mode(&mut self, head: u8) -> OpResult<()> {
        self.run("set_time_mode", Some(head), |c| {
            c.check_head(head)?;
            c.apply_cp_mode(CoincidenceMode::Time { head })
        })
    }

    /// Brings every present head into run mode and the coincidence
    /// processor into coincidence mode.
    pub fn initialize_scan(&mut self, window: EnergyWindow, span: u8) -> OpResult<()> {
        for head in self.geometry.present_heads() {
            self.ensure_mode(head, HeadMode::Run, ALL_BLOCKS, window)?;
        }
        self.set_coincidence_mode(span)?;
        info!("Scan initialized, window {}..{} keV", window.lld, window.uld);
        Ok(())
    }

    fn mode_state(&self, mode: HeadMode, block: u16, window: EnergyWindow) -> ModeState {
        ModeState {
            mode,
            block,
            config: self.config.configuration,
            window,
        }
    }

    /// Selects the block, then sets the mode. Any failure leaves the head
    /// in the unknown state.
    fn apply_mode(&mut self, head: u8, wanted: ModeState) -> Result<(), DhiError> {
        let select = Command::new(head, Verb::SelectBlock).arg(wanted.block);
        let set = Command::new(head, Verb::SetMode)
            .arg(wanted.mode.code())
            .arg(wanted.config)
            .arg(wanted.window.lld)
            .arg(wanted.window.uld);
        let result = self.transact(&select).and_then(|_| self.transact(&set));
        match result {
            Ok(_) => {
                self.modes.set(head, wanted);
                info!("Head {} now {:?} block {}", head, wanted.mode, wanted.block);
                Ok(())
            }
            Err(e) => {
                self.modes.forget(head);
                Err(e)
            }
        }
    }

    /// Checks remembered state against live singles when asked to.
    fn belief_holds(&mut self, head: u8, state: &ModeState) -> Result<bool, DhiError> {
        if !self.config.sanity_check && !self.modes.is_suspect(head) {
            return Ok(true);
        }
        let total: u64 = self.read_singles(head, ALL_BLOCKS)?.iter().sum();
        if counts_contradict(state, total) {
            warn!(
                "Head {} believed in {:?} but reports no singles, mode unknown",
                head, state.mode
            );
            self.modes.forget(head);
            return Ok(false);
        }
        self.modes.clear_suspect(head);
        Ok(true)
    }

    /// Flags the remembered mode of `head` for a singles check before it
    /// is next relied on.
    pub fn mark_mode_suspect(&mut self, head: u8) {
        self.modes.mark_suspect(head);
    }

    fn apply_cp_mode(&mut self, mode: CoincidenceMode) -> Result<(), DhiError> {
        let cmd = self.cp_command(Verb::SetMode).arg(mode.code());
        let cmd = match mode {
            CoincidenceMode::Coincidence { span } => cmd.arg(span),
            CoincidenceMode::Passthrough { heads } => cmd.arg(format!("{:X}", heads)),
            CoincidenceMode::Tagword => cmd,
            CoincidenceMode::Test { pattern } => cmd.arg(pattern),
            CoincidenceMode::Time { head } => cmd.arg(head),
        };
        if let Err(e) = self.transact(&cmd) {
            self.cp_mode = None;
            return Err(e);
        }
        info!("Coincidence processor now {:?}", mode);
        self.cp_mode = Some(mode);
        Ok(())
    }
}
