//! Head and coincidence processor modes, and the per-head record of the
//! last mode commanded.

use crate::error::DhiError;
use log::debug;

/// Acquisition mode of one detector head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadMode {
    Run,
    Position,
    Energy,
    Crystal,
    Time,
    Test,
}

impl HeadMode {
    pub fn code(self) -> u8 {
        match self {
            HeadMode::Run => 0,
            HeadMode::Position => 1,
            HeadMode::Energy => 2,
            HeadMode::Crystal => 3,
            HeadMode::Time => 4,
            HeadMode::Test => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<HeadMode> {
        let mode = match code {
            0 => HeadMode::Run,
            1 => HeadMode::Position,
            2 => HeadMode::Energy,
            3 => HeadMode::Crystal,
            4 => HeadMode::Time,
            5 => HeadMode::Test,
            _ => return None,
        };
        Some(mode)
    }

    /// Modes in which a healthy head produces singles from real events.
    pub fn counts_events(self) -> bool {
        !matches!(self, HeadMode::Test)
    }
}

/// Lower and upper energy discriminator levels in keV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyWindow {
    pub lld: u16,
    pub uld: u16,
}

impl EnergyWindow {
    pub const MAX_KEV: u16 = 1000;

    pub fn new(lld: u16, uld: u16) -> Result<Self, DhiError> {
        if lld >= uld || uld > Self::MAX_KEV {
            return Err(DhiError::argument(format!(
                "energy window {}..{} keV invalid, need lld < uld <= {}",
                lld,
                uld,
                Self::MAX_KEV
            )));
        }
        Ok(EnergyWindow { lld, uld })
    }
}

impl Default for EnergyWindow {
    fn default() -> Self {
        EnergyWindow { lld: 400, uld: 650 }
    }
}

/// What a head was last told to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeState {
    pub mode: HeadMode,
    pub block: u16,
    pub config: u8,
    pub window: EnergyWindow,
}

/// Coincidence processor operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoincidenceMode {
    /// Normal coincidence detection between heads up to `span` apart.
    Coincidence { span: u8 },
    /// Singles of the masked heads passed straight through.
    Passthrough { heads: u64 },
    Tagword,
    /// Internal pattern generator.
    Test { pattern: u8 },
    /// Timing spectrum of one head against the rest.
    Time { head: u8 },
}

impl CoincidenceMode {
    pub fn code(&self) -> u8 {
        match self {
            CoincidenceMode::Coincidence { .. } => 0,
            CoincidenceMode::Passthrough { .. } => 1,
            CoincidenceMode::Tagword => 2,
            CoincidenceMode::Test { .. } => 3,
            CoincidenceMode::Time { .. } => 4,
        }
    }
}

/// Per-head (mode, block) belief. `None` is the unknown state every head
/// starts in, so the first real request always reaches the wire.
#[derive(Debug)]
pub struct HeadModeTracker {
    states: Vec<Option<ModeState>>,
    suspect: Vec<bool>,
}

impl HeadModeTracker {
    pub fn new(heads: usize) -> Self {
        HeadModeTracker {
            states: vec![None; heads],
            suspect: vec![false; heads],
        }
    }

    pub fn get(&self, head: u8) -> Option<ModeState> {
        self.states.get(head as usize).copied().flatten()
    }

    pub fn matches(&self, head: u8, wanted: &ModeState) -> bool {
        self.get(head).as_ref() == Some(wanted)
    }

    pub fn set(&mut self, head: u8, state: ModeState) {
        if let Some(slot) = self.states.get_mut(head as usize) {
            *slot = Some(state);
            self.suspect[head as usize] = false;
        }
    }

    pub fn forget(&mut self, head: u8) {
        if let Some(slot) = self.states.get_mut(head as usize) {
            debug!("Head {} mode now unknown", head);
            *slot = None;
        }
    }

    pub fn forget_all(&mut self) {
        self.states.iter_mut().for_each(|s| *s = None);
    }

    /// Flags the belief for verification before it is next relied on.
    pub fn mark_suspect(&mut self, head: u8) {
        if let Some(flag) = self.suspect.get_mut(head as usize) {
            *flag = true;
        }
    }

    pub fn is_suspect(&self, head: u8) -> bool {
        self.suspect.get(head as usize).copied().unwrap_or(false)
    }

    pub fn clear_suspect(&mut self, head: u8) {
        if let Some(flag) = self.suspect.get_mut(head as usize) {
            *flag = false;
        }
    }
}

/// Whether live singles contradict the believed mode.
pub fn counts_contradict(state: &ModeState, singles: u64) -> bool {
    state.mode.counts_events() && singles == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all() -> ModeState {
        ModeState {
            mode: HeadMode::Run,
            block: crate::protocol::ALL_BLOCKS,
            config: 0,
            window: EnergyWindow::new(250, 700).unwrap(),
        }
    }

    #[test]
    fn test_mode_codes() {
        for code in 0..6 {
            assert_eq!(HeadMode::from_code(code).unwrap().code(), code);
        }
        assert!(HeadMode::from_code(6).is_none());
    }

    #[test]
    fn test_energy_window() {
        assert!(EnergyWindow::new(250, 700).is_ok());
        assert!(EnergyWindow::new(700, 250).is_err());
        assert!(EnergyWindow::new(100, 1001).is_err());
    }

    #[test]
    fn test_tracker_transitions() {
        let mut t = HeadModeTracker::new(4);
        assert!(t.get(2).is_none());
        assert!(!t.matches(2, &run_all()));
        t.mark_suspect(2);
        t.set(2, run_all());
        assert!(t.matches(2, &run_all()));
        assert!(!t.is_suspect(2));
        t.forget(2);
        assert!(t.get(2).is_none());
        t.set(9, run_all());
        assert!(t.get(9).is_none());
    }

    #[test]
    fn test_counts_sanity() {
        let state = run_all();
        assert!(counts_contradict(&state, 0));
        assert!(!counts_contradict(&state, 1200));
        let test = ModeState {
            mode: HeadMode::Test,
            ..state
        };
        assert!(!counts_contradict(&test, 0));
    }
}
