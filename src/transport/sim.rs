//! Simulated scanner: no I/O, answers every command the way the head
//! firmware would and keeps shadow state so call sequences stay
//! consistent. Fault injection hooks let tests exercise recovery paths.

use crate::config::SimulationConfig;
use crate::error::{DeviceCode, DhiError};
use crate::geometry::ScannerModel;
use crate::modes::{CoincidenceMode, HeadMode};
use crate::protocol::{
    byte_sum, settings_sum, AsyncNotice, AsyncPayload, Command, Verb, ALL_BLOCKS, CP_ADDRESS,
};
use crate::settings::{default_block, Setting, SettingsTable, GAIN_GROUP_INDEX};
use crate::transfer::{decode_hex, encode_hex, format_sum, parse_sum, CHUNK_SIZE};
use crate::transport::Transport;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const FIRMWARE: &str = "DHI-SIM 3.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LongOpKind {
    Zap,
    Delay,
    Offsets,
    Flash,
}

#[derive(Debug, Clone)]
struct LongOp {
    kind: LongOpKind,
    config: u8,
    block: u16,
    started: Instant,
    duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SimMode {
    mode: HeadMode,
    config: u8,
    lld: u16,
    uld: u16,
}

#[derive(Debug)]
struct SimHead {
    mode: Option<SimMode>,
    block: u16,
    settings: HashMap<u8, SettingsTable>,
    hv_on: bool,
    hv_volts: u16,
    has_point_source: bool,
    point_source_on: bool,
    temp_limits: (u8, u8),
    busy: Option<LongOp>,
    last_status: i32,
    files: HashMap<String, Vec<u8>>,
    incoming: Option<(String, Vec<u8>)>,
    silent: bool,
    exchanges: u64,
}

#[derive(Debug, Default)]
struct CpState {
    mode: Option<CoincidenceMode>,
    window_ns: u8,
    offset_ns: u8,
    tags_enabled: bool,
    tags: Vec<u64>,
    trajectory: Option<(u8, u8)>,
}

#[derive(Debug, Default)]
struct Faults {
    corrupt_upload_chunks: u32,
    /// Download chunk index and how many more times it arrives damaged.
    corrupt_download: Option<(u32, u32)>,
    corrupt_settings_sums: u32,
    garble: u32,
    misroute: u32,
    out_of_range: bool,
}

#[derive(Debug)]
struct SimState {
    heads: Vec<SimHead>,
    blocks: u16,
    configurations: u8,
    cp: CpState,
    faults: Faults,
    commands: Vec<String>,
    mailbox: Option<AsyncNotice>,
    async_errors: Vec<AsyncNotice>,
}

/// Handle to a simulated scanner. Clones share the same device state.
#[derive(Debug, Clone)]
pub struct SimulatedScanner {
    state: Arc<Mutex<SimState>>,
    timing: SimulationConfig,
}

impl SimulatedScanner {
    pub fn new(model: &ScannerModel, timing: &SimulationConfig) -> Self {
        let blocks = model.blocks_per_head();
        let heads = (0..model.head_count())
            .map(|_| SimHead {
                mode: None,
                block: 0,
                settings: HashMap::new(),
                hv_on: false,
                hv_volts: 0,
                has_point_source: model.point_source(),
                point_source_on: false,
                temp_limits: (10, 45),
                busy: None,
                last_status: 0,
                files: HashMap::new(),
                incoming: None,
                silent: false,
                exchanges: 0,
            })
            .collect();
        let configurations = model.energy_setups().len() as u8;
        SimulatedScanner {
            state: Arc::new(Mutex::new(SimState {
                heads,
                blocks,
                configurations,
                cp: CpState {
                    window_ns: 6,
                    ..CpState::default()
                },
                faults: Faults::default(),
                commands: Vec::new(),
                mailbox: None,
                async_errors: Vec::new(),
            })),
            timing: timing.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the other clones.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every command line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of wire exchanges attempted so far.
    pub fn exchanges(&self) -> usize {
        self.lock().commands.len()
    }

    pub fn head_exchanges(&self, head: u8) -> u64 {
        self.lock()
            .heads
            .get(head as usize)
            .map(|h| h.exchanges)
            .unwrap_or(0)
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Makes the next `n` upload chunks carry a wrong checksum.
    pub fn corrupt_upload_chunks(&self, n: u32) {
        self.lock().faults.corrupt_upload_chunks = n;
    }

    /// Makes download chunk `index` arrive damaged the next `times` it is
    /// sent, so the head rejects it with a checksum error.
    pub fn corrupt_download_chunk(&self, index: u32, times: u32) {
        self.lock().faults.corrupt_download = Some((index, times));
    }

    /// Makes the next `n` settings block reads carry a wrong checksum.
    pub fn corrupt_settings_sums(&self, n: u32) {
        self.lock().faults.corrupt_settings_sums = n;
    }

    /// Answers the next `n` commands with line noise.
    pub fn garble_next(&self, n: u32) {
        self.lock().faults.garble = n;
    }

    /// Answers the next `n` commands as if another head replied.
    pub fn misroute_next(&self, n: u32) {
        self.lock().faults.misroute = n;
    }

    /// Makes calibrations finish with "calibration value out of range".
    pub fn calibration_out_of_range(&self, on: bool) {
        self.lock().faults.out_of_range = on;
    }

    /// A silent head never answers.
    pub fn silence_head(&self, head: u8, silent: bool) {
        if let Some(h) = self.lock().heads.get_mut(head as usize) {
            h.silent = silent;
        }
    }

    /// Simulates a head that restarted without the host noticing.
    pub fn restart_head(&self, head: u8) {
        if let Some(h) = self.lock().heads.get_mut(head as usize) {
            h.mode = None;
            h.busy = None;
            h.hv_on = false;
        }
    }

    /// Changes one setting on the device behind the host's back.
    pub fn poke_setting(&self, config: u8, head: u8, block: u16, setting: Setting, value: i32) {
        let mut state = self.lock();
        let blocks = state.blocks;
        if let Some(h) = state.heads.get_mut(head as usize) {
            h.settings
                .entry(config)
                .or_insert_with(|| SettingsTable::new(blocks))
                .set(block, setting, value);
        }
    }

    pub fn setting(&self, config: u8, head: u8, block: u16, setting: Setting) -> Option<i32> {
        let state = self.lock();
        let h = state.heads.get(head as usize)?;
        match h.settings.get(&config) {
            Some(table) => table.get(block, setting),
            None => Some(setting.default_value()),
        }
    }

    pub fn push_async(&self, notice: AsyncNotice) {
        let mut state = self.lock();
        match notice.payload {
            AsyncPayload::Error(_) => state.async_errors.push(notice),
            AsyncPayload::Message(_) => state.mailbox = Some(notice),
        }
    }

    pub fn file(&self, head: u8, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .heads
            .get(head as usize)
            .and_then(|h| h.files.get(name).cloned())
    }

    pub fn head_mode(&self, head: u8) -> Option<HeadMode> {
        self.lock()
            .heads
            .get(head as usize)
            .and_then(|h| h.mode.map(|m| m.mode))
    }

    pub fn selected_block(&self, head: u8) -> Option<u16> {
        self.lock().heads.get(head as usize).map(|h| h.block)
    }

    pub fn coincidence_mode(&self) -> Option<CoincidenceMode> {
        self.lock().cp.mode
    }

    pub fn high_voltage(&self, head: u8) -> Option<(bool, u16)> {
        self.lock()
            .heads
            .get(head as usize)
            .map(|h| (h.hv_on, h.hv_volts))
    }

    pub fn point_source_on(&self, head: u8) -> Option<bool> {
        self.lock()
            .heads
            .get(head as usize)
            .map(|h| h.point_source_on)
    }

    pub fn tags(&self) -> Vec<u64> {
        self.lock().cp.tags.clone()
    }

    pub fn trajectory(&self) -> Option<(u8, u8)> {
        self.lock().cp.trajectory
    }

    fn delay_for(&self, command: &Command) -> Duration {
        let base = Duration::from_millis(self.timing.latency_ms);
        // Longer lines take proportionally longer on a real bus.
        let scale = 1 + command.text().len() as u32 / 64;
        let mut delay = base * scale;
        if matches!(command.verb(), Verb::Upload | Verb::Download) {
            delay += Duration::from_millis(self.timing.file_delay_ms);
        }
        delay
    }
}

impl Transport for SimulatedScanner {
    fn exchange(&self, command: &Command, timeout: Duration) -> Result<String, DhiError> {
        let delay = self.delay_for(command);
        let reply = {
            let mut state = self.lock();
            state.commands.push(command.text());
            state.respond(command, Duration::from_millis(self.timing.operation_ms))
        };
        if !delay.is_zero() {
            thread::sleep(delay.min(timeout));
        }
        match reply {
            Reply::Line(line) => {
                debug!("sim h{} > {} < {}", command.head(), command, line);
                Ok(line)
            }
            Reply::Silent => Err(DhiError::Timeout(timeout)),
            Reply::Garbled => Err(DhiError::BusConflict("\u{7f}#~".to_string())),
        }
    }

    fn take_async(&self) -> Option<AsyncNotice> {
        self.lock().mailbox.take()
    }

    fn drain_async_errors(&self) -> Vec<AsyncNotice> {
        std::mem::take(&mut self.lock().async_errors)
    }

    fn describe(&self) -> String {
        "simulation".to_string()
    }
}

enum Reply {
    Line(String),
    Silent,
    Garbled,
}

fn ok(cmd: &Command, fields: &[String]) -> Reply {
    let mut line = format!("{}{}", cmd.head(), cmd.verb().letter());
    for f in fields {
        line.push(' ');
        line.push_str(f);
    }
    Reply::Line(line)
}

fn fail(cmd: &Command, code: DeviceCode) -> Reply {
    Reply::Line(format!("{}{}{}", cmd.head(), cmd.verb().letter(), code.code()))
}

fn int_arg<T: std::str::FromStr>(cmd: &Command, index: usize) -> Option<T> {
    cmd.args().get(index).and_then(|a| a.parse().ok())
}

fn strings<T: ToString>(values: impl IntoIterator<Item = T>) -> Vec<String> {
    values.into_iter().map(|v| v.to_string()).collect()
}

impl SimState {
    fn respond(&mut self, cmd: &Command, op_duration: Duration) -> Reply {
        if self.faults.garble > 0 {
            self.faults.garble -= 1;
            return Reply::Garbled;
        }
        if self.faults.misroute > 0 {
            self.faults.misroute -= 1;
            let other = cmd.head().wrapping_add(1) % self.heads.len().max(1) as u8;
            return Reply::Line(format!("{}{}", other, cmd.verb().letter()));
        }
        if cmd.head() == CP_ADDRESS {
            return self.respond_cp(cmd);
        }
        let blocks = self.blocks;
        let configurations = self.configurations;
        let out_of_range = self.faults.out_of_range;
        let Some(head) = self.heads.get_mut(cmd.head() as usize) else {
            return Reply::Silent;
        };
        if head.silent {
            return Reply::Silent;
        }
        head.exchanges += 1;
        head.finish_if_done(blocks, out_of_range);

        if let Some(op) = &head.busy {
            if cmd.verb() == Verb::Progress {
                let elapsed = op.started.elapsed();
                let percent = (elapsed.as_millis() * 100 / op.duration.as_millis().max(1)).min(99);
                let remaining = op.duration.saturating_sub(elapsed).as_secs() + 1;
                return ok(cmd, &strings([percent as u64, remaining, 0]));
            }
            return fail(cmd, DeviceCode::Busy);
        }

        let valid_config = |c: u8| c < configurations;
        let valid_block = |b: u16| b < blocks || b == ALL_BLOCKS;

        match cmd.verb() {
            Verb::SelectBlock => match int_arg::<u16>(cmd, 0) {
                Some(b) if valid_block(b) => {
                    head.block = b;
                    ok(cmd, &[])
                }
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::SetMode => {
                let mode = int_arg::<u8>(cmd, 0).and_then(HeadMode::from_code);
                let config = int_arg::<u8>(cmd, 1).filter(|c| valid_config(*c));
                let lld = int_arg::<u16>(cmd, 2);
                let uld = int_arg::<u16>(cmd, 3);
                match (mode, config, lld, uld) {
                    (Some(mode), Some(config), Some(lld), Some(uld)) if lld < uld => {
                        head.mode = Some(SimMode {
                            mode,
                            config,
                            lld,
                            uld,
                        });
                        ok(cmd, &[])
                    }
                    _ => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::Query => match int_arg::<u8>(cmd, 0) {
                Some(0) => {
                    let total = if head.mode.is_some() { 50_000u64 } else { 0 };
                    ok(cmd, &strings([total, total * 9 / 10, total / 100, 1000]))
                }
                Some(1) => match head.mode {
                    Some(m) => ok(
                        cmd,
                        &strings([
                            u32::from(m.mode.code()),
                            u32::from(m.config),
                            u32::from(head.block),
                            u32::from(m.lld),
                            u32::from(m.uld),
                        ]),
                    ),
                    None => fail(cmd, DeviceCode::WrongMode),
                },
                Some(2) => ok(cmd, &[FIRMWARE.to_string(), format!("h{}", cmd.head())]),
                Some(3) => ok(cmd, &strings([0, 0, 0, 0])),
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::GetAnalog => {
                let config = int_arg::<u8>(cmd, 0).filter(|c| valid_config(*c));
                let block = int_arg::<u16>(cmd, 1).filter(|b| valid_block(*b));
                let (Some(config), Some(block)) = (config, block) else {
                    return fail(cmd, DeviceCode::BadArgument);
                };
                let table = head
                    .settings
                    .entry(config)
                    .or_insert_with(|| SettingsTable::new(blocks));
                if block == ALL_BLOCKS {
                    return ok(cmd, &strings([table.checksum()]));
                }
                let Some(values) = table.block(block) else {
                    return fail(cmd, DeviceCode::BadArgument);
                };
                let mut sum = settings_sum(values.iter());
                if self.faults.corrupt_settings_sums > 0 {
                    self.faults.corrupt_settings_sums -= 1;
                    sum = sum.wrapping_add(1);
                }
                let mut fields = vec![block.to_string()];
                fields.extend(strings(values.iter()));
                fields.push(sum.to_string());
                ok(cmd, &fields)
            }
            Verb::SetAnalog => head.set_analog(cmd, blocks, configurations),
            Verb::Zap | Verb::Calibrate => {
                let (kind, offset) = match cmd.verb() {
                    Verb::Zap => (Some(LongOpKind::Zap), 0),
                    _ => match int_arg::<u8>(cmd, 0) {
                        Some(0) => (Some(LongOpKind::Delay), 1),
                        Some(1) => (Some(LongOpKind::Offsets), 1),
                        _ => (None, 1),
                    },
                };
                let config = int_arg::<u8>(cmd, offset).filter(|c| valid_config(*c));
                let block = int_arg::<u16>(cmd, offset + 1).filter(|b| valid_block(*b));
                match (kind, config, block) {
                    (Some(kind), Some(config), Some(block)) => {
                        head.start(kind, config, block, op_duration);
                        ok(cmd, &[])
                    }
                    _ => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::Progress => {
                let status = std::mem::take(&mut head.last_status);
                ok(cmd, &strings([100, 0, status]))
            }
            Verb::Voltage => {
                let hv = if head.hv_on { head.hv_volts } else { 0 };
                ok(cmd, &strings([312, i32::from(hv), 5012, -4987, 24050]))
            }
            Verb::Singles => {
                let rate = |b: u16| -> u64 {
                    if head.mode.is_some() { 1000 + u64::from(b) * 10 } else { 0 }
                };
                match int_arg::<u16>(cmd, 0) {
                    Some(ALL_BLOCKS) => ok(cmd, &strings((0..blocks).map(rate))),
                    Some(b) if b < blocks => ok(cmd, &strings([rate(b)])),
                    _ => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::TemperatureLimits => {
                if cmd.args().is_empty() {
                    return ok(cmd, &strings([head.temp_limits.0, head.temp_limits.1]));
                }
                match (int_arg::<u8>(cmd, 0), int_arg::<u8>(cmd, 1)) {
                    (Some(low), Some(high)) if low < high => {
                        head.temp_limits = (low, high);
                        ok(cmd, &[])
                    }
                    _ => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::PointSource => match int_arg::<u8>(cmd, 0) {
                _ if !head.has_point_source => fail(cmd, DeviceCode::HardwareFault),
                Some(on @ 0..=1) => {
                    head.point_source_on = on == 1;
                    ok(cmd, &[])
                }
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::HighVoltage => match int_arg::<u8>(cmd, 0) {
                Some(on @ 0..=1) => {
                    head.hv_on = on == 1;
                    ok(cmd, &[])
                }
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::HighVoltageLevel => match int_arg::<u16>(cmd, 0) {
                Some(volts) if volts <= 1500 => {
                    head.hv_volts = volts;
                    ok(cmd, &[])
                }
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::Reboot => match int_arg::<u16>(cmd, 0) {
                Some(999) => {
                    head.mode = None;
                    head.hv_on = false;
                    head.block = 0;
                    ok(cmd, &[])
                }
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::OsCommand => {
                let args = cmd.args();
                match args.first().map(String::as_str) {
                    Some("flash") => match args.get(1) {
                        Some(name) if head.files.contains_key(name) => {
                            head.start(LongOpKind::Flash, 0, 0, op_duration);
                            ok(cmd, &[])
                        }
                        _ => fail(cmd, DeviceCode::NoSuchFile),
                    },
                    Some("ramload") => match args.get(1) {
                        Some(name) if head.files.contains_key(name) => {
                            ok(cmd, &strings(["loaded", name.as_str()]))
                        }
                        _ => fail(cmd, DeviceCode::NoSuchFile),
                    },
                    Some(_) => {
                        let mut fields = vec!["ok".to_string()];
                        fields.extend(args.iter().cloned());
                        ok(cmd, &fields)
                    }
                    None => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::Upload => {
                let (Some(name), Some(index)) = (cmd.args().first(), int_arg::<usize>(cmd, 1)) else {
                    return fail(cmd, DeviceCode::BadArgument);
                };
                let data = head.files.get(name).map(Vec::as_slice).unwrap_or(&[]);
                let start = (index * CHUNK_SIZE).min(data.len());
                let end = (start + CHUNK_SIZE).min(data.len());
                let chunk = &data[start..end];
                let mut sum = byte_sum(chunk);
                if self.faults.corrupt_upload_chunks > 0 {
                    self.faults.corrupt_upload_chunks -= 1;
                    sum = sum.wrapping_add(1);
                }
                ok(cmd, &strings([index.to_string(), encode_hex(chunk), format_sum(sum)]))
            }
            Verb::Download => {
                if let Some((index, times)) = self.faults.corrupt_download.as_mut() {
                    if *times > 0 && int_arg::<u32>(cmd, 1) == Some(*index) {
                        *times -= 1;
                        return fail(cmd, DeviceCode::Checksum);
                    }
                }
                head.download_chunk(cmd)
            }
            Verb::Transmission => fail(cmd, DeviceCode::UnknownCommand),
        }
    }

    fn respond_cp(&mut self, cmd: &Command) -> Reply {
        let heads = self.heads.len() as u8;
        match cmd.verb() {
            Verb::SetMode => {
                let mode = match int_arg::<u8>(cmd, 0) {
                    Some(0) => int_arg::<u8>(cmd, 1)
                        .filter(|s| *s >= 1 && *s < heads.max(2))
                        .map(|span| CoincidenceMode::Coincidence { span }),
                    Some(1) => cmd
                        .args()
                        .get(1)
                        .and_then(|m| u64::from_str_radix(m, 16).ok())
                        .map(|heads| CoincidenceMode::Passthrough { heads }),
                    Some(2) => Some(CoincidenceMode::Tagword),
                    Some(3) => int_arg::<u8>(cmd, 1)
                        .filter(|p| *p < 16)
                        .map(|pattern| CoincidenceMode::Test { pattern }),
                    Some(4) => int_arg::<u8>(cmd, 1)
                        .filter(|h| *h < heads)
                        .map(|head| CoincidenceMode::Time { head }),
                    _ => None,
                };
                match mode {
                    Some(mode) => {
                        self.cp.mode = Some(mode);
                        ok(cmd, &[])
                    }
                    None => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::Query => match int_arg::<u8>(cmd, 0) {
                Some(0) => {
                    let live = self.heads.iter().filter(|h| h.mode.is_some()).count() as u64;
                    let singles = live * 1000 * u64::from(self.blocks);
                    let prompts = if self.cp.mode.is_some() { singles / 20 } else { 0 };
                    ok(cmd, &strings([prompts, prompts / 10, singles, 3]))
                }
                Some(2) => ok(cmd, &[FIRMWARE.to_string(), "cp".to_string()]),
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::Singles => {
                let blocks = u64::from(self.blocks);
                let counts = self
                    .heads
                    .iter()
                    .map(|h| if h.mode.is_some() { 1000 * blocks } else { 0 });
                ok(cmd, &strings(counts))
            }
            Verb::SetAnalog => {
                let index = int_arg::<u8>(cmd, 2);
                let value = int_arg::<u8>(cmd, 3);
                match (index, value) {
                    (Some(0), Some(ns)) if (2..=15).contains(&ns) => {
                        self.cp.window_ns = ns;
                        ok(cmd, &[])
                    }
                    (Some(1), Some(ns)) => {
                        self.cp.offset_ns = ns;
                        ok(cmd, &[])
                    }
                    _ => fail(cmd, DeviceCode::BadArgument),
                }
            }
            Verb::GetAnalog => ok(cmd, &strings([self.cp.window_ns, self.cp.offset_ns])),
            Verb::Transmission => match int_arg::<u8>(cmd, 0) {
                Some(0) => match cmd.args().get(1).and_then(|t| u64::from_str_radix(t, 16).ok()) {
                    Some(tag) if self.cp.tags_enabled => {
                        self.cp.tags.push(tag);
                        ok(cmd, &[])
                    }
                    Some(_) => fail(cmd, DeviceCode::WrongMode),
                    None => fail(cmd, DeviceCode::BadArgument),
                },
                Some(1) => match int_arg::<u8>(cmd, 1) {
                    Some(on @ 0..=1) => {
                        self.cp.tags_enabled = on == 1;
                        ok(cmd, &[])
                    }
                    _ => fail(cmd, DeviceCode::BadArgument),
                },
                Some(2) => match (int_arg::<u8>(cmd, 1), int_arg::<u8>(cmd, 2)) {
                    (Some(pattern), Some(speed)) => {
                        self.cp.trajectory = Some((pattern, speed));
                        ok(cmd, &[])
                    }
                    _ => fail(cmd, DeviceCode::BadArgument),
                },
                _ => fail(cmd, DeviceCode::BadArgument),
            },
            Verb::Progress => ok(cmd, &strings([100, 0, 0])),
            Verb::Reboot => {
                self.cp.mode = None;
                ok(cmd, &[])
            }
            Verb::OsCommand => {
                let mut fields = vec!["ok".to_string()];
                fields.extend(cmd.args().iter().cloned());
                ok(cmd, &fields)
            }
            _ => fail(cmd, DeviceCode::UnknownCommand),
        }
    }
}

impl SimHead {
    fn start(&mut self, kind: LongOpKind, config: u8, block: u16, duration: Duration) {
        self.busy = Some(LongOp {
            kind,
            config,
            block,
            started: Instant::now(),
            duration,
        });
    }

    /// Applies the effect of a finished long operation.
    fn finish_if_done(&mut self, blocks: u16, out_of_range: bool) {
        let Some(op) = &self.busy else {
            return;
        };
        if op.started.elapsed() < op.duration {
            return;
        }
        let op = op.clone();
        self.busy = None;
        self.last_status = 0;
        let table = self
            .settings
            .entry(op.config)
            .or_insert_with(|| SettingsTable::new(blocks));
        let targets: Vec<u16> = if op.block == ALL_BLOCKS {
            (0..blocks).collect()
        } else {
            vec![op.block]
        };
        match op.kind {
            LongOpKind::Zap => {
                for b in targets {
                    if let Some(values) = table.block_mut(b) {
                        *values = default_block();
                    }
                }
            }
            LongOpKind::Delay => {
                for b in targets {
                    table.set(b, Setting::CfdDelay, 12 + i32::from(b % 8));
                }
            }
            LongOpKind::Offsets => {
                for b in targets {
                    table.set(b, Setting::XOffset, 120 + i32::from(b % 16));
                    table.set(b, Setting::YOffset, 124 + i32::from(b % 8));
                    table.set(b, Setting::EOffset, 130);
                }
            }
            LongOpKind::Flash => {}
        }
        if out_of_range && matches!(op.kind, LongOpKind::Delay | LongOpKind::Offsets) {
            self.last_status = DeviceCode::OutOfRange.code();
        }
    }

    fn set_analog(&mut self, cmd: &Command, blocks: u16, configurations: u8) -> Reply {
        let config = int_arg::<u8>(cmd, 0).filter(|c| *c < configurations);
        let block = int_arg::<u16>(cmd, 1).filter(|b| *b < blocks || *b == ALL_BLOCKS);
        let index = int_arg::<u8>(cmd, 2);
        let (Some(config), Some(block), Some(index)) = (config, block, index) else {
            return fail(cmd, DeviceCode::BadArgument);
        };
        let table = self
            .settings
            .entry(config)
            .or_insert_with(|| SettingsTable::new(blocks));

        if index == GAIN_GROUP_INDEX {
            let gains: Option<Vec<i32>> = (3..7).map(|i| int_arg::<i32>(cmd, i)).collect();
            let Some(gains) = gains.filter(|g| g.iter().all(|v| (0..=255).contains(v))) else {
                return fail(cmd, DeviceCode::BadArgument);
            };
            if block == ALL_BLOCKS {
                return fail(cmd, DeviceCode::BadArgument);
            }
            for (setting, value) in Setting::GAINS.iter().zip(gains) {
                table.set(block, *setting, value);
            }
            return ok(cmd, &[]);
        }

        let setting = Setting::from_index(index as usize);
        let value = int_arg::<i32>(cmd, 3);
        match (setting, value) {
            (Some(setting), Some(value)) if setting.range().contains(&value) => {
                if block == ALL_BLOCKS {
                    table.set_all(setting, value);
                } else {
                    table.set(block, setting, value);
                }
                ok(cmd, &[])
            }
            _ => fail(cmd, DeviceCode::BadArgument),
        }
    }

    fn download_chunk(&mut self, cmd: &Command) -> Reply {
        let args = cmd.args();
        let (Some(name), Some(index), Some(hex), Some(sum)) =
            (args.first(), int_arg::<u32>(cmd, 1), args.get(2), args.get(3))
        else {
            return fail(cmd, DeviceCode::BadArgument);
        };
        let (Ok(bytes), Ok(sum)) = (decode_hex(hex), parse_sum(sum)) else {
            return fail(cmd, DeviceCode::BadArgument);
        };
        if byte_sum(&bytes) != sum {
            return fail(cmd, DeviceCode::Checksum);
        }
        if index == 0 {
            self.incoming = Some((name.clone(), Vec::new()));
        }
        let Some((pending_name, buffer)) = self.incoming.as_mut() else {
            return fail(cmd, DeviceCode::BadArgument);
        };
        if pending_name != name {
            return fail(cmd, DeviceCode::BadArgument);
        }
        buffer.extend_from_slice(&bytes);
        if bytes.len() < CHUNK_SIZE {
            if let Some((name, data)) = self.incoming.take() {
                self.files.insert(name, data);
            }
        }
        ok(cmd, &[index.to_string(), format_sum(sum)])
    }
}
