//! Per-block analog settings, the trust-tagged cache that holds them and
//! the on-disk snapshot format.

use crate::error::DhiError;
use crate::protocol::settings_sum;
use log::{debug, info};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

pub const NUM_SETTINGS: usize = 11;
/// Setting index that carries all four PMT gains in one `S` command.
pub const GAIN_GROUP_INDEX: u8 = 100;

/// Analog parameters of one block, in wire and snapshot column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    PmtA,
    PmtB,
    PmtC,
    PmtD,
    Cfd,
    CfdDelay,
    XOffset,
    YOffset,
    EOffset,
    TdcOffset,
    TdcGain,
}

impl Setting {
    pub const ALL: [Setting; NUM_SETTINGS] = [
        Setting::PmtA,
        Setting::PmtB,
        Setting::PmtC,
        Setting::PmtD,
        Setting::Cfd,
        Setting::CfdDelay,
        Setting::XOffset,
        Setting::YOffset,
        Setting::EOffset,
        Setting::TdcOffset,
        Setting::TdcGain,
    ];

    pub const GAINS: [Setting; 4] = [Setting::PmtA, Setting::PmtB, Setting::PmtC, Setting::PmtD];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Setting> {
        Setting::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Setting::PmtA => "pmta",
            Setting::PmtB => "pmtb",
            Setting::PmtC => "pmtc",
            Setting::PmtD => "pmtd",
            Setting::Cfd => "cfd",
            Setting::CfdDelay => "cfd_delay",
            Setting::XOffset => "x_offset",
            Setting::YOffset => "y_offset",
            Setting::EOffset => "e_offset",
            Setting::TdcOffset => "tdc_offset",
            Setting::TdcGain => "tdc_gain",
        }
    }

    pub fn range(self) -> RangeInclusive<i32> {
        match self {
            Setting::CfdDelay => 0..=31,
            _ => 0..=255,
        }
    }

    /// Value a zapped block returns to.
    pub fn default_value(self) -> i32 {
        match self {
            Setting::PmtA | Setting::PmtB | Setting::PmtC | Setting::PmtD => 128,
            Setting::Cfd => 64,
            Setting::CfdDelay => 16,
            Setting::XOffset | Setting::YOffset | Setting::EOffset => 128,
            Setting::TdcOffset => 0,
            Setting::TdcGain => 128,
        }
    }
}

pub type BlockSettings = [i32; NUM_SETTINGS];

pub fn default_block() -> BlockSettings {
    let mut block = [0; NUM_SETTINGS];
    for setting in Setting::ALL {
        block[setting.index()] = setting.default_value();
    }
    block
}

/// Settings of every block of one head in one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsTable {
    blocks: Vec<BlockSettings>,
}

impl SettingsTable {
    pub fn new(blocks: u16) -> Self {
        SettingsTable {
            blocks: vec![default_block(); blocks as usize],
        }
    }

    pub fn from_blocks(blocks: Vec<BlockSettings>) -> Self {
        SettingsTable { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, block: u16, setting: Setting) -> Option<i32> {
        self.blocks
            .get(block as usize)
            .map(|b| b[setting.index()])
    }

    pub fn set(&mut self, block: u16, setting: Setting, value: i32) {
        if let Some(b) = self.blocks.get_mut(block as usize) {
            b[setting.index()] = value;
        }
    }

    /// Sets `setting` on every block.
    pub fn set_all(&mut self, setting: Setting, value: i32) {
        for b in &mut self.blocks {
            b[setting.index()] = value;
        }
    }

    pub fn block(&self, block: u16) -> Option<&BlockSettings> {
        self.blocks.get(block as usize)
    }

    pub fn block_mut(&mut self, block: u16) -> Option<&mut BlockSettings> {
        self.blocks.get_mut(block as usize)
    }

    pub fn blocks(&self) -> &[BlockSettings] {
        &self.blocks
    }

    /// Sum the firmware reports for the whole table.
    pub fn checksum(&self) -> u32 {
        settings_sum(self.blocks.iter().flatten())
    }

    /// Rejects values outside each setting's documented range.
    pub fn validate(&self) -> Result<(), DhiError> {
        for (block, values) in self.blocks.iter().enumerate() {
            for setting in Setting::ALL {
                let value = values[setting.index()];
                if !setting.range().contains(&value) {
                    return Err(DhiError::argument(format!(
                        "block {} {} = {} outside {:?}",
                        block,
                        setting.name(),
                        value,
                        setting.range()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One `S` command worth of settings change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingWrite {
    /// Same value to every block of the head.
    Broadcast { setting: Setting, value: i32 },
    /// The four PMT gains of one block together.
    Gains { block: u16, values: [i32; 4] },
    Single { block: u16, setting: Setting, value: i32 },
}

/// Works out the commands that turn `current` into `requested`.
///
/// A setting whose new value is shared by more than `fraction` of all
/// blocks is written once as a broadcast, followed by fix-ups for the
/// blocks that want something else. Blocks changing all four gains get
/// one combined command.
pub fn plan_writes(
    current: &SettingsTable,
    requested: &SettingsTable,
    fraction: f64,
) -> Vec<SettingWrite> {
    let blocks = current.len().min(requested.len());
    let threshold = blocks as f64 * fraction;
    let mut needs = vec![[false; NUM_SETTINGS]; blocks];
    let mut writes = Vec::new();

    for setting in Setting::ALL {
        let i = setting.index();
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for b in 0..blocks {
            if requested.blocks[b][i] != current.blocks[b][i] {
                *counts.entry(requested.blocks[b][i]).or_default() += 1;
            }
        }
        let best = counts
            .iter()
            .map(|(&value, &n)| (n, std::cmp::Reverse(value)))
            .max()
            .map(|(n, std::cmp::Reverse(value))| (value, n));

        match best {
            Some((value, n)) if n > 1 && n as f64 > threshold => {
                writes.push(SettingWrite::Broadcast { setting, value });
                for b in 0..blocks {
                    needs[b][i] = requested.blocks[b][i] != value;
                }
            }
            _ => {
                for b in 0..blocks {
                    needs[b][i] = requested.blocks[b][i] != current.blocks[b][i];
                }
            }
        }
    }

    for (b, need) in needs.iter_mut().enumerate() {
        let values = &requested.blocks[b];
        if Setting::GAINS.iter().all(|s| need[s.index()]) {
            writes.push(SettingWrite::Gains {
                block: b as u16,
                values: [values[0], values[1], values[2], values[3]],
            });
            for s in Setting::GAINS {
                need[s.index()] = false;
            }
        }
        for setting in Setting::ALL {
            if need[setting.index()] {
                writes.push(SettingWrite::Single {
                    block: b as u16,
                    setting,
                    value: values[setting.index()],
                });
            }
        }
    }
    writes
}

#[derive(Debug, Default)]
struct CacheEntry {
    table: Option<SettingsTable>,
    trusted: bool,
}

/// Settings per (configuration, head), each pair tagged with a trust flag.
#[derive(Debug, Default)]
pub struct SettingsCache {
    entries: HashMap<(u8, u8), CacheEntry>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trusted(&self, config: u8, head: u8) -> bool {
        self.entries
            .get(&(config, head))
            .map(|e| e.trusted && e.table.is_some())
            .unwrap_or(false)
    }

    pub fn table(&self, config: u8, head: u8) -> Option<&SettingsTable> {
        self.entries.get(&(config, head)).and_then(|e| e.table.as_ref())
    }

    /// Stores a table that matches the device.
    pub fn store_trusted(&mut self, config: u8, head: u8, table: SettingsTable) {
        let entry = self.entries.entry((config, head)).or_default();
        entry.table = Some(table);
        entry.trusted = true;
    }

    /// Stores a table of unknown freshness, such as a snapshot read at start.
    pub fn store_untrusted(&mut self, config: u8, head: u8, table: SettingsTable) {
        let entry = self.entries.entry((config, head)).or_default();
        entry.table = Some(table);
        entry.trusted = false;
    }

    pub fn trust(&mut self, config: u8, head: u8) {
        if let Some(entry) = self.entries.get_mut(&(config, head)) {
            entry.trusted = entry.table.is_some();
        }
    }

    pub fn invalidate(&mut self, config: u8, head: u8) {
        if let Some(entry) = self.entries.get_mut(&(config, head)) {
            debug!("Distrusting settings of config {} head {}", config, head);
            entry.trusted = false;
        }
    }

    /// Distrusts every configuration of one head.
    pub fn invalidate_head(&mut self, head: u8) {
        for ((_, h), entry) in self.entries.iter_mut() {
            if *h == head {
                entry.trusted = false;
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.trusted = false;
        }
    }
}

pub fn snapshot_path(dir: &Path, config: u8, head: u8) -> PathBuf {
    dir.join(format!("h{}_c{}_settings.txt", head, config))
}

/// Writes the table as a header line plus one line per block.
pub fn save_snapshot(
    dir: &Path,
    config: u8,
    head: u8,
    table: &SettingsTable,
) -> Result<(), DhiError> {
    let path = snapshot_path(dir, config, head);
    let mut wtr = csv::Writer::from_path(&path)
        .map_err(|e| DhiError::Resource(format!("{}: {}", path.display(), e)))?;
    let mut header = vec!["block".to_string()];
    header.extend(Setting::ALL.iter().map(|s| s.name().to_string()));
    wtr.write_record(&header)
        .map_err(|e| DhiError::Resource(e.to_string()))?;
    for (block, values) in table.blocks().iter().enumerate() {
        let mut record = vec![block.to_string()];
        record.extend(values.iter().map(|v| v.to_string()));
        wtr.write_record(&record)
            .map_err(|e| DhiError::Resource(e.to_string()))?;
    }
    wtr.flush()?;
    debug!("Saved settings snapshot {}", path.display());
    Ok(())
}

/// Reads a snapshot back; `None` when no snapshot exists for the pair.
pub fn load_snapshot(
    dir: &Path,
    config: u8,
    head: u8,
    blocks: u16,
) -> Result<Option<SettingsTable>, DhiError> {
    let path = snapshot_path(dir, config, head);
    if !path.exists() {
        return Ok(None);
    }
    let mut rdr = csv::Reader::from_path(&path)
        .map_err(|e| DhiError::Resource(format!("{}: {}", path.display(), e)))?;
    let mut table = SettingsTable::new(blocks);
    for record in rdr.records() {
        let record = record.map_err(|e| DhiError::Parse(e.to_string()))?;
        if record.len() != NUM_SETTINGS + 1 {
            return Err(DhiError::Parse(format!(
                "{}: expected {} columns, got {}",
                path.display(),
                NUM_SETTINGS + 1,
                record.len()
            )));
        }
        let parse = |i: usize| -> Result<i32, DhiError> {
            record[i]
                .trim()
                .parse()
                .map_err(|_| DhiError::Parse(format!("{}: bad value {:?}", path.display(), &record[i])))
        };
        let block = parse(0)?;
        let Some(values) = u16::try_from(block).ok().and_then(|b| table.block_mut(b)) else {
            return Err(DhiError::Parse(format!(
                "{}: block {} out of range",
                path.display(),
                block
            )));
        };
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = parse(i + 1)?;
        }
    }
    info!("Loaded settings snapshot {}", path.display());
    Ok(Some(table))
}
