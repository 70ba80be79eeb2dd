//! Settings read-back, verification and minimal-command writes.

use super::Controller;
use crate::error::{DhiError, OpResult};
use crate::protocol::{settings_sum, Command, Verb, ALL_BLOCKS};
use crate::settings::{
    plan_writes, save_snapshot, BlockSettings, SettingWrite, SettingsTable, GAIN_GROUP_INDEX,
    NUM_SETTINGS,
};
use log::{debug, info, warn};

impl Controller {
    /// Settings of `head` in configuration `config`, read from the device
    /// unless the cache is trusted or its checksum matches the device.
    pub fn get_settings(&mut self, config: u8, head: u8) -> OpResult<SettingsTable> {
        self.run("get_settings", Some(head), |c| c.settings_inner(config, head))
    }

    /// Re-reads every block of `head` from the device.
    pub fn refresh_settings(&mut self, config: u8, head: u8) -> OpResult<SettingsTable> {
        self.run("refresh_settings", Some(head), |c| {
            c.check_target(config, head)?;
            c.refresh_inner(config, head)
        })
    }

    /// Writes `table` to the device with as few commands as possible and
    /// returns the number of commands sent.
    pub fn set_settings(&mut self, config: u8, head: u8, table: &SettingsTable) -> OpResult<usize> {
        self.run("set_settings", Some(head), |c| {
            c.check_target(config, head)?;
            if table.len() != c.geometry.blocks() as usize {
                return Err(DhiError::argument(format!(
                    "table has {} blocks, head has {}",
                    table.len(),
                    c.geometry.blocks()
                )));
            }
            table.validate()?;
            let current = c.settings_inner(config, head)?;
            let writes = plan_writes(&current, table, c.config.broadcast_fraction);
            debug!(
                "Writing settings of config {} head {} in {} commands",
                config,
                head,
                writes.len()
            );
            for write in &writes {
                let cmd = setting_command(config, head, write);
                if let Err(e) = c.transact(&cmd) {
                    // Part of the table may already be applied.
                    c.cache.invalidate(config, head);
                    return Err(e);
                }
            }
            c.cache.store_trusted(config, head, table.clone());
            c.persist(config, head);
            Ok(writes.len())
        })
    }

    /// Marks the cached settings of `head` as stale.
    pub fn invalidate_settings(&mut self, config: u8, head: u8) {
        self.cache.invalidate(config, head);
    }

    /// Whether the cache currently matches the device.
    pub fn trusted(&self, config: u8, head: u8) -> bool {
        self.cache.is_trusted(config, head)
    }

    fn check_target(&self, config: u8, head: u8) -> Result<(), DhiError> {
        self.geometry.configuration(config)?;
        self.check_head(head)
    }

    pub(crate) fn settings_inner(&mut self, config: u8, head: u8) -> Result<SettingsTable, DhiError> {
        self.check_target(config, head)?;
        if self.cache.is_trusted(config, head) {
            if let Some(table) = self.cache.table(config, head) {
                return Ok(table.clone());
            }
        }
        if self.config.verify_with_checksum && self.verify_cached(config, head)? {
            if let Some(table) = self.cache.table(config, head) {
                return Ok(table.clone());
            }
        }
        self.refresh_inner(config, head)
    }

    /// Trusts the cached table if its checksum matches the device's.
    fn verify_cached(&mut self, config: u8, head: u8) -> Result<bool, DhiError> {
        let Some(local) = self.cache.table(config, head).map(SettingsTable::checksum) else {
            return Ok(false);
        };
        let r = self.transact(&Command::new(head, Verb::GetAnalog).arg(config).arg(ALL_BLOCKS))?;
        let device: u32 = r.field(0, "checksum")?;
        if device == local {
            debug!("Settings of config {} head {} verified by checksum", config, head);
            self.cache.trust(config, head);
            Ok(true)
        } else {
            info!(
                "Settings checksum of config {} head {} differs ({:#X} != {:#X}), refreshing",
                config, head, device, local
            );
            Ok(false)
        }
    }

    pub(crate) fn refresh_inner(&mut self, config: u8, head: u8) -> Result<SettingsTable, DhiError> {
        let blocks = self.geometry.blocks();
        let mut rows = Vec::with_capacity(blocks as usize);
        for block in 0..blocks {
            rows.push(self.read_block(config, head, block)?);
        }
        let table = SettingsTable::from_blocks(rows);
        info!("Refreshed settings of config {} head {}", config, head);
        self.cache.store_trusted(config, head, table.clone());
        self.persist(config, head);
        Ok(table)
    }

    /// Reads one block, retrying the same command on a checksum mismatch.
    fn read_block(&mut self, config: u8, head: u8, block: u16) -> Result<BlockSettings, DhiError> {
        let cmd = Command::new(head, Verb::GetAnalog).arg(config).arg(block);
        let retries = self.config.retry.checksum_retries;
        let mut attempt = 0;
        loop {
            let r = self.transact(&cmd)?;
            r.require_fields(NUM_SETTINGS + 2)?;
            let echoed: u16 = r.field(0, "block")?;
            if echoed != block {
                return Err(DhiError::Parse(format!(
                    "asked for block {}, head {} sent block {}",
                    block, head, echoed
                )));
            }
            let mut values: BlockSettings = [0; NUM_SETTINGS];
            for (i, slot) in values.iter_mut().enumerate() {
                *slot = r.field(i + 1, "setting")?;
            }
            let reported: u32 = r.field(NUM_SETTINGS + 1, "block checksum")?;
            let computed = settings_sum(values.iter());
            if reported == computed {
                return Ok(values);
            }
            if attempt >= retries {
                self.cache.invalidate(config, head);
                return Err(DhiError::Checksum {
                    expected: reported,
                    actual: computed,
                });
            }
            attempt += 1;
            warn!(
                "Block {} of head {}: checksum {:#X} != {:#X}, retry {}/{}",
                block, head, computed, reported, attempt, retries
            );
        }
    }

    fn persist(&self, config: u8, head: u8) {
        let (Some(dir), Some(table)) = (&self.config.settings_dir, self.cache.table(config, head))
        else {
            return;
        };
        if let Err(e) = save_snapshot(dir, config, head, table) {
            warn!("Settings snapshot of config {} head {} not saved: {}", config, head, e);
        }
    }
}

fn setting_command(config: u8, head: u8, write: &SettingWrite) -> Command {
    let cmd = Command::new(head, Verb::SetAnalog).arg(config);
    match *write {
        SettingWrite::Broadcast { setting, value } => {
            cmd.arg(ALL_BLOCKS).arg(setting.index()).arg(value)
        }
        SettingWrite::Gains { block, values } => {
            let cmd = cmd.arg(block).arg(GAIN_GROUP_INDEX);
            values.iter().fold(cmd, |cmd, v| cmd.arg(v))
        }
        SettingWrite::Single {
            block,
            setting,
            value,
        } => cmd.arg(block).arg(setting.index()).arg(value),
    }
}
