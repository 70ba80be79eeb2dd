//! Static scanner geometry: heads, blocks and electronic configurations.

use crate::error::DhiError;
use crate::protocol::ALL_BLOCKS;
use serde::Deserialize;

/// Scanner family, selected once when the controller is configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScannerModel {
    /// Eight-head octagonal research tomograph.
    Hrrt,
    /// Generic ring of identical heads, mostly useful for tests and bench setups.
    Ring {
        heads: u8,
        blocks: u16,
        layers: u8,
        #[serde(default)]
        point_source: bool,
    },
}

impl Default for ScannerModel {
    fn default() -> Self {
        ScannerModel::Hrrt
    }
}

impl ScannerModel {
    pub fn head_count(&self) -> u8 {
        match self {
            ScannerModel::Hrrt => 8,
            ScannerModel::Ring { heads, .. } => *heads,
        }
    }

    pub fn blocks_per_head(&self) -> u16 {
        match self {
            ScannerModel::Hrrt => 117,
            ScannerModel::Ring { blocks, .. } => *blocks,
        }
    }

    pub fn layers(&self) -> u8 {
        match self {
            ScannerModel::Hrrt => 2,
            ScannerModel::Ring { layers, .. } => *layers,
        }
    }

    pub fn point_source(&self) -> bool {
        match self {
            ScannerModel::Hrrt => true,
            ScannerModel::Ring { point_source, .. } => *point_source,
        }
    }

    /// Energy setup value per configuration index.
    pub fn energy_setups(&self) -> &'static [i32] {
        match self {
            ScannerModel::Hrrt => &[511, 511, 662, 140],
            ScannerModel::Ring { .. } => &[511, 662],
        }
    }
}

/// One detector head on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub address: u8,
    pub present: bool,
    pub blocks: u16,
    pub layers: u8,
    pub point_source: bool,
}

/// A selectable electronic operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub index: u8,
    pub energy_setup: i32,
}

/// Head selector used by operations that accept the "all heads" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadSel {
    One(u8),
    All,
}

impl HeadSel {
    /// The one head named, `None` for all heads.
    pub fn single(self) -> Option<u8> {
        match self {
            HeadSel::One(head) => Some(head),
            HeadSel::All => None,
        }
    }
}

impl From<u8> for HeadSel {
    fn from(head: u8) -> Self {
        HeadSel::One(head)
    }
}

#[derive(Debug, Clone)]
pub struct Geometry {
    model: ScannerModel,
    heads: Vec<Head>,
    configurations: Vec<Configuration>,
}

impl Geometry {
    pub fn new(model: ScannerModel) -> Self {
        let heads = (0..model.head_count())
            .map(|address| Head {
                address,
                present: true,
                blocks: model.blocks_per_head(),
                layers: model.layers(),
                point_source: model.point_source(),
            })
            .collect();
        let configurations = model
            .energy_setups()
            .iter()
            .enumerate()
            .map(|(i, &energy_setup)| Configuration {
                index: i as u8,
                energy_setup,
            })
            .collect();
        Geometry {
            model,
            heads,
            configurations,
        }
    }

    pub fn model(&self) -> &ScannerModel {
        &self.model
    }

    pub fn heads(&self) -> &[Head] {
        &self.heads
    }

    pub fn blocks(&self) -> u16 {
        self.model.blocks_per_head()
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn present_heads(&self) -> Vec<u8> {
        self.heads
            .iter()
            .filter(|h| h.present)
            .map(|h| h.address)
            .collect()
    }

    /// Expands a selector into concrete, present head addresses.
    pub fn expand(&self, sel: HeadSel) -> Result<Vec<u8>, DhiError> {
        match sel {
            HeadSel::One(head) => {
                self.head(head)?;
                Ok(vec![head])
            }
            HeadSel::All => Ok(self.present_heads()),
        }
    }

    /// Looks up a head, failing for unknown or absent addresses.
    pub fn head(&self, address: u8) -> Result<&Head, DhiError> {
        let head = self.heads.get(address as usize).ok_or_else(|| {
            DhiError::argument(format!(
                "head {} out of range 0..{}",
                address,
                self.heads.len()
            ))
        })?;
        if !head.present {
            return Err(DhiError::argument(format!("head {} is not present", address)));
        }
        Ok(head)
    }

    pub(crate) fn mark_absent(&mut self, address: u8) {
        if let Some(head) = self.heads.get_mut(address as usize) {
            head.present = false;
        }
    }

    pub(crate) fn mark_present(&mut self, address: u8) {
        if let Some(head) = self.heads.get_mut(address as usize) {
            head.present = true;
        }
    }

    pub fn configuration(&self, index: u8) -> Result<Configuration, DhiError> {
        self.configurations
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                DhiError::argument(format!(
                    "configuration {} out of range 0..{}",
                    index,
                    self.configurations.len()
                ))
            })
    }

    /// Accepts a real block number or the all-blocks sentinel.
    pub fn check_block(&self, block: u16) -> Result<(), DhiError> {
        if block == ALL_BLOCKS || block < self.blocks() {
            Ok(())
        } else {
            Err(DhiError::argument(format!(
                "block {} out of range 0..{}",
                block,
                self.blocks()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrrt_geometry() {
        let g = Geometry::new(ScannerModel::Hrrt);
        assert_eq!(g.heads().len(), 8);
        assert_eq!(g.blocks(), 117);
        assert_eq!(g.configurations().len(), 4);
        assert!(g.head(7).is_ok());
        assert!(g.head(8).is_err());
        assert!(g.check_block(ALL_BLOCKS).is_ok());
        assert!(g.check_block(117).is_err());
    }

    #[test]
    fn test_expand_skips_absent_heads() {
        let mut g = Geometry::new(ScannerModel::Ring {
            heads: 4,
            blocks: 8,
            layers: 1,
            point_source: false,
        });
        g.mark_absent(1);
        assert_eq!(g.expand(HeadSel::All).unwrap(), vec![0, 2, 3]);
        assert!(g.expand(HeadSel::One(1)).is_err());
        g.mark_present(1);
        assert_eq!(g.expand(1.into()).unwrap(), vec![1]);
    }
}
