//! # libdhi
//!
//! This crate operates the detector head electronics of a PET scanner. One
//! [`Controller`] turns logical operations (mode changes, settings
//! read-back, calibrations, file transfer) into the heads' line protocol
//! and sends them over a serial bus, a remote gantry service or a
//! simulated scanner, without callers knowing which.
//!
//! The controller remembers the last mode set on each head so redundant
//! mode commands are skipped, and caches per-block analog settings that
//! are trusted only while a device checksum confirms them.
//!
//! ```no_run
//! use libdhi::{Controller, ControllerConfig, EnergyWindow, HeadMode, ALL_BLOCKS};
//!
//! let config = ControllerConfig::load("dhi.toml".as_ref())?;
//! let mut controller = Controller::new(config)?;
//! let window = EnergyWindow::new(250, 700)?;
//! controller.ensure_mode(2, HeadMode::Run, ALL_BLOCKS, window)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod controller;
pub mod errlog;
pub mod error;
pub mod geometry;
pub mod modes;
pub mod protocol;
pub mod settings;
pub mod transfer;
pub mod transport;

pub use config::{ControllerConfig, LinkConfig, RetryPolicy, SimulationConfig};
pub use controller::{
    CalibrationReport, Controller, CountRate, HeadHealth, Progress, Statistics, Voltages,
};
pub use errlog::{ErrorEntry, ErrorLog};
pub use error::{DeviceCode, DhiError, ErrorClass, ErrorKind, OpError, OpResult, Outcome};
pub use geometry::{Geometry, HeadSel, ScannerModel};
pub use modes::{CoincidenceMode, EnergyWindow, HeadMode, ModeState};
pub use protocol::{AsyncNotice, AsyncPayload, ALL_BLOCKS, CP_ADDRESS};
pub use settings::{Setting, SettingsTable};
pub use transport::{NetworkLink, RemoteService, SerialLink, SimulatedScanner, Transport};
