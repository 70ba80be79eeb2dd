//! Interchangeable links to the scanner electronics.
//!
//! Every backend moves one command line to a head and brings back the
//! next line addressed to the host. Correlation, retries and device
//! error handling live in the controller, so callers never branch on
//! the backend in use.

pub mod network;
pub mod serial;
pub mod sim;

use crate::config::LinkConfig;
use crate::error::DhiError;
use crate::geometry::ScannerModel;
use crate::protocol::{AsyncNotice, Command};
use std::time::Duration;

pub use network::{NetworkLink, RemoteService};
pub use serial::{LineAssembler, SerialLink};
pub use sim::SimulatedScanner;

pub trait Transport: Send {
    /// Sends `command` and waits up to `timeout` for the response line.
    fn exchange(&self, command: &Command, timeout: Duration) -> Result<String, DhiError>;

    /// Consumes the most recent unsolicited message, if any.
    fn take_async(&self) -> Option<AsyncNotice>;

    /// Unsolicited device errors received since the last call.
    fn drain_async_errors(&self) -> Vec<AsyncNotice>;

    fn describe(&self) -> String;
}

/// Opens the backend named by `link`.
pub fn open(link: &LinkConfig, model: &ScannerModel) -> Result<Box<dyn Transport>, DhiError> {
    let transport: Box<dyn Transport> = match link {
        LinkConfig::Serial { port, baud } => Box::new(SerialLink::open(port, *baud)?),
        LinkConfig::Network { address } => Box::new(NetworkLink::connect(address)?),
        LinkConfig::Simulation(sim) => Box::new(SimulatedScanner::new(model, sim)),
    };
    Ok(transport)
}
