#![allow(dead_code)]

use libdhi::{
    Controller, ControllerConfig, LinkConfig, RetryPolicy, ScannerModel, SimulatedScanner,
    SimulationConfig,
};

pub const HEADS: u8 = 4;
pub const BLOCKS: u16 = 8;

pub fn model() -> ScannerModel {
    ScannerModel::Ring {
        heads: HEADS,
        blocks: BLOCKS,
        layers: 1,
        point_source: true,
    }
}

pub fn timing() -> SimulationConfig {
    SimulationConfig {
        latency_ms: 0,
        file_delay_ms: 0,
        operation_ms: 20,
    }
}

pub fn config() -> ControllerConfig {
    ControllerConfig {
        scanner: model(),
        link: LinkConfig::Simulation(timing()),
        retry: RetryPolicy {
            bus_backoff_ms: 1,
            progress_interval_ms: 5,
            ..RetryPolicy::default()
        },
        ..ControllerConfig::default()
    }
}

/// A controller driving a simulated scanner, plus a handle on the
/// simulation for fault injection and inspection.
pub fn setup_with(config: ControllerConfig, timing: SimulationConfig) -> (Controller, SimulatedScanner) {
    let sim = SimulatedScanner::new(&config.scanner, &timing);
    let controller = Controller::with_transport(config, Box::new(sim.clone())).unwrap();
    (controller, sim)
}

pub fn setup() -> (Controller, SimulatedScanner) {
    setup_with(config(), timing())
}

pub fn count(sim: &SimulatedScanner, command: &str) -> usize {
    sim.commands().iter().filter(|c| c.as_str() == command).count()
}
