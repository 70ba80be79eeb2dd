//! The controller: one object owning the link, the settings cache, the
//! head-mode tracker and the error table, with one method per logical
//! scanner operation.
//!
//! Every operation takes `&mut self`, so hardware access is serialized
//! through the single transport and the shared tables need no locking.

mod calibration;
mod hardware;
mod modes;
mod query;
mod settings;

pub use calibration::CalibrationReport;
pub use query::{CountRate, HeadHealth, Progress, Statistics, Voltages};

use crate::config::ControllerConfig;
use crate::errlog::ErrorLog;
use crate::error::{DeviceCode, DhiError, ErrorClass, OpError, OpResult};
use crate::geometry::{Geometry, HeadSel};
use crate::modes::{CoincidenceMode, HeadModeTracker, ModeState};
use crate::protocol::{AsyncNotice, AsyncPayload, Command, Response, Verb, CP_ADDRESS};
use crate::settings::{load_snapshot, SettingsCache};
use crate::transport::{self, Transport};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Instant;

pub struct Controller {
    geometry: Geometry,
    transport: Box<dyn Transport>,
    config: ControllerConfig,
    cache: SettingsCache,
    modes: HeadModeTracker,
    cp_mode: Option<CoincidenceMode>,
    errors: ErrorLog,
    link_logging: bool,
}

impl Controller {
    /// Validates `config` and opens the link it names.
    pub fn new(config: ControllerConfig) -> Result<Self, DhiError> {
        config.validate()?;
        let transport = transport::open(&config.link, &config.scanner)?;
        Self::with_transport(config, transport)
    }

    /// Builds a controller on an already opened transport.
    pub fn with_transport(
        config: ControllerConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, DhiError> {
        config.validate()?;
        let geometry = Geometry::new(config.scanner.clone());
        geometry.configuration(config.configuration)?;
        info!(
            "Controller on {}: {} heads x {} blocks, configuration {}",
            transport.describe(),
            geometry.heads().len(),
            geometry.blocks(),
            config.configuration
        );
        let mut controller = Controller {
            modes: HeadModeTracker::new(geometry.heads().len()),
            errors: ErrorLog::new(config.error_capacity, config.error_log.clone()),
            cache: SettingsCache::new(),
            cp_mode: None,
            link_logging: false,
            geometry,
            transport,
            config,
        };
        controller.warm_start();
        Ok(controller)
    }

    /// Loads any settings snapshots as untrusted starting points.
    fn warm_start(&mut self) {
        let Some(dir) = self.config.settings_dir.clone() else {
            return;
        };
        let blocks = self.geometry.blocks();
        for config in 0..self.geometry.configurations().len() as u8 {
            for head in 0..self.geometry.heads().len() as u8 {
                match load_snapshot(&dir, config, head, blocks) {
                    Ok(Some(table)) => self.cache.store_untrusted(config, head, table),
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring snapshot for config {} head {}: {}", config, head, e),
                }
            }
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Configuration index selected at start of day.
    pub fn configuration(&self) -> u8 {
        self.config.configuration
    }

    /// Rolling table of recent errors.
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Mode the controller believes `head` is in.
    pub fn head_mode(&self, head: u8) -> Option<ModeState> {
        self.modes.get(head)
    }

    pub fn coincidence_mode(&self) -> Option<CoincidenceMode> {
        self.cp_mode
    }

    /// Switches wire tracing between `info!` and `trace!`.
    pub fn set_logging(&mut self, on: bool) {
        info!("Link logging {}", if on { "on" } else { "off" });
        self.link_logging = on;
    }

    pub fn logging(&self) -> bool {
        self.link_logging
    }

    /// Consumes the latest unsolicited message.
    pub fn take_async(&mut self) -> Option<AsyncNotice> {
        self.collect_async_errors();
        self.transport.take_async()
    }

    /// Runs `f` as operation `op`, recording any failure in the error table.
    pub(crate) fn run<T, F>(&mut self, op: &'static str, head: Option<u8>, f: F) -> OpResult<T>
    where
        F: FnOnce(&mut Self) -> Result<T, DhiError>,
    {
        f(self).map_err(|source| {
            let err = OpError { op, head, source };
            self.errors.record_op(&err);
            err
        })
    }

    /// Runs `f` on each selected head in order, stopping at the first
    /// failure. The error names the head that failed.
    pub(crate) fn run_each<T, F>(&mut self, op: &'static str, heads: HeadSel, mut f: F) -> OpResult<Vec<T>>
    where
        F: FnMut(&mut Self, u8) -> Result<T, DhiError>,
    {
        let targets = self.run(op, heads.single(), |c| c.geometry.expand(heads))?;
        let mut results = Vec::with_capacity(targets.len());
        for head in targets {
            results.push(self.run(op, Some(head), |c| f(c, head))?);
        }
        Ok(results)
    }

    /// Records an error that did not stop `op`.
    pub(crate) fn note_error(&mut self, op: &'static str, head: Option<u8>, source: DhiError) {
        let err = OpError { op, head, source };
        self.errors.record_op(&err);
    }

    pub(crate) fn check_head(&self, head: u8) -> Result<(), DhiError> {
        self.geometry.head(head).map(|_| ())
    }

    /// Sends one command and returns its correlated, successful response.
    ///
    /// Bus conflicts are retried with a backoff until the total budget is
    /// spent. A response for another head or verb is retried a bounded
    /// number of times. A plain timeout is returned as is.
    pub(crate) fn transact(&mut self, cmd: &Command) -> Result<Response, DhiError> {
        let policy = self.config.retry.clone();
        let started = Instant::now();
        let mut mismatches = 0;
        let mut conflicts = 0;
        loop {
            self.collect_async_errors();
            let remaining = policy.total_timeout().saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(DhiError::RetryExhausted {
                    attempts: conflicts + mismatches,
                    last: format!("{}: bus busy for {:?}", cmd, policy.total_timeout()),
                });
            }
            self.trace_line(cmd.head(), '>', &cmd.text());
            let line = match self.transport.exchange(cmd, policy.attempt_timeout().min(remaining)) {
                Ok(line) => line,
                Err(DhiError::BusConflict(noise)) => {
                    conflicts += 1;
                    warn!("Bus conflict on {} ({:?}), retry {}", cmd, noise, conflicts);
                    thread::sleep(policy.bus_backoff().min(remaining));
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.trace_line(cmd.head(), '<', &line);
            let mismatch = match Response::parse(&line) {
                Ok(response) if response.answers(cmd) => return response.into_result(),
                Ok(response) => format!(
                    "{} answered by {}{}",
                    cmd,
                    response.head,
                    response.verb.letter()
                ),
                Err(e) => format!("{}: {}", cmd, e),
            };
            mismatches += 1;
            if mismatches > policy.correlation_retries {
                return Err(DhiError::RetryExhausted {
                    attempts: mismatches,
                    last: mismatch,
                });
            }
            warn!("Uncorrelated response, resending: {}", mismatch);
        }
    }

    /// Polls progress until the long operation on `head` completes.
    ///
    /// A negative final status becomes a device error; the caller decides
    /// whether it is benign.
    pub(crate) fn wait_for_completion(&mut self, head: u8) -> Result<(), DhiError> {
        let interval = self.config.retry.progress_interval();
        let limit = self.config.retry.progress_limit();
        let started = Instant::now();
        loop {
            let progress = self.read_progress(head)?;
            if progress.percent >= 100 {
                if progress.status < 0 {
                    return Err(DhiError::device(head, progress.status));
                }
                return Ok(());
            }
            debug!(
                "Head {}: {}% done, {} s left",
                head, progress.percent, progress.remaining_s
            );
            if started.elapsed() >= limit {
                return Err(DhiError::Timeout(limit));
            }
            thread::sleep(interval);
        }
    }

    /// Moves unsolicited device errors into the error table.
    fn collect_async_errors(&mut self) {
        for notice in self.transport.drain_async_errors() {
            if let AsyncPayload::Error(code) = notice.payload {
                let err = DhiError::device(notice.head.unwrap_or(CP_ADDRESS), code);
                let fatal = DeviceCode::from_code(code).class() == ErrorClass::Fatal;
                self.errors
                    .record(code, err.kind(), notice.head, fatal, format!("async: {}", err));
            }
        }
    }

    fn trace_line(&self, head: u8, direction: char, text: &str) {
        if self.link_logging {
            info!("h{} {} {}", head, direction, text);
        } else {
            trace!("h{} {} {}", head, direction, text);
        }
    }

    /// Forgets mode and settings trust after something reset `head`.
    pub(crate) fn forget_head(&mut self, head: u8) {
        self.modes.forget(head);
        self.cache.invalidate_head(head);
    }

    pub(crate) fn cp_command(&self, verb: Verb) -> Command {
        Command::new(CP_ADDRESS, verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, SimulationConfig};
    use crate::error::ErrorKind;
    use crate::geometry::ScannerModel;
    use crate::transport::SimulatedScanner;

    fn setup() -> (Controller, SimulatedScanner) {
        let config = ControllerConfig {
            scanner: ScannerModel::Ring {
                heads: 4,
                blocks: 8,
                layers: 1,
                point_source: true,
            },
            retry: RetryPolicy {
                bus_backoff_ms: 1,
                progress_interval_ms: 5,
                ..RetryPolicy::default()
            },
            ..ControllerConfig::default()
        };
        let sim = SimulatedScanner::new(
            &config.scanner,
            &SimulationConfig {
                latency_ms: 0,
                file_delay_ms: 0,
                operation_ms: 20,
            },
        );
        let controller = Controller::with_transport(config, Box::new(sim.clone())).unwrap();
        (controller, sim)
    }

    #[test]
    fn test_transact_retries_bus_conflicts() {
        let (mut c, sim) = setup();
        sim.garble_next(2);
        let r = c.transact(&Command::new(1, Verb::Voltage)).unwrap();
        assert_eq!(r.head, 1);
        assert_eq!(sim.exchanges(), 3);
    }

    #[test]
    fn test_transact_retries_misrouted_then_gives_up() {
        let (mut c, sim) = setup();
        sim.misroute_next(1);
        assert!(c.transact(&Command::new(1, Verb::Voltage)).is_ok());

        sim.clear_commands();
        sim.misroute_next(10);
        let err = c.transact(&Command::new(1, Verb::Voltage)).unwrap_err();
        assert!(matches!(err, DhiError::RetryExhausted { attempts: 4, .. }));
        assert_eq!(sim.exchanges(), 4);
        assert_ne!(err.code(), DhiError::Timeout(Default::default()).code());
    }

    #[test]
    fn test_timeout_is_not_retried() {
        let (mut c, sim) = setup();
        sim.silence_head(2, true);
        let err = c.transact(&Command::new(2, Verb::Voltage)).unwrap_err();
        assert!(matches!(err, DhiError::Timeout(_)));
        assert_eq!(sim.exchanges(), 1);
    }

    #[test]
    fn test_run_records_failure_with_operation_name() {
        let (mut c, _sim) = setup();
        let result: OpResult<()> = c.run("sample_op", Some(3), |_| Err(DhiError::argument("nope")));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        let entry = c.errors().last().unwrap();
        assert!(entry.message.contains("sample_op (head 3)"));
        assert!(entry.fatal);
    }

    #[test]
    fn test_async_errors_land_in_error_table() {
        let (mut c, sim) = setup();
        sim.push_async(AsyncNotice {
            head: Some(2),
            payload: AsyncPayload::Error(-8),
        });
        sim.push_async(AsyncNotice {
            head: Some(1),
            payload: AsyncPayload::Message("door open".into()),
        });
        let notice = c.take_async().unwrap();
        assert_eq!(notice.payload, AsyncPayload::Message("door open".into()));
        assert!(c.take_async().is_none());
        let entry = c.errors().last().unwrap();
        assert_eq!(entry.code, -8);
        assert_eq!(entry.head, Some(2));
    }

    #[test]
    fn test_progress_wait() {
        let (mut c, _sim) = setup();
        c.transact(&Command::new(0, Verb::Zap).arg(0).arg(3)).unwrap();
        c.wait_for_completion(0).unwrap();
    }
}
