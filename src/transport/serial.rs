//! Multi-drop serial line owned by one background listener thread.
//!
//! The listener writes at most one command at a time, assembles the
//! incoming characters into lines and hands each line to whoever is
//! waiting for it: the caller of the in-flight command, the single-slot
//! async mailbox, or the async error channel.

use crate::error::DhiError;
use crate::protocol::{
    classify_line, AsyncNotice, AsyncPayload, Command, Line, Verb, LINE_TERMINATOR,
};
use crate::transport::Transport;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};
use std::io::{self, Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Silence between characters after which a partial line is dropped.
pub const IDLE_GAP: Duration = Duration::from_secs(1);
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_LINE_LEN: usize = 4096;
/// Extra time the caller waits beyond the listener's own deadline.
const REPLY_GRACE: Duration = Duration::from_millis(500);

/// Accumulates characters into lines, discarding stale partial input.
#[derive(Debug)]
pub struct LineAssembler {
    buf: String,
    last_char: Option<Instant>,
    idle_gap: Duration,
}

impl LineAssembler {
    pub fn new(idle_gap: Duration) -> Self {
        LineAssembler {
            buf: String::new(),
            last_char: None,
            idle_gap,
        }
    }

    /// Feeds one received byte; returns a line when a terminator completes it.
    pub fn push(&mut self, byte: u8, now: Instant) -> Option<String> {
        self.expire(now);
        self.last_char = Some(now);
        match byte {
            b'\r' | b'\n' => {
                if self.buf.trim().is_empty() {
                    self.buf.clear();
                    None
                } else {
                    Some(std::mem::take(&mut self.buf))
                }
            }
            _ => {
                if self.buf.len() >= MAX_LINE_LEN {
                    warn!("Discarding overlong line of {} bytes", self.buf.len());
                    self.buf.clear();
                }
                self.buf.push(if byte.is_ascii() { byte as char } else { '\u{FFFD}' });
                None
            }
        }
    }

    /// Drops the partial line if the idle gap elapsed since its last character.
    pub fn expire(&mut self, now: Instant) {
        if let Some(last) = self.last_char {
            if !self.buf.is_empty() && now.duration_since(last) > self.idle_gap {
                debug!("Discarding partial line after idle gap: {:?}", self.buf);
                self.buf.clear();
            }
        }
    }

    pub fn pending(&self) -> &str {
        &self.buf
    }
}

struct Request {
    line: String,
    head: u8,
    verb: Verb,
    timeout: Duration,
    reply: Sender<Result<String, DhiError>>,
}

struct InFlight {
    head: u8,
    verb: Verb,
    deadline: Instant,
    timeout: Duration,
    reply: Sender<Result<String, DhiError>>,
}

/// Serial backend. Commands go through a channel to the listener thread,
/// which owns the port for the lifetime of the link.
pub struct SerialLink {
    name: String,
    request_tx: Option<Sender<Request>>,
    mailbox_rx: Receiver<AsyncNotice>,
    async_err_rx: Receiver<AsyncNotice>,
    stop_signal: Arc<AtomicBool>,
    listener_thread: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open a serial port and start the listener thread.
    ///
    /// # Errors
    /// Returns [`DhiError`] if the port cannot be opened.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, DhiError> {
        info!("Opening serial port: {} at {} baud", port_name, baud_rate);
        let port = serialport::new(port_name, baud_rate)
            .timeout(PORT_READ_TIMEOUT)
            .open()?;
        info!("Serial port opened successfully.");
        Self::spawn(port, port_name)
    }

    /// Starts the listener on any byte stream that behaves like a port
    /// with a short read timeout.
    pub fn spawn<P>(port: P, name: &str) -> Result<Self, DhiError>
    where
        P: Read + Write + Send + 'static,
    {
        let (request_tx, request_rx) = unbounded();
        let (mailbox_tx, mailbox_rx) = bounded(1);
        let (async_err_tx, async_err_rx) = unbounded();
        let stop_signal = Arc::new(AtomicBool::new(false));

        let listener = Listener {
            port,
            request_rx,
            mailbox_tx,
            mailbox_drain: mailbox_rx.clone(),
            async_err_tx,
            stop_signal: Arc::clone(&stop_signal),
            assembler: LineAssembler::new(IDLE_GAP),
            in_flight: None,
        };
        let listener_thread = thread::Builder::new()
            .name(format!("dhi-listener-{}", name))
            .spawn(move || listener.run())
            .map_err(|e| DhiError::Resource(format!("cannot spawn listener: {}", e)))?;

        Ok(SerialLink {
            name: name.to_string(),
            request_tx: Some(request_tx),
            mailbox_rx,
            async_err_rx,
            stop_signal,
            listener_thread: Some(listener_thread),
        })
    }

    /// Stop the listener thread and close the port.
    pub fn stop(&mut self) -> Result<(), DhiError> {
        info!("Stopping serial link {}...", self.name);
        self.stop_signal.store(true, Ordering::Relaxed);
        self.request_tx.take();
        if let Some(handle) = self.listener_thread.take() {
            if handle.join().is_err() {
                return Err(DhiError::ThreadComm("Listener thread panicked".to_string()));
            }
        }
        info!("Serial link {} stopped.", self.name);
        Ok(())
    }
}

impl Transport for SerialLink {
    fn exchange(&self, command: &Command, timeout: Duration) -> Result<String, DhiError> {
        let request_tx = self
            .request_tx
            .as_ref()
            .ok_or_else(|| DhiError::ThreadComm("Serial link stopped".to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        request_tx
            .send(Request {
                line: format!("{}{}", command, LINE_TERMINATOR),
                head: command.head(),
                verb: command.verb(),
                timeout,
                reply: reply_tx,
            })
            .map_err(|_| DhiError::ThreadComm("Listener thread disconnected".to_string()))?;

        match reply_rx.recv_timeout(timeout + REPLY_GRACE) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DhiError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DhiError::ThreadComm(
                "Listener thread dropped the request".to_string(),
            )),
        }
    }

    fn take_async(&self) -> Option<AsyncNotice> {
        self.mailbox_rx.try_recv().ok()
    }

    fn drain_async_errors(&self) -> Vec<AsyncNotice> {
        self.async_err_rx.try_iter().collect()
    }

    fn describe(&self) -> String {
        format!("serial {}", self.name)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.listener_thread.is_some() {
            if let Err(e) = self.stop() {
                error!("Error stopping listener thread during drop: {:?}", e);
            }
        }
    }
}

struct Listener<P> {
    port: P,
    request_rx: Receiver<Request>,
    mailbox_tx: Sender<AsyncNotice>,
    mailbox_drain: Receiver<AsyncNotice>,
    async_err_tx: Sender<AsyncNotice>,
    stop_signal: Arc<AtomicBool>,
    assembler: LineAssembler,
    in_flight: Option<InFlight>,
}

impl<P: Read + Write> Listener<P> {
    fn run(mut self) {
        info!("Listener thread started.");
        let mut read_buf = [0u8; 64];

        while !self.stop_signal.load(Ordering::Relaxed) {
            if self.in_flight.is_none() {
                match self.request_rx.try_recv() {
                    Ok(request) => self.write_request(request),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        debug!("All senders gone. Exiting listener thread.");
                        break;
                    }
                }
            }

            match self.port.read(&mut read_buf) {
                Ok(0) => {}
                Ok(n) => {
                    let now = Instant::now();
                    for &byte in &read_buf[..n] {
                        if let Some(line) = self.assembler.push(byte, now) {
                            self.dispatch_line(&line);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("Error reading from serial port: {}", e);
                    self.fail_in_flight(DhiError::Io(e));
                    if self.stop_signal.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(PORT_READ_TIMEOUT);
                }
            }

            let now = Instant::now();
            self.assembler.expire(now);
            if let Some(in_flight) = &self.in_flight {
                if now >= in_flight.deadline {
                    warn!("No response from head {} within {:?}", in_flight.head, in_flight.timeout);
                    let timeout = in_flight.timeout;
                    self.fail_in_flight(DhiError::Timeout(timeout));
                }
            }
        }
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight
                .reply
                .send(Err(DhiError::ThreadComm("Serial link stopped".to_string())));
        }
        info!("Listener thread finished.");
    }

    fn write_request(&mut self, request: Request) {
        debug!("Writing {:?}", request.line.trim_end());
        let written = self
            .port
            .write_all(request.line.as_bytes())
            .and_then(|_| self.port.flush());
        match written {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    head: request.head,
                    verb: request.verb,
                    deadline: Instant::now() + request.timeout,
                    timeout: request.timeout,
                    reply: request.reply,
                });
            }
            Err(e) => {
                error!("Error writing to serial port: {}", e);
                let _ = request.reply.send(Err(DhiError::Io(e)));
            }
        }
    }

    fn dispatch_line(&mut self, line: &str) {
        match classify_line(line) {
            Line::Async(notice) => match notice.payload {
                AsyncPayload::Error(code) => {
                    error!("Async error {} from head {:?}", code, notice.head);
                    let _ = self.async_err_tx.send(notice);
                }
                AsyncPayload::Message(ref text) => {
                    debug!("Async notice from head {:?}: {}", notice.head, text);
                    while self.mailbox_drain.try_recv().is_ok() {}
                    let _ = self.mailbox_tx.try_send(notice);
                }
            },
            Line::Response(response) => match self.in_flight.take() {
                Some(in_flight)
                    if response.head == in_flight.head && response.verb == in_flight.verb =>
                {
                    if in_flight.reply.send(Ok(line.trim().to_string())).is_err() {
                        debug!("Caller gave up before response {:?} arrived", line);
                    }
                }
                Some(in_flight) => {
                    // A late answer to an earlier command; keep waiting for ours.
                    warn!(
                        "Discarding {:?} while waiting for {}{}",
                        line,
                        in_flight.head,
                        in_flight.verb.letter()
                    );
                    self.in_flight = Some(in_flight);
                }
                None => warn!("Discarding unsolicited response {:?}", line),
            },
            Line::Garbage(text) => {
                if self.in_flight.is_some() {
                    warn!("Garbled line while waiting for response: {:?}", text);
                    self.fail_in_flight(DhiError::BusConflict(text));
                } else {
                    debug!("Discarding garbage {:?}", text);
                }
            }
        }
    }

    fn fail_in_flight(&mut self, err: DhiError) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.reply.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory port: each written line is answered by `responder`.
    struct ScriptedPort {
        incoming: Arc<Mutex<VecDeque<u8>>>,
        pending: Vec<u8>,
        responder: fn(&str) -> Vec<String>,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.lock().unwrap();
            if incoming.is_empty() {
                drop(incoming);
                thread::sleep(Duration::from_millis(2));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = incoming.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            let text = String::from_utf8_lossy(&self.pending).trim().to_string();
            self.pending.clear();
            let mut incoming = self.incoming.lock().unwrap();
            for reply in (self.responder)(&text) {
                incoming.extend(reply.bytes());
            }
            Ok(())
        }
    }

    fn link(responder: fn(&str) -> Vec<String>) -> (SerialLink, Arc<Mutex<VecDeque<u8>>>) {
        let incoming = Arc::new(Mutex::new(VecDeque::new()));
        let port = ScriptedPort {
            incoming: Arc::clone(&incoming),
            pending: Vec::new(),
            responder,
        };
        (SerialLink::spawn(port, "test").unwrap(), incoming)
    }

    #[test]
    fn test_idle_gap_discards_partial_line() {
        let mut asm = LineAssembler::new(IDLE_GAP);
        let t0 = Instant::now();
        for b in b"2Q 0 12" {
            assert!(asm.push(*b, t0).is_none());
        }
        let later = t0 + IDLE_GAP + Duration::from_millis(10);
        let mut line = None;
        for b in b"3Q 1 0 0 5 250 700\n" {
            line = line.or(asm.push(*b, later));
        }
        assert_eq!(line.as_deref(), Some("3Q 1 0 0 5 250 700"));
    }

    #[test]
    fn test_short_gap_keeps_partial_line() {
        let mut asm = LineAssembler::new(IDLE_GAP);
        let t0 = Instant::now();
        for b in b"2Q 0" {
            asm.push(*b, t0);
        }
        let soon = t0 + Duration::from_millis(200);
        let mut line = None;
        for b in b" 12\r\n" {
            line = line.or(asm.push(*b, soon));
        }
        assert_eq!(line.as_deref(), Some("2Q 0 12"));
        assert_eq!(asm.pending(), "");
    }

    #[test]
    fn test_exchange_and_async_routing() {
        let (link, _) = link(|cmd| {
            if cmd.starts_with("2Q") {
                vec![
                    "2!scan started\r\n".to_string(),
                    "2! -8 hv trip\r\n".to_string(),
                    "2Q 0 1 4 250 700\r\n".to_string(),
                ]
            } else {
                vec![]
            }
        });
        let cmd = Command::new(2, Verb::Query).arg(1);
        let line = link.exchange(&cmd, Duration::from_secs(2)).unwrap();
        assert_eq!(line, "2Q 0 1 4 250 700");

        let notice = link.take_async().unwrap();
        assert_eq!(notice.payload, AsyncPayload::Message("scan started".into()));
        assert!(link.take_async().is_none());

        let errors = link.drain_async_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload, AsyncPayload::Error(-8));
    }

    #[test]
    fn test_stale_response_from_other_head_is_skipped() {
        let (link, _) = link(|cmd| {
            if cmd.starts_with("2A") {
                vec![
                    "1A 300 0 5000 -5000 24000\r\n".to_string(),
                    "2Q 0 0 0 0\r\n".to_string(),
                    "2A 312 0 5012 -4987 24050\r\n".to_string(),
                ]
            } else {
                vec![]
            }
        });
        let line = link
            .exchange(&Command::new(2, Verb::Voltage), Duration::from_secs(2))
            .unwrap();
        assert_eq!(line, "2A 312 0 5012 -4987 24050");
    }

    #[test]
    fn test_mailbox_keeps_only_latest() {
        let (link, _) = link(|_| {
            vec![
                "1!first\r\n".to_string(),
                "1!second\r\n".to_string(),
                "1P 100 0 0\r\n".to_string(),
            ]
        });
        link.exchange(&Command::new(1, Verb::Progress), Duration::from_secs(2))
            .unwrap();
        let notice = link.take_async().unwrap();
        assert_eq!(notice.payload, AsyncPayload::Message("second".into()));
    }

    #[test]
    fn test_timeout_and_bus_conflict() {
        let (link, _) = link(|cmd| {
            if cmd.starts_with("5") {
                vec!["#\u{7f}\u{7f}\r\n".to_string()]
            } else {
                vec![]
            }
        });
        let err = link
            .exchange(&Command::new(3, Verb::Voltage), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, DhiError::Timeout(_)));

        let err = link
            .exchange(&Command::new(5, Verb::Voltage), Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, DhiError::BusConflict(_)));
    }
}
