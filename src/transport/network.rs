//! Network backend: forwards commands to a remote service that owns the
//! scanner link, and the service side that exposes any local transport.
//!
//! Frames are a big-endian u32 length followed by the payload. Request
//! payloads start with an operation byte, reply payloads with a status
//! byte; failures on the far side come back as the same error taxonomy.

use crate::error::DhiError;
use crate::protocol::{AsyncNotice, AsyncPayload, Command};
use crate::transport::Transport;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info, warn};
use std::io::{self, Cursor, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const OP_EXCHANGE: u8 = 1;
const OP_TAKE_ASYNC: u8 = 2;
const OP_DRAIN_ERRORS: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_TIMEOUT: u8 = 1;
const STATUS_BUS_CONFLICT: u8 = 2;
const STATUS_ERROR: u8 = 3;

const MAX_FRAME: u32 = 1 << 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Allowance for the network round trip on top of the device timeout.
const NETWORK_GRACE: Duration = Duration::from_secs(2);
const NO_HEAD: u8 = 0xFF;

fn write_frame(stream: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    stream.write_u32::<BigEndian>(payload.len() as u32)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn read_frame(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = stream.read_u32::<BigEndian>()?;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn open_stream(address: &str) -> Result<TcpStream, DhiError> {
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| DhiError::Config(format!("cannot resolve {}", address)))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn call_frame(stream: &mut TcpStream, request: &[u8], read_timeout: Duration) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(read_timeout))?;
    write_frame(stream, request)?;
    read_frame(stream)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let start = cursor.position() as usize;
    let bytes = cursor
        .get_ref()
        .get(start..start + len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated string"))?;
    cursor.set_position((start + len) as u64);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_string(buf: &mut Vec<u8>, text: &str) -> io::Result<()> {
    let bytes = text.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
    buf.write_u16::<BigEndian>(len)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn encode_notices(notices: &[AsyncNotice]) -> io::Result<Vec<u8>> {
    let mut buf = vec![STATUS_OK];
    buf.write_u16::<BigEndian>(notices.len() as u16)?;
    for notice in notices {
        buf.write_u8(notice.head.unwrap_or(NO_HEAD))?;
        match &notice.payload {
            AsyncPayload::Error(code) => {
                buf.write_u8(0)?;
                buf.write_i32::<BigEndian>(*code)?;
            }
            AsyncPayload::Message(text) => {
                buf.write_u8(1)?;
                write_string(&mut buf, text)?;
            }
        }
    }
    Ok(buf)
}

fn decode_notices(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<AsyncNotice>> {
    let count = cursor.read_u16::<BigEndian>()?;
    let mut notices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let head = match cursor.read_u8()? {
            NO_HEAD => None,
            head => Some(head),
        };
        let payload = match cursor.read_u8()? {
            0 => AsyncPayload::Error(cursor.read_i32::<BigEndian>()?),
            _ => AsyncPayload::Message(read_string(cursor)?),
        };
        notices.push(AsyncNotice { head, payload });
    }
    Ok(notices)
}

/// Client side of the remote scanner service.
///
/// A call that times out or fails mid-frame leaves the stream out of
/// step with the service, so the stream is dropped and the next call
/// opens a fresh connection.
pub struct NetworkLink {
    address: String,
    stream: Mutex<Option<TcpStream>>,
    grace: Duration,
}

impl NetworkLink {
    pub fn connect(address: &str) -> Result<Self, DhiError> {
        info!("Connecting to scanner service at {}", address);
        let stream = open_stream(address)?;
        info!("Connected to {}", address);
        Ok(NetworkLink {
            address: address.to_string(),
            stream: Mutex::new(Some(stream)),
            grace: NETWORK_GRACE,
        })
    }

    fn call(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, DhiError> {
        let mut slot = self
            .stream
            .lock()
            .map_err(|_| DhiError::ThreadComm("network stream lock poisoned".to_string()))?;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => {
                info!("Reconnecting to {}", self.address);
                open_stream(&self.address)?
            }
        };
        match call_frame(&mut stream, request, timeout + self.grace) {
            Ok(reply) => {
                *slot = Some(stream);
                Ok(reply)
            }
            Err(e) => {
                warn!("Dropping connection to {}: {}", self.address, e);
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
                    Err(DhiError::Timeout(timeout))
                } else {
                    Err(DhiError::Io(e))
                }
            }
        }
    }

    fn notices(&self, op: u8) -> Vec<AsyncNotice> {
        let reply = match self.call(&[op], NETWORK_GRACE) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Async query to {} failed: {}", self.address, e);
                return Vec::new();
            }
        };
        let mut cursor = Cursor::new(reply.as_slice());
        match cursor.read_u8() {
            Ok(STATUS_OK) => decode_notices(&mut cursor).unwrap_or_else(|e| {
                warn!("Malformed async reply from {}: {}", self.address, e);
                Vec::new()
            }),
            _ => Vec::new(),
        }
    }
}

impl Transport for NetworkLink {
    fn exchange(&self, command: &Command, timeout: Duration) -> Result<String, DhiError> {
        let mut request = vec![OP_EXCHANGE];
        request.write_u8(command.head())?;
        request.write_u32::<BigEndian>(timeout.as_millis().min(u32::MAX as u128) as u32)?;
        write_string(&mut request, &command.text())?;

        let reply = self.call(&request, timeout)?;
        let mut cursor = Cursor::new(reply.as_slice());
        let status = cursor.read_u8()?;
        match status {
            STATUS_OK => Ok(read_string(&mut cursor)?),
            STATUS_TIMEOUT => Err(DhiError::Timeout(timeout)),
            STATUS_BUS_CONFLICT => Err(DhiError::BusConflict(read_string(&mut cursor)?)),
            _ => Err(DhiError::Resource(format!(
                "remote service error: {}",
                read_string(&mut cursor)?
            ))),
        }
    }

    fn take_async(&self) -> Option<AsyncNotice> {
        self.notices(OP_TAKE_ASYNC).pop()
    }

    fn drain_async_errors(&self) -> Vec<AsyncNotice> {
        self.notices(OP_DRAIN_ERRORS)
    }

    fn describe(&self) -> String {
        format!("network {}", self.address)
    }
}

/// Exposes a local transport to network clients, one connection at a time.
pub struct RemoteService {
    transport: Box<dyn Transport>,
}

impl RemoteService {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        RemoteService { transport }
    }

    /// Accepts connections until `stop` is raised.
    pub fn serve(&self, listener: TcpListener, stop: &AtomicBool) -> Result<(), DhiError> {
        listener.set_nonblocking(true)?;
        info!(
            "Serving {} on {}",
            self.transport.describe(),
            listener.local_addr()?
        );
        while !stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!("Client {} connected", peer);
                    stream.set_nonblocking(false)?;
                    if let Err(e) = self.handle_client(stream) {
                        warn!("Client {} dropped: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    return Err(DhiError::Io(e));
                }
            }
        }
        info!("Scanner service stopped.");
        Ok(())
    }

    fn handle_client(&self, mut stream: TcpStream) -> io::Result<()> {
        loop {
            let request = match read_frame(&mut stream) {
                Ok(request) => request,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let reply = self.handle_request(&request)?;
            write_frame(&mut stream, &reply)?;
        }
    }

    fn handle_request(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let mut cursor = Cursor::new(request);
        match cursor.read_u8()? {
            OP_EXCHANGE => {
                let head = cursor.read_u8()?;
                let timeout = Duration::from_millis(u64::from(cursor.read_u32::<BigEndian>()?));
                let text = read_string(&mut cursor)?;
                debug!("Remote exchange h{} > {}", head, text);
                let command = match Command::parse(&text) {
                    Ok(command) if command.head() == head => command,
                    _ => return error_reply(STATUS_ERROR, &format!("bad command {:?}", text)),
                };
                match self.transport.exchange(&command, timeout) {
                    Ok(line) => {
                        let mut reply = vec![STATUS_OK];
                        write_string(&mut reply, &line)?;
                        Ok(reply)
                    }
                    Err(DhiError::Timeout(_)) => Ok(vec![STATUS_TIMEOUT]),
                    Err(DhiError::BusConflict(text)) => error_reply(STATUS_BUS_CONFLICT, &text),
                    Err(e) => error_reply(STATUS_ERROR, &e.to_string()),
                }
            }
            OP_TAKE_ASYNC => {
                let notices: Vec<_> = self.transport.take_async().into_iter().collect();
                encode_notices(&notices)
            }
            OP_DRAIN_ERRORS => encode_notices(&self.transport.drain_async_errors()),
            op => error_reply(STATUS_ERROR, &format!("unknown operation {}", op)),
        }
    }
}

fn error_reply(status: u8, text: &str) -> io::Result<Vec<u8>> {
    let mut reply = vec![status];
    write_string(&mut reply, text)?;
    Ok(reply)
}
