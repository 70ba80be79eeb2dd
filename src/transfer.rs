//! Chunked file transfer between host and head.
//!
//! Files move in 256-byte chunks, each hex encoded with an additive
//! checksum. A checksum mismatch restarts the whole transfer; after
//! [`MAX_TRANSFER_ATTEMPTS`] failed passes the transfer is abandoned.

use crate::controller::Controller;
use crate::error::{DeviceCode, DhiError, OpResult};
use crate::protocol::{byte_sum, Command, Verb};
use log::{debug, info, warn};
use std::fmt::Write as _;

pub const CHUNK_SIZE: usize = 256;
pub const MAX_TRANSFER_ATTEMPTS: u32 = 5;
/// Hex field of an empty chunk.
pub const EMPTY_CHUNK: &str = "-";
const MAX_NAME_LEN: usize = 64;

/// Progress of one upload or download pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSession {
    pub bytes: usize,
    pub chunk: u32,
    pub attempt: u32,
}

pub fn encode_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return EMPTY_CHUNK.to_string();
    }
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(hex, "{:02X}", b);
    }
    hex
}

pub fn decode_hex(hex: &str) -> Result<Vec<u8>, DhiError> {
    if hex == EMPTY_CHUNK {
        return Ok(Vec::new());
    }
    if hex.len() % 2 != 0 || hex.len() > CHUNK_SIZE * 2 {
        return Err(DhiError::Parse(format!("bad hex chunk length {}", hex.len())));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DhiError::Parse(format!("bad hex at offset {}", i)))
        })
        .collect()
}

pub fn format_sum(sum: u16) -> String {
    format!("{:04X}", sum)
}

pub fn parse_sum(text: &str) -> Result<u16, DhiError> {
    u16::from_str_radix(text, 16).map_err(|_| DhiError::Parse(format!("bad checksum {:?}", text)))
}

pub fn validate_name(name: &str) -> Result<(), DhiError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err(DhiError::argument(format!("invalid file name {:?}", name)));
    }
    Ok(())
}

enum Pass {
    Done,
    Corrupt { chunk: u32, expected: u16, actual: u16 },
}

impl Controller {
    /// Reads file `name` from `head`.
    pub fn upload(&mut self, head: u8, name: &str) -> OpResult<Vec<u8>> {
        self.run("upload", Some(head), |c| {
            c.check_head(head)?;
            validate_name(name)?;
            let mut last = (0, 0);
            for attempt in 1..=MAX_TRANSFER_ATTEMPTS {
                let mut data = Vec::new();
                let mut session = TransferSession {
                    attempt,
                    ..TransferSession::default()
                };
                match c.upload_pass(head, name, &mut data, &mut session)? {
                    Pass::Done => {
                        info!(
                            "Uploaded {} ({} bytes, {} chunks) from head {}",
                            name, session.bytes, session.chunk, head
                        );
                        return Ok(data);
                    }
                    Pass::Corrupt {
                        chunk,
                        expected,
                        actual,
                    } => {
                        warn!(
                            "Upload of {} from head {}: chunk {} checksum {:04X} != {:04X}, attempt {}/{}",
                            name, head, chunk, actual, expected, attempt, MAX_TRANSFER_ATTEMPTS
                        );
                        last = (expected, actual);
                    }
                }
            }
            Err(DhiError::Checksum {
                expected: u32::from(last.0),
                actual: u32::from(last.1),
            })
        })
    }

    fn upload_pass(
        &mut self,
        head: u8,
        name: &str,
        data: &mut Vec<u8>,
        session: &mut TransferSession,
    ) -> Result<Pass, DhiError> {
        loop {
            let cmd = Command::new(head, Verb::Upload).arg(name).arg(session.chunk);
            let response = match self.transact(&cmd) {
                Ok(response) => response,
                Err(e) if e.device_code() == Some(DeviceCode::EndOfFile) => return Ok(Pass::Done),
                Err(e) => return Err(e),
            };
            response.require_fields(3)?;
            let index: u32 = response.field(0, "chunk index")?;
            if index != session.chunk {
                return Err(DhiError::Parse(format!(
                    "expected chunk {}, device sent {}",
                    session.chunk, index
                )));
            }
            let bytes = decode_hex(&response.fields[1])?;
            let reported = parse_sum(&response.fields[2])?;
            let computed = byte_sum(&bytes);
            if reported != computed {
                return Ok(Pass::Corrupt {
                    chunk: session.chunk,
                    expected: reported,
                    actual: computed,
                });
            }
            session.bytes += bytes.len();
            session.chunk += 1;
            let last = bytes.len() < CHUNK_SIZE;
            data.extend_from_slice(&bytes);
            if last {
                return Ok(Pass::Done);
            }
        }
    }

    /// Writes `bytes` to file `name` on `head`.
    pub fn download(&mut self, head: u8, name: &str, bytes: &[u8]) -> OpResult<()> {
        self.run("download", Some(head), |c| c.download_inner(head, name, bytes))
    }

    fn download_inner(&mut self, head: u8, name: &str, bytes: &[u8]) -> Result<(), DhiError> {
        self.check_head(head)?;
        validate_name(name)?;
        let mut last = (0, 0);
        for attempt in 1..=MAX_TRANSFER_ATTEMPTS {
            let mut session = TransferSession {
                attempt,
                ..TransferSession::default()
            };
            match self.download_pass(head, name, bytes, &mut session)? {
                Pass::Done => {
                    info!(
                        "Downloaded {} ({} bytes, {} chunks) to head {}",
                        name, session.bytes, session.chunk, head
                    );
                    return Ok(());
                }
                Pass::Corrupt {
                    chunk,
                    expected,
                    actual,
                } => {
                    warn!(
                        "Download of {} to head {}: chunk {} acknowledged {:04X}, sent {:04X}, attempt {}/{}",
                        name, head, chunk, actual, expected, attempt, MAX_TRANSFER_ATTEMPTS
                    );
                    last = (expected, actual);
                }
            }
        }
        Err(DhiError::Checksum {
            expected: u32::from(last.0),
            actual: u32::from(last.1),
        })
    }

    /// Downloads a firmware image and flashes it, waiting for the head to
    /// finish programming.
    pub fn load_firmware(&mut self, head: u8, name: &str, image: &[u8]) -> OpResult<()> {
        self.run("load_firmware", Some(head), |c| {
            c.download_inner(head, name, image)?;
            c.transact(&Command::new(head, Verb::OsCommand).arg("flash").arg(name))?;
            c.wait_for_completion(head)?;
            // New firmware starts from scratch.
            c.forget_head(head);
            info!("Head {} flashed with {}", head, name);
            Ok(())
        })
    }

    /// Downloads a program and loads it into head RAM.
    pub fn load_ram(&mut self, head: u8, name: &str, image: &[u8]) -> OpResult<()> {
        self.run("load_ram", Some(head), |c| {
            c.download_inner(head, name, image)?;
            c.transact(&Command::new(head, Verb::OsCommand).arg("ramload").arg(name))?;
            c.forget_head(head);
            info!("Head {} running {} from RAM", head, name);
            Ok(())
        })
    }

    fn download_pass(
        &mut self,
        head: u8,
        name: &str,
        bytes: &[u8],
        session: &mut TransferSession,
    ) -> Result<Pass, DhiError> {
        // An exact multiple of the chunk size ends with an empty chunk.
        let mut chunks: Vec<&[u8]> = bytes.chunks(CHUNK_SIZE).collect();
        if bytes.len() % CHUNK_SIZE == 0 {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let sum = byte_sum(chunk);
            let cmd = Command::new(head, Verb::Download)
                .arg(name)
                .arg(session.chunk)
                .arg(encode_hex(chunk))
                .arg(format_sum(sum));
            let response = match self.transact(&cmd) {
                Ok(response) => response,
                Err(e) if e.device_code() == Some(DeviceCode::Checksum) => {
                    return Ok(Pass::Corrupt {
                        chunk: session.chunk,
                        expected: sum,
                        actual: sum.wrapping_add(1),
                    });
                }
                Err(e) => return Err(e),
            };
            response.require_fields(2)?;
            let acknowledged = parse_sum(&response.fields[1])?;
            if acknowledged != sum {
                return Ok(Pass::Corrupt {
                    chunk: session.chunk,
                    expected: sum,
                    actual: acknowledged,
                });
            }
            debug!("Chunk {} of {} acknowledged", session.chunk, name);
            session.bytes += chunk.len();
            session.chunk += 1;
        }
        Ok(Pass::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(encode_hex(&[0x00, 0xAB, 0x10]), "00AB10");
        assert_eq!(decode_hex("00AB10").unwrap(), vec![0x00, 0xAB, 0x10]);
        assert_eq!(encode_hex(&[]), EMPTY_CHUNK);
        assert!(decode_hex(EMPTY_CHUNK).unwrap().is_empty());
        assert!(decode_hex("ABC").is_err());
        assert!(decode_hex("ZZ").is_err());
    }

    #[test]
    fn test_sum_format() {
        assert_eq!(format_sum(0x1F), "001F");
        assert_eq!(parse_sum("001F").unwrap(), 0x1F);
        assert!(parse_sum("XYZ").is_err());
    }

    #[test]
    fn test_names() {
        assert!(validate_name("h3_settings.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("two words").is_err());
    }
}
