//! IEEE 488.2 definite-length arbitrary blocks: `#<d><length><bytes>`.
//!
//! The length prefix is what lets binary payloads (calibration sets, state
//! files, trace data) cross a line-oriented channel: payload bytes equal to
//! the line delimiter are never treated as terminators.

use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::error::VnaError;
use crate::transport::{Deadline, Link, ReadFailure, ShortRead, Transport};

pub const BLOCK_SENTINEL: u8 = b'#';

/// Largest length a 9-digit header can declare
pub const MAX_DECLARABLE_LEN: usize = 999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Where the bytes of a transfer end up (or come from)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockTarget {
    InstrumentFile(String),
    Buffer,
    LocalFile(PathBuf),
}

/// One binary transfer. The declared length must match the bytes moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransferDescriptor {
    pub direction: Direction,
    pub declared_len: usize,
    pub target: BlockTarget,
}

impl BlockTransferDescriptor {
    pub fn new(direction: Direction, declared_len: usize, target: BlockTarget) -> Self {
        Self {
            direction,
            declared_len,
            target,
        }
    }

    pub fn verify(&self, actual: usize) -> Result<(), VnaError> {
        if actual == self.declared_len {
            Ok(())
        } else {
            warn!(
                "{:?} of {:?} moved {} of {} declared bytes",
                self.direction, self.target, actual, self.declared_len
            );
            Err(VnaError::TransferIncomplete {
                expected: self.declared_len,
                actual,
            })
        }
    }
}

/// Header for a payload of `len` bytes, using the minimal digit count.
///
/// ```
/// assert_eq!(vna_link::scpi::block::header_for(12345), "#512345");
/// assert_eq!(vna_link::scpi::block::header_for(0), "#10");
/// ```
pub fn header_for(len: usize) -> String {
    let digits = len.to_string();
    format!("#{}{}", digits.len(), digits)
}

/// Header followed by the raw payload, no terminator
pub fn encode_block(payload: &[u8]) -> Result<Vec<u8>, VnaError> {
    if payload.len() > MAX_DECLARABLE_LEN {
        return Err(VnaError::InvalidCommand(format!(
            "Payload of {} bytes exceeds the largest definite-length block",
            payload.len()
        )));
    }
    let header = header_for(payload.len());
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parsed `#<d><length>` prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes taken by `#`, the digit count and the length digits
    pub header_len: usize,
    pub payload_len: usize,
}

fn digit_count(byte: u8) -> Result<usize, String> {
    match byte {
        b'0' => Err("indefinite-length blocks (#0) are not supported".to_string()),
        b'1'..=b'9' => Ok((byte - b'0') as usize),
        other => Err(format!("invalid block digit count {:?}", other as char)),
    }
}

fn parse_length(digits: &[u8]) -> Result<usize, String> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(format!(
            "invalid block length {:?}",
            String::from_utf8_lossy(digits)
        ));
    }
    digits
        .iter()
        .try_fold(0usize, |acc, d| {
            acc.checked_mul(10)?.checked_add((d - b'0') as usize)
        })
        .ok_or_else(|| "block length overflows".to_string())
}

/// Parse the header at the start of a fully buffered reply
pub fn parse_header(raw: &[u8]) -> Result<BlockHeader, String> {
    match raw.first() {
        Some(&BLOCK_SENTINEL) => {}
        _ => return Err("missing block sentinel '#'".to_string()),
    }
    let d = digit_count(*raw.get(1).ok_or("truncated block header")?)?;
    let digits = raw.get(2..2 + d).ok_or("truncated block header")?;
    Ok(BlockHeader {
        header_len: 2 + d,
        payload_len: parse_length(digits)?,
    })
}

/// Decode a fully buffered block reply, allowing only a trailing terminator
/// or whitespace after the payload
pub fn decode_block(raw: &[u8]) -> Result<Vec<u8>, VnaError> {
    let lossy = || String::from_utf8_lossy(&raw[..raw.len().min(64)]).into_owned();
    let header = parse_header(raw).map_err(|reason| VnaError::malformed(lossy(), reason))?;
    let end = header.header_len + header.payload_len;
    let payload = raw.get(header.header_len..end).ok_or_else(|| VnaError::TransferIncomplete {
        expected: header.payload_len,
        actual: raw.len().saturating_sub(header.header_len),
    })?;
    if !raw[end..].iter().all(u8::is_ascii_whitespace) {
        return Err(VnaError::malformed(
            lossy(),
            format!("{} unexpected bytes after block payload", raw.len() - end),
        ));
    }
    Ok(payload.to_vec())
}

/// Read one block reply from the link: header, exactly the declared payload
/// bytes, then the instrument's trailing terminator.
///
/// A short payload yields `TransferIncomplete` and none of the partial bytes
/// are returned.
pub(crate) fn read_block<T: Transport>(
    link: &mut Link<T>,
    deadline: &Deadline,
    max_len: usize,
    target: BlockTarget,
) -> Result<Vec<u8>, VnaError> {
    let header_err = |failure: ReadFailure| match failure {
        ReadFailure::TimedOut => VnaError::Timeout(deadline.budget()),
        ReadFailure::Closed => VnaError::ProtocolDesync("connection closed before block header".into()),
        ReadFailure::Overflow(limit) => VnaError::ProtocolDesync(format!("block header exceeds {limit} bytes")),
        ReadFailure::Io(source) => VnaError::Io {
            source,
            context: "Reading block header".into(),
        },
    };

    let prefix = link.read_exact(2, deadline).map_err(|s| header_err(s.cause))?;
    if prefix[0] != BLOCK_SENTINEL {
        return Err(VnaError::ProtocolDesync(format!(
            "expected block sentinel '#', got {:?}",
            prefix[0] as char
        )));
    }
    let d = digit_count(prefix[1]).map_err(VnaError::ProtocolDesync)?;
    let digits = link.read_exact(d, deadline).map_err(|s| header_err(s.cause))?;
    let declared = parse_length(&digits).map_err(VnaError::ProtocolDesync)?;
    if declared > max_len {
        return Err(VnaError::ProtocolDesync(format!(
            "declared block length {declared} exceeds limit {max_len}"
        )));
    }

    let descriptor = BlockTransferDescriptor::new(Direction::Download, declared, target);
    debug!("Reading block of {} bytes into {:?}", declared, descriptor.target);

    let payload = link.read_exact(declared, deadline).map_err(|short| {
        warn!(
            "Block read stopped after {} of {} bytes: {:?}",
            short.got, declared, short.cause
        );
        VnaError::TransferIncomplete {
            expected: declared,
            actual: short.got,
        }
    })?;

    consume_terminator(link, deadline)?;
    Ok(payload)
}

/// Discard the single terminator that follows a block payload.
///
/// Instruments end a block with either a bare `\n` or the configured line
/// delimiter, and both are accepted. Any other byte means the stream is out
/// of step.
fn consume_terminator<T: Transport>(link: &mut Link<T>, deadline: &Deadline) -> Result<(), VnaError> {
    let first = link.read_exact(1, deadline).map_err(missing_terminator)?[0];
    if first == b'\n' {
        return Ok(());
    }

    let delimiter = link.delimiter().to_vec();
    if delimiter.first() != Some(&first) {
        return Err(VnaError::ProtocolDesync(format!(
            "unexpected byte {first:#04x} after block payload"
        )));
    }
    let rest = link
        .read_exact(delimiter.len() - 1, deadline)
        .map_err(missing_terminator)?;
    if rest != delimiter[1..] {
        return Err(VnaError::ProtocolDesync(format!(
            "unexpected bytes {rest:02x?} after block payload"
        )));
    }
    Ok(())
}

fn missing_terminator(_: ShortRead) -> VnaError {
    VnaError::ProtocolDesync("missing terminator after block".into())
}

/// Byte order of binary REAL,64 trace data (`FORM:BORD NORM|SWAP`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// `FORM:BORD NORM`
    Big,
    /// `FORM:BORD SWAP`
    Little,
}

/// Decode a block payload of 64-bit floats
pub fn decode_real64(payload: &[u8], endian: Endian) -> Result<Vec<f64>, VnaError> {
    if payload.len() % 8 != 0 {
        return Err(VnaError::malformed(
            format!("<{} bytes>", payload.len()),
            "REAL,64 payload is not a multiple of 8 bytes",
        ));
    }
    let mut values = vec![0f64; payload.len() / 8];
    match endian {
        Endian::Big => BigEndian::read_f64_into(payload, &mut values),
        Endian::Little => LittleEndian::read_f64_into(payload, &mut values),
    }
    Ok(values)
}
