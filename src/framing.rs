//! Byte-stuffed framing for the serial link to the CAN bridge.
//!
//! The bridge speaks SLIP-style framing: each payload is followed by the
//! big-endian CRC-32 of the payload, escaped, and terminated by an `END`
//! marker. Escaping must substitute `ESC` before `END` so that an escaped
//! end marker is not escaped a second time.

use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Frame is shorter than its CRC and end marker.")]
    FrameTooShort,
    #[error("Frame CRC mismatch: expected {expected:#010x}, computed {computed:#010x}.")]
    CrcMismatch { expected: u32, computed: u32 },
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("Failed to read from the serial port.")]
    Io(#[from] io::Error),
}

/// Appends the payload CRC, escapes the result and terminates it with `END`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut crc = [0; 4];
    BigEndian::write_u32(&mut crc, crc32fast::hash(payload));

    let mut out = Vec::with_capacity(payload.len() + 6);
    for &byte in payload.iter().chain(crc.iter()) {
        match byte {
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            END => {
                out.push(ESC);
                out.push(ESC_END);
            }
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Decodes one raw frame, including its trailing `END` marker.
///
/// Exact inverse of [`encode`]: unescapes the body, splits off the CRC and
/// verifies it against the remaining payload.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, FramingError> {
    if raw.len() < 5 {
        return Err(FramingError::FrameTooShort);
    }

    let body = &raw[..raw.len() - 1];
    let mut unescaped = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        if byte == ESC {
            match bytes.peek() {
                Some(&ESC_END) => {
                    bytes.next();
                    unescaped.push(END);
                }
                Some(&ESC_ESC) => {
                    bytes.next();
                    unescaped.push(ESC);
                }
                _ => unescaped.push(byte),
            }
        } else {
            unescaped.push(byte);
        }
    }

    if unescaped.len() < 4 {
        return Err(FramingError::FrameTooShort);
    }

    let (payload, crc_bytes) = unescaped.split_at(unescaped.len() - 4);
    let expected = BigEndian::read_u32(crc_bytes);
    let computed = crc32fast::hash(payload);
    if expected != computed {
        return Err(FramingError::CrcMismatch { expected, computed });
    }

    Ok(payload.to_vec())
}

/// Reads bytes from `port` until an unescaped `END` marker, then decodes.
///
/// Returns `Ok(None)` when the read times out before a full frame arrived;
/// the partial input is discarded, a frame is never returned in pieces.
pub fn read_frame<R>(port: &mut R) -> Result<Option<Vec<u8>>, ReadError>
where
    R: Read + ?Sized,
{
    let mut buf = Vec::new();
    loop {
        let mut byte = [0; 1];
        match port.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                buf.push(byte[0]);
                if byte[0] == END {
                    return Ok(Some(decode(&buf)?));
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                return Ok(None);
            }
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
}
