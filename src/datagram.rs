//! The CAN datagram protocol.
//!
//! A datagram is the logical unit above CAN frames: a version byte, a
//! CRC-32, a destination node list and a length-delimited payload,
//! fragmented into frames of at most 8 bytes. The first frame of a
//! datagram carries the start-of-datagram bit; the low 7 bits of every
//! frame id name the emitting node, which lets receivers reassemble
//! streams that are interleaved across sources.

use std::collections::HashMap;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::frame::Frame;
use crate::transport::CanTransport;

pub const DATAGRAM_VERSION: u8 = 1;

/// Bit 7 of the frame id, set on the first frame of each datagram.
pub const START_OF_DATAGRAM_MASK: u32 = 1 << 7;

/// Low 7 bits of the frame id carry the emitting node.
pub const SOURCE_ID_MASK: u32 = 0x7f;

/// A peer transmits one datagram at a time, so a partial reassembly
/// larger than this means the peer misbehaves and the buffer is dropped.
const MAX_DATAGRAM_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Datagram version {found} is not supported, expected 1.")]
    VersionMismatch { found: u8 },
    #[error("Datagram CRC mismatch: header says {expected:#010x}, tail hashes to {computed:#010x}.")]
    CrcMismatch { expected: u32, computed: u32 },
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Failed to receive a frame from the bus.")]
    Io(#[from] io::Error),
}

/// Returns true if the given frame has the start of datagram marker.
pub fn is_start_of_datagram(frame: &Frame) -> bool {
    frame.id() & START_OF_DATAGRAM_MASK != 0
}

/// Encodes the given data and destination list to form a complete
/// datagram, ready to be cut into CAN frames by [`datagram_to_frames`].
pub fn encode_datagram(data: &[u8], destinations: &[u8]) -> Vec<u8> {
    debug_assert!(destinations.len() <= 127);

    let mut tail = Vec::with_capacity(destinations.len() + data.len() + 5);
    tail.push(destinations.len() as u8);
    tail.extend_from_slice(destinations);
    push_u32(&mut tail, data.len() as u32);
    tail.extend_from_slice(data);

    let mut datagram = Vec::with_capacity(tail.len() + 5);
    datagram.push(DATAGRAM_VERSION);
    push_u32(&mut datagram, crc32fast::hash(&tail));
    datagram.extend_from_slice(&tail);
    datagram
}

/// Decodes the given datagram bytes.
///
/// Returns the payload and the destination list once `buf` holds a
/// complete and valid datagram, `None` while bytes are still missing.
/// The declared payload length is authoritative: a buffer with excess
/// bytes also counts as incomplete.
pub fn decode_datagram(buf: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, ProtocolError> {
    let version = match buf.first() {
        Some(&version) => version,
        None => return Ok(None),
    };
    if version != DATAGRAM_VERSION {
        return Err(ProtocolError::VersionMismatch { found: version });
    }

    if buf.len() < 6 {
        return Ok(None);
    }
    let expected = BigEndian::read_u32(&buf[1..5]);
    let destination_count = buf[5] as usize;

    let length_offset = 6 + destination_count;
    if buf.len() < length_offset + 4 {
        return Ok(None);
    }
    let destinations = &buf[6..length_offset];
    let data_len = BigEndian::read_u32(&buf[length_offset..length_offset + 4]) as usize;

    let data = &buf[length_offset + 4..];
    if data.len() != data_len {
        return Ok(None);
    }

    let computed = crc32fast::hash(&buf[5..]);
    if computed != expected {
        return Err(ProtocolError::CrcMismatch { expected, computed });
    }

    Ok(Some((data.to_vec(), destinations.to_vec())))
}

/// Cuts a raw datagram into CAN frames stamped with `source`.
pub fn datagram_to_frames<'a>(
    datagram: &'a [u8],
    source: u8,
) -> impl Iterator<Item = Frame> + 'a {
    datagram.chunks(8).enumerate().map(move |(index, chunk)| {
        let start_bit = if index == 0 { START_OF_DATAGRAM_MASK } else { 0 };
        // A chunk is at most 8 bytes and the id fits in 8 bits, so the
        // constructor cannot fail.
        Frame::standard(start_bit | (u32::from(source) & SOURCE_ID_MASK), chunk).unwrap()
    })
}

/// A datagram reassembled from the bus, tagged with its emitting node.
#[derive(Debug, PartialEq, Eq)]
pub struct IncomingDatagram {
    pub data: Vec<u8>,
    pub destinations: Vec<u8>,
    pub source: u8,
}

/// Reassembles datagrams from the interleaved frame streams of multiple
/// sources.
///
/// One accumulator is kept per source, so concurrent transmissions from
/// distinct nodes decode correctly no matter how their frames interleave
/// on the bus. The reader holds no reference to the transport; state
/// survives across calls, which lets callers resend commands between
/// polls.
#[derive(Debug, Default)]
pub struct DatagramReader {
    buffers: HashMap<u8, Vec<u8>>,
}

impl DatagramReader {
    pub fn new() -> DatagramReader {
        DatagramReader {
            buffers: HashMap::new(),
        }
    }

    /// Pulls frames from `conn` until a datagram completes or the
    /// transport reports a timeout.
    ///
    /// `Ok(None)` is the timeout tick; partial reassembly state is kept
    /// across ticks so a slow sender is not forgotten. Extended frames
    /// are application traffic sharing the bus and are dropped without
    /// comment.
    pub fn receive<C>(&mut self, conn: &mut C) -> Result<Option<IncomingDatagram>, ReceiveError>
    where
        C: CanTransport + ?Sized,
    {
        loop {
            let frame = match conn.receive_frame()? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            if frame.is_extended() {
                continue;
            }

            let source = (frame.id() & SOURCE_ID_MASK) as u8;

            if is_start_of_datagram(&frame) {
                // The peer restarted its transmission; whatever was
                // accumulated for it is stale.
                self.buffers.remove(&source);
            }

            let buffer = self.buffers.entry(source).or_default();
            buffer.extend_from_slice(frame.data());
            let oversized = buffer.len() > MAX_DATAGRAM_SIZE;
            if oversized {
                log::warn!("Dropping oversized datagram from source {}", source);
                self.buffers.remove(&source);
                continue;
            }

            match decode_datagram(&self.buffers[&source]) {
                Ok(Some((data, destinations))) => {
                    self.buffers.remove(&source);
                    return Ok(Some(IncomingDatagram {
                        data,
                        destinations,
                        source,
                    }));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.buffers.remove(&source);
                    return Err(e.into());
                }
            }
        }
    }
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    let mut raw = [0; 4];
    BigEndian::write_u32(&mut raw, value);
    buf.extend_from_slice(&raw);
}
