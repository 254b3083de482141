//! Wireshark-compatible trace files.
//!
//! Frames are logged in the classic pcap container with the SocketCAN
//! link type, so captures open directly in Wireshark next to captures
//! taken with `candump`. See
//! https://wiki.wireshark.org/Development/LibpcapFileFormat and
//! http://www.tcpdump.org/linktypes/LINKTYPE_CAN_SOCKETCAN.html for the
//! formats.

use std::io::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::frame::Frame;
use crate::transport::CanTransport;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAP_LEN: u32 = 65535;

/// LINKTYPE_CAN_SOCKETCAN
const LINK_TYPE: u32 = 227;

/// if set, indicate 29 bit extended format
const EFF_FLAG: u32 = 0x8000_0000;

/// remote transmission request flag
const RTR_FLAG: u32 = 0x4000_0000;

/// Writes frames into a pcap capture.
pub struct PcapWriter<W: Write> {
    out: W,
}

impl<W: Write> PcapWriter<W> {
    /// Writes the global pcap header and returns the writer.
    pub fn new(mut out: W) -> io::Result<PcapWriter<W>> {
        let mut header = [0; 24];
        LittleEndian::write_u32(&mut header[0..4], PCAP_MAGIC);
        LittleEndian::write_u16(&mut header[4..6], VERSION_MAJOR);
        LittleEndian::write_u16(&mut header[6..8], VERSION_MINOR);
        // Timezone offset and timestamp accuracy stay zero.
        LittleEndian::write_u32(&mut header[16..20], SNAP_LEN);
        LittleEndian::write_u32(&mut header[20..24], LINK_TYPE);
        out.write_all(&header)?;
        Ok(PcapWriter { out })
    }

    /// Appends one frame, stamped with a duration since the Unix epoch.
    pub fn write_frame(&mut self, timestamp: Duration, frame: &Frame) -> io::Result<()> {
        let length = 8 + frame.len() as u32;

        let mut header = [0; 16];
        LittleEndian::write_u32(&mut header[0..4], timestamp.as_secs() as u32);
        LittleEndian::write_u32(&mut header[4..8], timestamp.subsec_micros());
        LittleEndian::write_u32(&mut header[8..12], length);
        LittleEndian::write_u32(&mut header[12..16], length);
        self.out.write_all(&header)?;

        let mut id_with_flags = frame.id();
        if frame.is_extended() {
            id_with_flags |= EFF_FLAG;
        }
        if frame.is_rtr() {
            id_with_flags |= RTR_FLAG;
        }

        let mut can_header = [0; 8];
        BigEndian::write_u32(&mut can_header[0..4], id_with_flags);
        can_header[4] = frame.len() as u8;
        self.out.write_all(&can_header)?;
        self.out.write_all(frame.data())?;
        self.out.flush()
    }
}

/// Transport wrapper logging all frames sent and received into a
/// Wireshark compatible pcap file.
pub struct PcapTransport<C, W: Write> {
    inner: C,
    writer: PcapWriter<W>,
}

impl<C: CanTransport, W: Write> PcapTransport<C, W> {
    pub fn new(inner: C, out: W) -> io::Result<PcapTransport<C, W>> {
        Ok(PcapTransport {
            inner,
            writer: PcapWriter::new(out)?,
        })
    }
}

impl<C: CanTransport, W: Write> CanTransport for PcapTransport<C, W> {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.writer.write_frame(now(), frame)?;
        self.inner.send_frame(frame)
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        let frame = self.inner.receive_frame()?;
        if let Some(frame) = &frame {
            self.writer.write_frame(now(), frame)?;
        }
        Ok(frame)
    }
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_bus::ScriptedBus;

    #[test]
    fn global_header_layout() {
        let mut capture = Vec::new();
        PcapWriter::new(&mut capture).unwrap();

        assert_eq!(
            capture,
            [
                0xd4, 0xc3, 0xb2, 0xa1, // magic, little endian
                0x02, 0x00, 0x04, 0x00, // version 2.4
                0x00, 0x00, 0x00, 0x00, // timezone
                0x00, 0x00, 0x00, 0x00, // accuracy
                0xff, 0xff, 0x00, 0x00, // snaplen
                0xe3, 0x00, 0x00, 0x00, // LINKTYPE_CAN_SOCKETCAN
            ]
        );
    }

    #[test]
    fn frame_records_use_the_socketcan_layout() {
        let mut capture = Vec::new();
        {
            let mut writer = PcapWriter::new(&mut capture).unwrap();
            let frame = Frame::standard(0x123, &[0xAA, 0xBB]).unwrap();
            writer
                .write_frame(Duration::new(7, 1500 * 1000), &frame)
                .unwrap();
        }

        let record = &capture[24..];
        assert_eq!(LittleEndian::read_u32(&record[0..4]), 7);
        assert_eq!(LittleEndian::read_u32(&record[4..8]), 1500);
        assert_eq!(LittleEndian::read_u32(&record[8..12]), 10);
        assert_eq!(LittleEndian::read_u32(&record[12..16]), 10);
        // Big-endian id, dlc, three pad bytes, then the payload.
        assert_eq!(
            &record[16..],
            &[0x00, 0x00, 0x01, 0x23, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB]
        );
    }

    #[test]
    fn wrapper_traces_both_directions() {
        let mut bus = ScriptedBus::new();
        let incoming = Frame::standard(0x42, &[1]).unwrap();
        bus.push_frame(incoming);

        let mut capture = Vec::new();
        {
            let mut traced = PcapTransport::new(&mut bus, &mut capture).unwrap();
            let outgoing = Frame::standard(0x80, &[2, 3]).unwrap();
            traced.send_frame(&outgoing).unwrap();
            assert_eq!(traced.receive_frame().unwrap().unwrap(), incoming);
            assert!(traced.receive_frame().unwrap().is_none());
        }

        // Global header plus one record per direction: (16 + 8 + 2) sent
        // and (16 + 8 + 1) received.
        assert_eq!(capture.len(), 24 + 26 + 25);
        assert_eq!(bus.sent.len(), 1);
    }
}
