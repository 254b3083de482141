//! slcan (Lawicel) ASCII transport adapter, for USB-CAN dongles.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::frame::Frame;
use crate::transport::CanTransport;

const LINE_TERMINATOR: u8 = b'\r';

/// CAN transport speaking the slcan ASCII protocol over a byte stream.
pub struct SlcanConnection<P> {
    port: P,
}

impl<P: Read + Write> SlcanConnection<P> {
    /// Configures the channel for 1 Mbit/s and opens it.
    pub fn new(mut port: P) -> io::Result<Self> {
        port.write_all(b"S8\r")?;
        port.write_all(b"O\r")?;
        port.flush()?;
        Ok(Self { port })
    }
}

/// Opens the serial device of an slcan dongle.
pub fn open(
    device: &str,
    read_timeout: Duration,
) -> io::Result<SlcanConnection<Box<dyn serialport::SerialPort>>> {
    let port = serialport::new(device, 115_200)
        .timeout(read_timeout)
        .open()?;
    SlcanConnection::new(port)
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut line = Vec::with_capacity(27);
    if frame.is_extended() {
        line.push(if frame.is_rtr() { b'R' } else { b'T' });
        line.extend_from_slice(format!("{:08X}", frame.id()).as_bytes());
    } else {
        line.push(if frame.is_rtr() { b'r' } else { b't' });
        line.extend_from_slice(format!("{:03X}", frame.id()).as_bytes());
    }
    line.push(b'0' + frame.len() as u8);
    if !frame.is_rtr() {
        line.extend_from_slice(hex::encode_upper(frame.data()).as_bytes());
    }
    line.push(LINE_TERMINATOR);
    line
}

fn parse_frame(line: &[u8]) -> Option<Frame> {
    let kind = *line.first()?;
    let (extended, rtr, id_digits) = match kind {
        b't' => (false, false, 3),
        b'T' => (true, false, 8),
        b'r' => (false, true, 3),
        b'R' => (true, true, 8),
        _ => return None,
    };

    if line.len() < 1 + id_digits + 1 {
        return None;
    }
    let id_text = std::str::from_utf8(&line[1..1 + id_digits]).ok()?;
    let id = u32::from_str_radix(id_text, 16).ok()?;

    let dlc = usize::from(line[1 + id_digits].checked_sub(b'0')?);
    if dlc > 8 {
        return None;
    }

    let data = if rtr {
        Vec::new()
    } else {
        let start = 1 + id_digits + 1;
        hex::decode(line.get(start..start + 2 * dlc)?).ok()?
    };

    Frame::new(id, &data, extended, rtr).ok()
}

impl<P: Read + Write> CanTransport for SlcanConnection<P> {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.port.write_all(&encode_frame(frame))?;
        self.port.flush()
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0; 1];
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if byte[0] == LINE_TERMINATOR {
                        // Command acknowledgements and status lines are
                        // not frames; keep reading past them.
                        if let Some(frame) = parse_frame(&line) {
                            return Ok(Some(frame));
                        }
                        line.clear();
                    } else {
                        line.push(byte[0]);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePort {
        rx: io::Cursor<Vec<u8>>,
        tx: Vec<u8>,
    }

    impl FakePort {
        fn new(rx: &[u8]) -> Self {
            Self {
                rx: io::Cursor::new(rx.to_vec()),
                tx: Vec::new(),
            }
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn channel_setup_is_sent_on_open() {
        let conn = SlcanConnection::new(FakePort::new(b"")).unwrap();
        assert_eq!(conn.port.tx, b"S8\rO\r");
    }

    #[test]
    fn standard_frames_use_the_short_form() {
        let frame = Frame::standard(0x123, &[0xAA, 0xBB]).unwrap();
        assert_eq!(encode_frame(&frame), b"t1232AABB\r");
    }

    #[test]
    fn extended_frames_use_the_long_form() {
        let frame = Frame::new(0x1234_5678, &[0x01], true, false).unwrap();
        assert_eq!(encode_frame(&frame), b"T12345678101\r");
    }

    #[test]
    fn lines_parse_back_to_frames() {
        let frame = parse_frame(b"t0842CAFE").unwrap();
        assert_eq!(frame.id(), 0x084);
        assert_eq!(frame.data(), &[0xCA, 0xFE]);
        assert!(!frame.is_extended());
    }

    #[test]
    fn acknowledgement_lines_are_skipped() {
        let mut conn = SlcanConnection::new(FakePort::new(b"z\rt0011F\r")).unwrap();
        let frame = conn.receive_frame().unwrap().unwrap();
        assert_eq!(frame.id(), 0x001);
        assert_eq!(frame.data(), &[0x1F]);
    }

    #[test]
    fn exhausted_port_reads_as_timeout() {
        let mut conn = SlcanConnection::new(FakePort::new(b"")).unwrap();
        assert!(conn.receive_frame().unwrap().is_none());
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let mut conn = SlcanConnection::new(FakePort::new(b"tXYZ\r")).unwrap();
        assert!(conn.receive_frame().unwrap().is_none());
    }
}
