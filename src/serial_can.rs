//! CAN reached through a UART bridge.
//!
//! The bridge firmware tunnels single CAN frames through a serial link:
//! outgoing frames are wrapped into a [`bridge`] send command and shipped
//! inside a CRC-protected serial frame ([`framing`]); incoming traffic
//! arrives as one serial frame per CAN frame.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::bridge;
use crate::frame::Frame;
use crate::framing;
use crate::transport::CanTransport;

pub const BRIDGE_BAUDRATE: u32 = 115_200;

/// CAN transport speaking the serial bridge protocol over any byte
/// stream.
pub struct SerialCanConnection<P> {
    port: P,
}

impl<P: Read + Write> SerialCanConnection<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }
}

/// Opens the serial device the bridge is attached to.
pub fn open(
    device: &str,
    read_timeout: Duration,
) -> io::Result<SerialCanConnection<Box<dyn serialport::SerialPort>>> {
    let port = serialport::new(device, BRIDGE_BAUDRATE)
        .timeout(read_timeout)
        .open()?;
    Ok(SerialCanConnection::new(port))
}

impl<P: Read + Write> CanTransport for SerialCanConnection<P> {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let command = bridge::encode_frame_write(frame);
        self.port.write_all(&framing::encode(&command))?;
        self.port.flush()
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        let payload = match framing::read_frame(&mut self.port) {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(framing::ReadError::Io(e)) => return Err(e),
            Err(framing::ReadError::Framing(e)) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        bridge::decode_frame(&payload)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
