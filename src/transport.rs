use std::io;

use crate::frame::Frame;

/// Capability to exchange single CAN frames with a bus.
///
/// Implemented by the SocketCAN, serial bridge and slcan adapters; the
/// datagram layer and everything above it only ever talk to this trait.
/// `receive_frame` returning `Ok(None)` means the adapter's read timeout
/// elapsed, which callers treat as a recoverable tick rather than an
/// error.
pub trait CanTransport {
    /// Sends one frame, blocking until it is handed to the bus driver.
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// Blocks up to the adapter's read timeout for the next frame.
    fn receive_frame(&mut self) -> io::Result<Option<Frame>>;
}

impl<T: CanTransport + ?Sized> CanTransport for &mut T {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        (**self).send_frame(frame)
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        (**self).receive_frame()
    }
}

impl<T: CanTransport + ?Sized> CanTransport for Box<T> {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        (**self).send_frame(frame)
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        (**self).receive_frame()
    }
}
