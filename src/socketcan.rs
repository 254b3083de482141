//! Native SocketCAN transport adapter.
//!
//! The Linux kernel exposes CAN devices through a network-like API (see
//! https://www.kernel.org/doc/Documentation/networking/can.txt). This
//! adapter opens a raw CAN socket on a named interface and speaks the
//! [`CanTransport`] capability over it, without having to wrestle libc
//! calls elsewhere in the crate.

use std::io;
use std::mem::size_of;
use std::os::unix::prelude::*;
use std::time::Duration;

use libc::{c_int, c_short};
use thiserror::Error;

use crate::frame::{Frame, EFF_MASK, SFF_MASK};
use crate::transport::CanTransport;

// constants stolen from C headers
const AF_CAN: c_int = 29;
const PF_CAN: c_int = 29;
const CAN_RAW: c_int = 1;

/// if set, indicate 29 bit extended format
const EFF_FLAG: u32 = 0x8000_0000;

/// remote transmission request flag
const RTR_FLAG: u32 = 0x4000_0000;

/// error flag
const ERR_FLAG: u32 = 0x2000_0000;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("Target CAN network couldn't be found.")]
    LookupError(#[source] nix::Error),
    #[error("Failed to access or set-up CAN network socket.")]
    IOError(#[source] io::Error),
}

#[derive(Debug)]
#[repr(C, align(8))]
struct CanAddr {
    af_can: c_short,
    if_index: c_int,
}

impl CanAddr {
    fn new(interface_index: u32) -> Self {
        Self {
            af_can: AF_CAN as c_short,
            if_index: interface_index as c_int,
        }
    }
}

/// Kernel `can_frame` struct; same memory layout so it can be read and
/// written through the socket directly.
#[derive(Debug, Copy, Clone)]
#[repr(C, align(8))]
struct KernelFrame {
    /// 32 bit CAN_ID + EFF/RTR/ERR flags
    id: u32,
    /// data length. Bytes beyond are not valid
    data_len: u8,
    /// padding
    pad: u8,
    /// reserved
    res0: u8,
    /// reserved
    res1: u8,
    /// buffer for data
    data: [u8; 8],
}

impl Default for KernelFrame {
    fn default() -> Self {
        Self {
            id: 0,
            data_len: 0,
            pad: 0,
            res0: 0,
            res1: 0,
            data: [0; 8],
        }
    }
}

pub struct SocketCanConnection {
    fd: RawFd,
}

impl SocketCanConnection {
    /// Opens a raw CAN socket bound to the given interface (e.g. `can0`)
    /// with the given read timeout.
    pub fn new(interface_name: &str, read_timeout: Duration) -> Result<Self, OpenError> {
        let interface_index =
            nix::net::if_::if_nametoindex(interface_name).map_err(OpenError::LookupError)?;
        let sock_fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };

        if sock_fd == -1 {
            return Err(OpenError::IOError(io::Error::last_os_error()));
        }

        let bind_result = unsafe {
            let addr = CanAddr::new(interface_index);
            let sockaddr_ptr = &addr as *const CanAddr;
            libc::bind(
                sock_fd,
                sockaddr_ptr as *const libc::sockaddr,
                size_of::<CanAddr>() as u32,
            )
        };

        if bind_result == -1 {
            let e = io::Error::last_os_error();
            unsafe {
                libc::close(sock_fd);
            }
            return Err(OpenError::IOError(e));
        }

        let conn = Self { fd: sock_fd };
        conn.set_read_timeout(read_timeout)
            .map_err(OpenError::IOError)?;
        Ok(conn)
    }

    /// Sets the read timeout on the socket.
    ///
    /// A timed-out read surfaces as `Ok(None)` from `receive_frame`, so
    /// this bounds how long one reassembly poll can block.
    pub fn set_read_timeout(&self, duration: Duration) -> io::Result<()> {
        let timeout = libc::timeval {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_usec: duration.subsec_micros() as libc::suseconds_t,
        };

        let result = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                size_of::<libc::timeval>() as libc::socklen_t,
            )
        };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let result = unsafe { libc::close(self.fd) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SocketCanConnection {
    fn drop(&mut self) {
        self.close().ok();
    }
}

impl AsRawFd for SocketCanConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl CanTransport for SocketCanConnection {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let mut raw = KernelFrame::default();
        raw.id = frame.id();
        if frame.is_extended() {
            raw.id |= EFF_FLAG;
        }
        if frame.is_rtr() {
            raw.id |= RTR_FLAG;
        }
        raw.data_len = frame.len() as u8;
        raw.data[..frame.len()].copy_from_slice(frame.data());

        let write_result = unsafe {
            let frame_ptr = &raw as *const KernelFrame;
            libc::write(
                self.fd,
                frame_ptr as *const libc::c_void,
                size_of::<KernelFrame>(),
            )
        };

        if write_result as usize != size_of::<KernelFrame>() {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn receive_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let mut raw = KernelFrame::default();
            let read_result = unsafe {
                let frame_ptr = &mut raw as *mut KernelFrame;
                libc::read(
                    self.fd,
                    frame_ptr as *mut libc::c_void,
                    size_of::<KernelFrame>(),
                )
            };

            if read_result as usize != size_of::<KernelFrame>() {
                let e = io::Error::last_os_error();
                if is_timeout(&e) {
                    return Ok(None);
                }
                return Err(e);
            }

            if raw.id & ERR_FLAG != 0 {
                // Kernel error reports are not protocol traffic.
                continue;
            }

            let extended = raw.id & EFF_FLAG != 0;
            let rtr = raw.id & RTR_FLAG != 0;
            let id = if extended {
                raw.id & EFF_MASK
            } else {
                raw.id & SFF_MASK
            };
            let len = (raw.data_len as usize).min(8);

            let frame = Frame::new(id, &raw.data[..len], extended, rtr)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Some(frame));
        }
    }
}

/// Check a read error for timeouts.
///
/// EAGAIN and EWOULDBLOCK are mapped to `WouldBlock` by the stdlib;
/// EINPROGRESS only shows up as a raw os error.
fn is_timeout(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => true,
        _ => {
            if let Some(code) = e.raw_os_error() {
                code == nix::errno::Errno::EINPROGRESS as i32
            } else {
                false
            }
        }
    }
}

#[cfg(all(test, feature = "vcan_tests"))]
mod tests {
    use super::*;
    use serial_test::serial;

    const CAN: &str = "vcan0";

    fn sample_frame() -> Frame {
        Frame::standard(0x80, &[1, 2, 3]).unwrap()
    }

    #[test]
    #[serial]
    fn init() {
        let can = SocketCanConnection::new(CAN, Duration::from_millis(100));
        assert!(can.is_ok());
    }

    #[test]
    #[serial]
    fn init_nonexistent() {
        let can = SocketCanConnection::new("invalid", Duration::from_millis(100));
        assert!(can.is_err());
    }

    #[test]
    #[serial]
    fn read_write() {
        let mut read_can = SocketCanConnection::new(CAN, Duration::from_millis(100)).unwrap();
        let mut write_can = SocketCanConnection::new(CAN, Duration::from_millis(100)).unwrap();

        write_can.send_frame(&sample_frame()).unwrap();
        let frame = read_can.receive_frame().unwrap().unwrap();
        assert_eq!(sample_frame(), frame);
    }

    #[test]
    #[serial]
    fn read_timeout_is_a_tick() {
        let mut can = SocketCanConnection::new(CAN, Duration::from_millis(50)).unwrap();
        assert!(can.receive_frame().unwrap().is_none());
    }
}
