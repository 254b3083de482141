//! Host side client for the CVRA CAN bootloader.
//!
//! A fleet of embedded nodes sits on a shared CAN bus, each identified
//! by a 7-bit node id. The host drives them with multi-destination
//! commands: erase a flash page, write a chunk, query a region CRC,
//! update and save the config, jump to the application. Every addressed
//! node answers with a single datagram.
//!
//! # Protocol stack
//!
//! A CAN frame carries at most 8 payload bytes, so commands travel as
//! *datagrams*: versioned, CRC-32 protected messages fragmented across
//! frames ([`datagram`]). The low 7 bits of each frame id name the
//! emitting node and bit 7 marks the start of a datagram, which lets the
//! receiver reassemble streams interleaved across sources. Commands
//! themselves are MessagePack objects ([`msgpack`], [`commands`]).
//!
//! The bus is reached through one of three interchangeable transports
//! ([`CanTransport`]): a native SocketCAN socket ([`socketcan`]), a UART
//! bridge speaking CRC-protected serial framing ([`framing`],
//! [`serial_can`]) or an slcan ASCII dongle ([`slcan`]). Traffic can be
//! traced to a Wireshark compatible file ([`pcap`]).
//!
//! On top, the executor ([`executor`]) broadcasts a command, collects
//! the interleaved answers and retries silent boards; the flash pipeline
//! ([`flash`]) and the management flows ([`ops`]) drive it.

pub mod bridge;
pub mod commands;
pub mod connection;
pub mod datagram;
pub mod executor;
pub mod flash;
pub mod frame;
pub mod framing;
pub mod logging;
pub mod msgpack;
pub mod ops;
pub mod pcap;
pub mod serial_can;
pub mod slcan;
pub mod socketcan;
pub mod transport;

pub use crate::frame::{Frame, FrameError};
pub use crate::transport::CanTransport;

#[cfg(test)]
pub(crate) mod test_bus;
