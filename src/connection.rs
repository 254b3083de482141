//! Connection handling shared by the command line tools.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::pcap::PcapTransport;
use crate::serial_can;
use crate::slcan;
use crate::socketcan::SocketCanConnection;
use crate::transport::CanTransport;

/// Connection options shared by every bootloader tool. Exactly one of
/// the serial port and the SocketCAN interface must be given.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Serial port to which the CAN bridge is connected to.
    #[arg(
        short = 'p',
        long = "port",
        value_name = "DEVICE",
        conflicts_with = "can_interface"
    )]
    pub serial_device: Option<String>,

    /// SocketCAN interface, e.g 'can0' (Linux only).
    #[arg(short = 'i', long = "interface", value_name = "INTERFACE")]
    pub can_interface: Option<String>,

    /// The serial device speaks the slcan ASCII protocol instead of the
    /// CAN bridge framing.
    #[arg(long = "slcan", requires = "serial_device")]
    pub slcan: bool,

    /// Log CAN frames to the given file in Wireshark compatible pcap
    /// format.
    #[arg(long = "pcap", value_name = "FILE")]
    pub pcap: Option<PathBuf>,

    /// The device has large pages and requires a longer erase timeout.
    #[arg(long = "large-pages")]
    pub large_pages: bool,
}

impl ConnectionArgs {
    /// Receive timeout matching the target's page erase time.
    pub fn read_timeout(&self) -> Duration {
        if self.large_pages {
            Duration::from_secs(5)
        } else {
            Duration::from_millis(500)
        }
    }

    /// Opens the transport selected on the command line.
    pub fn open(&self) -> Result<Box<dyn CanTransport>> {
        let timeout = self.read_timeout();

        let conn: Box<dyn CanTransport> = if let Some(interface) = &self.can_interface {
            Box::new(
                SocketCanConnection::new(interface, timeout)
                    .with_context(|| format!("Failed to open CAN interface {}", interface))?,
            )
        } else if let Some(device) = &self.serial_device {
            if self.slcan {
                Box::new(
                    slcan::open(device, timeout)
                        .with_context(|| format!("Failed to open slcan device {}", device))?,
                )
            } else {
                Box::new(
                    serial_can::open(device, timeout)
                        .with_context(|| format!("Failed to open serial device {}", device))?,
                )
            }
        } else {
            bail!("You must specify one of --port or --interface");
        };

        if let Some(path) = &self.pcap {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            return Ok(Box::new(PcapTransport::new(conn, file)?));
        }

        Ok(conn)
    }
}
