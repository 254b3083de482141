//! Update firmware using the CVRA bootloading protocol.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use cvra_bootloader::connection::ConnectionArgs;
use cvra_bootloader::executor::format_ids;
use cvra_bootloader::flash::{self, FlashError};
use cvra_bootloader::logging;

#[derive(Parser)]
#[command(
    name = "bootloader-flash",
    about = "Update firmware using the CVRA bootloading protocol."
)]
struct Opts {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Path to the binary file to upload.
    #[arg(short = 'b', long = "binary", value_name = "FILE")]
    binary_file: PathBuf,

    /// Base address of the firmware, in hexadecimal.
    #[arg(
        short = 'a',
        long = "base-address",
        value_name = "ADDRESS",
        value_parser = parse_hex
    )]
    base_address: u32,

    /// Device class to flash.
    #[arg(short = 'c', long = "device-class", value_name = "CLASS")]
    device_class: String,

    /// Run the application after flashing.
    #[arg(short = 'r', long = "run")]
    run: bool,

    /// Flash page size in bytes.
    #[arg(long = "page-size", default_value_t = flash::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Device IDs to flash.
    #[arg(value_name = "DEVICEID", required = true, value_parser = clap::value_parser!(u8).range(1..=127))]
    ids: Vec<u8>,
}

fn parse_hex(raw: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(raw.trim_start_matches("0x"), 16)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logging::setup_logging(false);

    let binary = fs::read(&opts.binary_file)
        .with_context(|| format!("Failed to read {}", opts.binary_file.display()))?;

    let mut conn = opts.connection.open()?;

    let wanted: HashSet<u8> = opts.ids.iter().copied().collect();
    let online = flash::check_online_boards(&mut conn, &opts.ids)?;
    if online != wanted {
        let mut offline: Vec<u8> = wanted.difference(&online).copied().collect();
        offline.sort_unstable();
        eprintln!("Boards {} are offline, aborting...", format_ids(&offline));
        process::exit(2);
    }

    println!("Flashing firmware (size: {} bytes)", binary.len());
    match flash::flash_binary(
        &mut conn,
        &binary,
        opts.base_address,
        &opts.device_class,
        &opts.ids,
        opts.page_size,
    ) {
        Ok(()) => {}
        Err(FlashError::BoardsFailed { .. }) => process::exit(2),
        Err(e) => return Err(e.into()),
    }

    println!("Verifying firmware...");
    let valid: HashSet<u8> = flash::check_binary(&mut conn, &binary, opts.base_address, &opts.ids)?
        .into_iter()
        .collect();
    if valid == wanted {
        println!("OK");
    } else {
        let mut failed: Vec<u8> = wanted.difference(&valid).copied().collect();
        failed.sort_unstable();
        eprintln!("Verification failed for nodes {}", format_ids(&failed));
        process::exit(1);
    }

    if opts.run {
        flash::run_application(&mut conn, &opts.ids)?;
    }

    Ok(())
}
