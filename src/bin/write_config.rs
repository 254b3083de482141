//! Update config key/value pairs on boards.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;

use cvra_bootloader::connection::ConnectionArgs;
use cvra_bootloader::logging;
use cvra_bootloader::msgpack::{self, Value};
use cvra_bootloader::ops;

#[derive(Parser)]
#[command(
    name = "bootloader-write-config",
    about = "Update config key/value pairs on boards.",
    after_help = "The configuration must be a JSON-encoded map. Example: {\"name\":\"foo\"}"
)]
struct Opts {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// JSON file to load the config from (defaults to stdin).
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Device IDs to update.
    #[arg(value_name = "DEVICEID", required = true, value_parser = clap::value_parser!(u8).range(1..=127))]
    ids: Vec<u8>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logging::setup_logging(false);

    let raw = match &opts.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let json: serde_json::Value = serde_json::from_str(&raw).context("Invalid JSON config")?;
    let config = match msgpack::from_json(&json) {
        Value::Map(config) => config,
        _ => bail!("The configuration must be a JSON map."),
    };

    if config.contains_key("ID") {
        eprintln!("This tool cannot be used to change node IDs.");
        eprintln!("Use bootloader-change-id instead.");
        process::exit(2);
    }

    let mut conn = opts.connection.open()?;
    ops::write_config(&mut conn, &config, &opts.ids)?;

    Ok(())
}
