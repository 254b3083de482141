//! Read board configs and dump them as JSON.

use anyhow::Result;
use clap::Parser;

use cvra_bootloader::connection::ConnectionArgs;
use cvra_bootloader::logging;
use cvra_bootloader::msgpack::{self, Value};
use cvra_bootloader::ops;

#[derive(Parser)]
#[command(
    name = "bootloader-read-config",
    about = "Read board configs and dump them as JSON."
)]
struct Opts {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Scan the whole network instead of naming boards.
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Device IDs to query.
    #[arg(value_name = "DEVICEID", value_parser = clap::value_parser!(u8).range(1..=127))]
    ids: Vec<u8>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logging::setup_logging(false);

    let mut conn = opts.connection.open()?;

    let targets = if opts.all {
        ops::scan_network(&mut conn)?
    } else {
        opts.ids.clone()
    };

    let configs = ops::read_configs(&mut conn, &targets)?;

    let mut dump = serde_json::Map::new();
    for (board, config) in configs {
        dump.insert(board.to_string(), msgpack::to_json(&Value::Map(config)));
    }
    println!("{}", serde_json::to_string_pretty(&serde_json::Value::Object(dump))?);

    Ok(())
}
