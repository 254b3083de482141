//! Send a jump to application command.

use anyhow::Result;
use clap::Parser;

use cvra_bootloader::connection::ConnectionArgs;
use cvra_bootloader::flash;
use cvra_bootloader::logging;
use cvra_bootloader::ops;

#[derive(Parser)]
#[command(
    name = "bootloader-run-app",
    about = "Send a jump to application command."
)]
struct Opts {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Address every node on the bus.
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Device IDs to start.
    #[arg(value_name = "DEVICEID", value_parser = clap::value_parser!(u8).range(1..=127))]
    ids: Vec<u8>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logging::setup_logging(false);

    let ids = if opts.all {
        ops::all_node_ids()
    } else {
        opts.ids.clone()
    };

    let mut conn = opts.connection.open()?;
    flash::run_application(&mut conn, &ids)?;

    Ok(())
}
