//! Change a single node ID.

use anyhow::Result;
use clap::Parser;

use cvra_bootloader::connection::ConnectionArgs;
use cvra_bootloader::logging;
use cvra_bootloader::ops;

#[derive(Parser)]
#[command(name = "bootloader-change-id", about = "Change a single node ID.")]
struct Opts {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Old device ID.
    #[arg(value_name = "OLD", value_parser = clap::value_parser!(u8).range(1..=127))]
    old: u8,

    /// New device ID.
    #[arg(value_name = "NEW", value_parser = clap::value_parser!(u8).range(1..=127))]
    new: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logging::setup_logging(false);

    let mut conn = opts.connection.open()?;
    ops::change_node_id(&mut conn, opts.old, opts.new)?;

    Ok(())
}
