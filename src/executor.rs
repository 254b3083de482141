//! Fleet command executor.
//!
//! Commands are broadcast to a set of destination nodes as one datagram;
//! every node answers with a datagram of its own. The executor ships the
//! frames, drives the reassembler over the interleaved replies and
//! retries the boards that stay silent, so callers see a per-board
//! answer map instead of a frame stream.

use std::collections::HashMap;
use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::commands::{self, Config};
use crate::datagram::{self, DatagramReader, ProtocolError, ReceiveError};
use crate::transport::CanTransport;

/// Node id the host stamps into outgoing frames.
pub const HOST_SOURCE_ID: u8 = 0;

/// Default number of per-destination retries before giving up.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Pause after each frame burst, letting the target firmware drain its
/// receive queue before the next command arrives.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to exchange frames with the bus.")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("No answer from boards {} after {retries} retries.", format_ids(.missing))]
    RetryLimitExceeded { missing: Vec<u8>, retries: u32 },
}

impl From<ReceiveError> for CommandError {
    fn from(e: ReceiveError) -> CommandError {
        match e {
            ReceiveError::Io(e) => CommandError::Io(e),
            ReceiveError::Protocol(e) => CommandError::Protocol(e),
        }
    }
}

/// Formats a board id list for messages.
pub fn format_ids(ids: &[u8]) -> String {
    let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    parts.join(", ")
}

/// Fragments `command` into frames addressed to `destinations` and ships
/// them, then waits the settle delay.
pub fn write_command<C>(
    conn: &mut C,
    command: &[u8],
    destinations: &[u8],
    source: u8,
) -> io::Result<()>
where
    C: CanTransport + ?Sized,
{
    let raw = datagram::encode_datagram(command, destinations);
    for frame in datagram::datagram_to_frames(&raw, source) {
        conn.send_frame(&frame)?;
    }
    thread::sleep(SETTLE_DELAY);
    Ok(())
}

/// Broadcasts `command` and collects one answer per destination,
/// re-soliciting only the boards that stay silent.
///
/// Returns the raw answer payload of every destination. After
/// `retry_limit` unsuccessful retries the remaining boards are reported
/// in [`CommandError::RetryLimitExceeded`]; boards that already answered
/// are never contacted again, so side effects are not duplicated.
pub fn write_command_retry<C>(
    conn: &mut C,
    command: &[u8],
    destinations: &[u8],
    source: u8,
    retry_limit: u32,
) -> Result<HashMap<u8, Vec<u8>>, CommandError>
where
    C: CanTransport + ?Sized,
{
    write_command(conn, command, destinations, source)?;

    let mut reader = DatagramReader::new();
    let mut answers: HashMap<u8, Vec<u8>> = HashMap::new();
    let mut retry_count = 0;

    while answers.len() < destinations.len() {
        match reader.receive(conn) {
            Ok(Some(incoming)) => {
                answers.insert(incoming.source, incoming.data);
            }
            Ok(None) => {
                let missing = missing_boards(destinations, &answers);
                if retry_count == retry_limit {
                    log::error!("No answer, aborting...");
                    return Err(CommandError::RetryLimitExceeded {
                        missing,
                        retries: retry_count,
                    });
                }

                log::warn!(
                    "The following boards did not answer: {}, retrying..",
                    format_ids(&missing)
                );
                write_command(conn, command, &missing, source)?;
                retry_count += 1;
            }
            Err(ReceiveError::Protocol(ProtocolError::CrcMismatch { .. })) => {
                // Corrupted answer; the next retry pass solicits that
                // board again.
                log::warn!("Dropping an answer datagram with a bad CRC.");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(answers)
}

fn missing_boards(destinations: &[u8], answers: &HashMap<u8, Vec<u8>>) -> Vec<u8> {
    destinations
        .iter()
        .copied()
        .filter(|id| !answers.contains_key(id))
        .collect()
}

/// Checks if a board is up.
///
/// Any datagram coming back from the board counts as a pong; the answer
/// payload is not inspected.
pub fn ping_board<C>(conn: &mut C, destination: u8) -> Result<bool, CommandError>
where
    C: CanTransport + ?Sized,
{
    write_command(conn, &commands::encode_ping(), &[destination], HOST_SOURCE_ID)?;

    let mut reader = DatagramReader::new();
    Ok(reader.receive(conn)?.is_some())
}

/// Updates the config of the given destinations, then asks them to
/// persist it to flash.
pub fn config_update_and_save<C>(
    conn: &mut C,
    config: &Config,
    destinations: &[u8],
) -> Result<(), CommandError>
where
    C: CanTransport + ?Sized,
{
    write_command_retry(
        conn,
        &commands::encode_update_config(config),
        destinations,
        HOST_SOURCE_ID,
        DEFAULT_RETRY_LIMIT,
    )?;
    write_command_retry(
        conn,
        &commands::encode_save_config(),
        destinations,
        HOST_SOURCE_ID,
        DEFAULT_RETRY_LIMIT,
    )?;
    Ok(())
}
