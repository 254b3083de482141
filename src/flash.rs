//! The firmware flashing pipeline.
//!
//! Flashing a binary is erase, write, commit, verify: every page covering
//! the image is erased first, the image is written in bounded chunks, the
//! application size and CRC are committed to the board config, and a
//! final CRC query checks what actually landed in flash.

use std::collections::{HashMap, HashSet};
use std::io;

use thiserror::Error;

use crate::commands::{self, Config};
use crate::datagram::DatagramReader;
use crate::executor::{self, format_ids, CommandError, DEFAULT_RETRY_LIMIT, HOST_SOURCE_ID};
use crate::msgpack::Value;
use crate::transport::CanTransport;

/// Largest payload carried by a single write command. Must not exceed the
/// page size, so a chunk never spans an unerased page.
pub const CHUNK_SIZE: usize = 2048;

/// Default flash page size of the supported targets.
pub const DEFAULT_PAGE_SIZE: usize = 2048;

/// Consecutive timeout ticks tolerated while draining verification
/// answers before the remaining boards are declared silent.
const VERIFY_IDLE_TICK_LIMIT: u32 = 3;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Boards {} failed during {}, aborting...", format_ids(.boards), .stage)]
    BoardsFailed {
        stage: &'static str,
        boards: Vec<u8>,
    },
}

/// Writes `binary` to every destination.
///
/// Erases all pages covering `[base_address, base_address + len)`, writes
/// the image in [`CHUNK_SIZE`] pieces and finally commits
/// `application_size` and `application_crc` to the board config. Any
/// board rejecting an erase or a write aborts the pipeline.
pub fn flash_binary<C>(
    conn: &mut C,
    binary: &[u8],
    base_address: u32,
    device_class: &str,
    destinations: &[u8],
    page_size: usize,
) -> Result<(), FlashError>
where
    C: CanTransport + ?Sized,
{
    log::info!("Erasing pages...");
    let mut offset = 0;
    while offset < binary.len() {
        let command = commands::encode_erase_flash_page(base_address + offset as u32, device_class);
        let answers = executor::write_command_retry(
            conn,
            &command,
            destinations,
            HOST_SOURCE_ID,
            DEFAULT_RETRY_LIMIT,
        )?;
        check_acknowledgements(&answers, "page erase")?;
        offset += page_size;
    }

    log::info!("Writing pages...");
    for (index, chunk) in binary.chunks(CHUNK_SIZE).enumerate() {
        let address = base_address + (index * CHUNK_SIZE) as u32;
        let command = commands::encode_write_flash(chunk, address, device_class);
        let answers = executor::write_command_retry(
            conn,
            &command,
            destinations,
            HOST_SOURCE_ID,
            DEFAULT_RETRY_LIMIT,
        )?;
        check_acknowledgements(&answers, "page write")?;
    }

    let mut config = Config::new();
    config.insert(
        "application_size".to_string(),
        Value::from(binary.len()),
    );
    config.insert(
        "application_crc".to_string(),
        Value::from(crc32fast::hash(binary)),
    );
    executor::config_update_and_save(conn, &config, destinations)?;

    Ok(())
}

fn check_acknowledgements(
    answers: &HashMap<u8, Vec<u8>>,
    stage: &'static str,
) -> Result<(), FlashError> {
    let mut failed: Vec<u8> = answers
        .iter()
        .filter(|(_, raw)| !commands::answer_is_success(raw))
        .map(|(&id, _)| id)
        .collect();

    if failed.is_empty() {
        return Ok(());
    }
    failed.sort_unstable();
    log::error!(
        "Boards {} failed during {}, aborting...",
        format_ids(&failed),
        stage
    );
    Err(FlashError::BoardsFailed {
        stage,
        boards: failed,
    })
}

/// Checks that the binary was correctly written to all destinations.
///
/// Asks every board for the CRC of the flashed region with a single
/// broadcast and returns the boards whose CRC matches. Deliberately no
/// retry here: a board that stays silent is missing from the result, so
/// silent-node conditions surface instead of being papered over.
pub fn check_binary<C>(
    conn: &mut C,
    binary: &[u8],
    base_address: u32,
    destinations: &[u8],
) -> Result<Vec<u8>, FlashError>
where
    C: CanTransport + ?Sized,
{
    let expected_crc = u64::from(crc32fast::hash(binary));
    let command = commands::encode_crc_region(base_address, binary.len() as u32);
    executor::write_command(conn, &command, destinations, HOST_SOURCE_ID)
        .map_err(CommandError::Io)?;

    let mut reader = DatagramReader::new();
    let mut valid = Vec::new();
    let mut answered = 0;
    let mut idle_ticks = 0;

    while answered < destinations.len() {
        match reader.receive(conn) {
            Ok(Some(incoming)) => {
                idle_ticks = 0;
                answered += 1;
                match commands::decode_answer(&incoming.data) {
                    Ok(Value::UInt(crc)) if crc == expected_crc => valid.push(incoming.source),
                    _ => log::warn!("Board {} reports a CRC mismatch.", incoming.source),
                }
            }
            Ok(None) => {
                idle_ticks += 1;
                if idle_ticks > VERIFY_IDLE_TICK_LIMIT {
                    log::warn!(
                        "Verification drain timed out with {} board(s) still silent.",
                        destinations.len() - answered
                    );
                    break;
                }
            }
            Err(e) => return Err(FlashError::Command(e.into())),
        }
    }

    valid.sort_unstable();
    Ok(valid)
}

/// Returns the subset of `boards` answering a ping.
pub fn check_online_boards<C>(conn: &mut C, boards: &[u8]) -> Result<HashSet<u8>, FlashError>
where
    C: CanTransport + ?Sized,
{
    executor::write_command(conn, &commands::encode_ping(), boards, HOST_SOURCE_ID)
        .map_err(CommandError::Io)?;

    let mut reader = DatagramReader::new();
    let mut online = HashSet::new();
    loop {
        match reader.receive(conn) {
            Ok(Some(incoming)) => {
                online.insert(incoming.source);
            }
            Ok(None) => break,
            Err(e) => return Err(FlashError::Command(e.into())),
        }
    }
    Ok(online)
}

/// Asks the given boards to run the application. Boards jump immediately
/// and never answer this command.
pub fn run_application<C>(conn: &mut C, destinations: &[u8]) -> io::Result<()>
where
    C: CanTransport + ?Sized,
{
    executor::write_command(
        conn,
        &commands::encode_jump_to_main(),
        destinations,
        HOST_SOURCE_ID,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandCode;
    use crate::test_bus::RespondingBus;

    const BASE: u32 = 0x1000;

    fn code(value: CommandCode) -> u8 {
        value as u8
    }

    fn always_ok(crc: u32) -> impl FnMut(u8, &[Value], u8) -> Option<Value> {
        move |command, _args, _node| match command {
            c if c == code(CommandCode::Ping) => Some(Value::Bool(true)),
            c if c == code(CommandCode::Erase) => Some(Value::Bool(true)),
            c if c == code(CommandCode::Write) => Some(Value::Bool(true)),
            c if c == code(CommandCode::UpdateConfig) => Some(Value::Bool(true)),
            c if c == code(CommandCode::SaveConfig) => Some(Value::Bool(true)),
            c if c == code(CommandCode::CrcRegion) => Some(Value::from(crc)),
            _ => None,
        }
    }

    #[test]
    fn pipeline_success_path() {
        let binary: Vec<u8> = (0..4100).map(|i| i as u8).collect();
        let crc = crc32fast::hash(&binary);
        let mut bus = RespondingBus::new(always_ok(crc));

        flash_binary(&mut bus, &binary, BASE, "dummy", &[1, 2], DEFAULT_PAGE_SIZE).unwrap();
        let valid = check_binary(&mut bus, &binary, BASE, &[1, 2]).unwrap();
        assert_eq!(valid, vec![1, 2]);

        let log = bus.commands();

        // Page-aligned erases covering the whole image come first.
        let erase_addresses: Vec<u64> = log
            .iter()
            .filter(|entry| entry.code == code(CommandCode::Erase))
            .map(|entry| entry.args[0].as_u64().unwrap())
            .collect();
        assert_eq!(erase_addresses, vec![0x1000, 0x1800, 0x2000]);

        let first_write = log
            .iter()
            .position(|entry| entry.code == code(CommandCode::Write))
            .unwrap();
        let last_erase = log
            .iter()
            .rposition(|entry| entry.code == code(CommandCode::Erase))
            .unwrap();
        assert!(last_erase < first_write);

        // Chunked writes reassemble the image at the right addresses.
        let mut written = vec![0u8; binary.len()];
        for entry in log.iter().filter(|entry| entry.code == code(CommandCode::Write)) {
            let address = entry.args[0].as_u64().unwrap() as usize - BASE as usize;
            assert_eq!(entry.args[1].as_str().unwrap(), "dummy");
            let data = entry.args[2].as_bin().unwrap();
            assert!(data.len() <= CHUNK_SIZE);
            written[address..address + data.len()].copy_from_slice(data);
        }
        assert_eq!(written, binary);

        // The config commit carries the size and CRC, then saves.
        let update = log
            .iter()
            .find(|entry| entry.code == code(CommandCode::UpdateConfig))
            .unwrap();
        let config = update.args[0].as_map().unwrap();
        assert_eq!(config["application_size"], Value::from(binary.len()));
        assert_eq!(config["application_crc"], Value::from(crc));

        let update_index = log
            .iter()
            .position(|entry| entry.code == code(CommandCode::UpdateConfig))
            .unwrap();
        let save_index = log
            .iter()
            .position(|entry| entry.code == code(CommandCode::SaveConfig))
            .unwrap();
        assert!(update_index < save_index);
    }

    #[test]
    fn erase_nack_aborts_the_pipeline() {
        let binary = vec![0u8; 16];
        let mut bus = RespondingBus::new(|command, _args, node| match command {
            3 => Some(Value::Bool(node == 3)),
            _ => Some(Value::Bool(true)),
        });

        let err = flash_binary(&mut bus, &binary, BASE, "dummy", &[1, 2, 3], 2048).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Boards 1, 2 failed during page erase, aborting..."
        );
    }

    #[test]
    fn write_nack_aborts_the_pipeline() {
        let binary = vec![0u8; 16];
        let mut bus = RespondingBus::new(|command, _args, _node| match command {
            4 => Some(Value::Bool(false)),
            _ => Some(Value::Bool(true)),
        });

        let err = flash_binary(&mut bus, &binary, BASE, "dummy", &[7], 2048).unwrap_err();
        assert!(matches!(
            err,
            FlashError::BoardsFailed {
                stage: "page write",
                ..
            }
        ));
    }

    #[test]
    fn verification_reports_matching_boards_only() {
        let binary = vec![0xAB; 64];
        let crc = crc32fast::hash(&binary);
        let mut bus = RespondingBus::new(move |command, _args, node| match command {
            2 if node == 1 => Some(Value::from(crc)),
            2 => Some(Value::from(crc ^ 1)),
            _ => Some(Value::Bool(true)),
        });

        let valid = check_binary(&mut bus, &binary, BASE, &[1, 2]).unwrap();
        assert_eq!(valid, vec![1]);
    }

    #[test]
    fn silent_boards_fail_verification() {
        let binary = vec![0xAB; 64];
        let crc = crc32fast::hash(&binary);
        let mut bus = RespondingBus::new(move |command, _args, node| match command {
            2 if node == 1 => Some(Value::from(crc)),
            2 => None,
            _ => Some(Value::Bool(true)),
        });

        let valid = check_binary(&mut bus, &binary, BASE, &[1, 2]).unwrap();
        assert_eq!(valid, vec![1]);
    }

    #[test]
    fn online_check_reports_answering_boards() {
        let mut bus = RespondingBus::new(|command, _args, node| match command {
            5 if node != 2 => Some(Value::Bool(true)),
            _ => None,
        });

        let online = check_online_boards(&mut bus, &[1, 2, 3]).unwrap();
        let expected: HashSet<u8> = [1, 3].iter().copied().collect();
        assert_eq!(online, expected);
    }

    #[test]
    fn run_application_is_fire_and_forget() {
        let mut bus = RespondingBus::new(|_command, _args, _node| None);
        run_application(&mut bus, &[1, 2]).unwrap();

        let log = bus.commands();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].code, code(CommandCode::JumpToMain));
        assert_eq!(log[0].destinations, vec![1, 2]);
    }
}
