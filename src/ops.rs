//! Device management flows used by the command line tools.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::commands::{self, Config};
use crate::datagram::DatagramReader;
use crate::executor::{self, CommandError, DEFAULT_RETRY_LIMIT, HOST_SOURCE_ID};
use crate::msgpack::Value;
use crate::transport::CanTransport;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Board {board} did not answer with a config map.")]
    BadAnswer { board: u8 },
    #[error("Changing the ID key requires the dedicated change-id flow.")]
    IdKeyRefused,
}

/// Every addressable node id.
pub fn all_node_ids() -> Vec<u8> {
    (1..=127).collect()
}

/// Broadcasts a ping to the whole bus and reports which nodes answered,
/// in ascending order.
pub fn scan_network<C>(conn: &mut C) -> Result<Vec<u8>, CommandError>
where
    C: CanTransport + ?Sized,
{
    let ids = all_node_ids();
    executor::write_command(conn, &commands::encode_ping(), &ids, HOST_SOURCE_ID)?;

    let mut reader = DatagramReader::new();
    let mut online = Vec::new();
    while let Some(incoming) = reader.receive(conn)? {
        online.push(incoming.source);
    }
    online.sort_unstable();
    online.dedup();
    Ok(online)
}

/// Reads the config map of every given board.
pub fn read_configs<C>(conn: &mut C, ids: &[u8]) -> Result<BTreeMap<u8, Config>, ConfigError>
where
    C: CanTransport + ?Sized,
{
    let answers = executor::write_command_retry(
        conn,
        &commands::encode_read_config(),
        ids,
        HOST_SOURCE_ID,
        DEFAULT_RETRY_LIMIT,
    )?;

    let mut configs = BTreeMap::new();
    for (board, raw) in answers {
        match commands::decode_answer(&raw) {
            Ok(Value::Map(config)) => {
                configs.insert(board, config);
            }
            _ => return Err(ConfigError::BadAnswer { board }),
        }
    }
    Ok(configs)
}

/// Applies a config to the given boards and persists it.
///
/// Refuses maps containing the `ID` key: renumbering goes through
/// [`change_node_id`], which knows that the board answers under its new
/// id.
pub fn write_config<C>(conn: &mut C, config: &Config, ids: &[u8]) -> Result<(), ConfigError>
where
    C: CanTransport + ?Sized,
{
    if config.contains_key("ID") {
        return Err(ConfigError::IdKeyRefused);
    }
    executor::config_update_and_save(conn, config, ids)?;
    Ok(())
}

/// Renumbers a single node: updates `ID` on the old id, then asks the
/// board, now listening under the new id, to save its config.
pub fn change_node_id<C>(conn: &mut C, old: u8, new: u8) -> Result<(), CommandError>
where
    C: CanTransport + ?Sized,
{
    let mut config = Config::new();
    config.insert("ID".to_string(), Value::from(new));

    executor::write_command_retry(
        conn,
        &commands::encode_update_config(&config),
        &[old],
        HOST_SOURCE_ID,
        DEFAULT_RETRY_LIMIT,
    )?;
    executor::write_command_retry(
        conn,
        &commands::encode_save_config(),
        &[new],
        HOST_SOURCE_ID,
        DEFAULT_RETRY_LIMIT,
    )?;
    Ok(())
}
