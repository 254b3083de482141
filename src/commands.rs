//! Encoding of the bootloader command set.
//!
//! A command is three concatenated MessagePack objects: the command set
//! version, the command code and an argument array. Answers are a single
//! object whose meaning depends on the command.

use std::collections::BTreeMap;

use crate::msgpack::{self, DecodeError, Unpacker, Value};

/// Protocol version spoken by the bootloader firmware.
pub const COMMAND_SET_VERSION: u8 = 2;

/// Command codes understood by the bootloader firmware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandCode {
    JumpToMain = 1,
    CrcRegion = 2,
    Erase = 3,
    Write = 4,
    Ping = 5,
    Read = 6,
    UpdateConfig = 7,
    SaveConfig = 8,
    ReadConfig = 9,
}

/// Key/value configuration map persisted by the target firmware.
pub type Config = BTreeMap<String, Value>;

/// Packs the command set version, the command code and its arguments.
pub fn encode_command(code: CommandCode, arguments: Vec<Value>) -> Vec<u8> {
    let mut out = Vec::new();
    msgpack::pack(&Value::from(COMMAND_SET_VERSION), &mut out);
    msgpack::pack(&Value::UInt(code as u64), &mut out);
    msgpack::pack(&Value::Array(arguments), &mut out);
    out
}

/// Command to jump to the application. The board does not answer it.
pub fn encode_jump_to_main() -> Vec<u8> {
    encode_command(CommandCode::JumpToMain, vec![])
}

/// Command asking for the CRC of a memory region.
pub fn encode_crc_region(address: u32, length: u32) -> Vec<u8> {
    encode_command(
        CommandCode::CrcRegion,
        vec![Value::from(address), Value::from(length)],
    )
}

/// Command to erase the flash page at the given address.
pub fn encode_erase_flash_page(address: u32, device_class: &str) -> Vec<u8> {
    encode_command(
        CommandCode::Erase,
        vec![Value::from(address), Value::from(device_class)],
    )
}

/// Command to write the given data at the given address.
///
/// The payload is carried as a MessagePack binary object, not a string.
pub fn encode_write_flash(data: &[u8], address: u32, device_class: &str) -> Vec<u8> {
    encode_command(
        CommandCode::Write,
        vec![
            Value::from(address),
            Value::from(device_class),
            Value::Bin(data.to_vec()),
        ],
    )
}

pub fn encode_ping() -> Vec<u8> {
    encode_command(CommandCode::Ping, vec![])
}

/// Command to read back a memory region.
pub fn encode_read_memory(address: u32, length: u32) -> Vec<u8> {
    encode_command(
        CommandCode::Read,
        vec![Value::from(address), Value::from(length)],
    )
}

/// Command updating the given config keys. Keys not present in `config`
/// are left unchanged by the firmware.
pub fn encode_update_config(config: &Config) -> Vec<u8> {
    encode_command(CommandCode::UpdateConfig, vec![Value::Map(config.clone())])
}

/// Command persisting the running config to flash.
pub fn encode_save_config() -> Vec<u8> {
    encode_command(CommandCode::SaveConfig, vec![])
}

pub fn encode_read_config() -> Vec<u8> {
    encode_command(CommandCode::ReadConfig, vec![])
}

/// Decodes the single object carried by an answer datagram.
pub fn decode_answer(raw: &[u8]) -> Result<Value, DecodeError> {
    Unpacker::new(raw).unpack()
}

/// Erase, write and config commands answer with a single boolean.
pub fn answer_is_success(raw: &[u8]) -> bool {
    matches!(decode_answer(raw), Ok(Value::Bool(true)))
}
