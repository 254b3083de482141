//! Command set of the UART to CAN bridge firmware.

use thiserror::Error;

use crate::frame::{Frame, FrameError};
use crate::msgpack::{self, DecodeError, Unpacker, Value};

/// Commands understood by the bridge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    SendFrame = 0,
    SetIdFilter = 1,
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Bridge frame field has an unexpected type.")]
    FieldType,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Encodes a frame-send command for the bridge.
pub fn encode_frame_write(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::new();
    msgpack::pack(&Value::UInt(BridgeCommand::SendFrame as u64), &mut out);
    pack_frame(frame, &mut out);
    out
}

/// Encodes an id filter update: the bridge forwards only frames whose id
/// is in the accepted list.
pub fn encode_id_filter(accepted_ids: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    msgpack::pack(&Value::UInt(BridgeCommand::SetIdFilter as u64), &mut out);
    msgpack::pack(
        &Value::Array(accepted_ids.iter().map(|&id| Value::from(id)).collect()),
        &mut out,
    );
    out
}

/// Packs a frame the way the bridge expects it: extended flag, remote
/// transmission request flag, id, then the payload as a binary object.
pub fn pack_frame(frame: &Frame, out: &mut Vec<u8>) {
    msgpack::pack(&Value::Bool(frame.is_extended()), out);
    msgpack::pack(&Value::Bool(frame.is_rtr()), out);
    msgpack::pack(&Value::UInt(u64::from(frame.id())), out);
    msgpack::pack(&Value::Bin(frame.data().to_vec()), out);
}

/// Decodes a frame received from the bridge.
pub fn decode_frame(raw: &[u8]) -> Result<Frame, FrameDecodeError> {
    let mut unpacker = Unpacker::new(raw);

    let extended = unpacker
        .unpack()?
        .as_bool()
        .ok_or(FrameDecodeError::FieldType)?;
    let rtr = unpacker
        .unpack()?
        .as_bool()
        .ok_or(FrameDecodeError::FieldType)?;
    let id = unpacker
        .unpack()?
        .as_u32()
        .ok_or(FrameDecodeError::FieldType)?;
    let data = match unpacker.unpack()? {
        Value::Bin(data) => data,
        _ => return Err(FrameDecodeError::FieldType),
    };

    Frame::new(id, &data, extended, rtr).map_err(FrameDecodeError::Frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_command_starts_with_its_code() {
        let frame = Frame::standard(0x42, &[1, 2]).unwrap();
        let raw = encode_frame_write(&frame);
        assert_eq!(raw[0], 0x00);
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::standard(0x81, b"ping").unwrap();
        let mut raw = Vec::new();
        pack_frame(&frame, &mut raw);

        assert_eq!(decode_frame(&raw).unwrap(), frame);
    }

    #[test]
    fn extended_flag_survives_the_codec() {
        let frame = Frame::new(0x1234_5678, &[9], true, false).unwrap();
        let mut raw = Vec::new();
        pack_frame(&frame, &mut raw);

        let decoded = decode_frame(&raw).unwrap();
        assert!(decoded.is_extended());
        assert_eq!(decoded.id(), 0x1234_5678);
    }

    #[test]
    fn field_order_is_flags_id_data() {
        let frame = Frame::standard(0x10, &[0xAB]).unwrap();
        let mut raw = Vec::new();
        pack_frame(&frame, &mut raw);

        // false, false, fixint id, bin8 payload
        assert_eq!(raw, [0xC2, 0xC2, 0x10, 0xC4, 0x01, 0xAB]);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = Frame::standard(0x10, &[0xAB]).unwrap();
        let mut raw = Vec::new();
        pack_frame(&frame, &mut raw);
        raw.pop();

        assert!(decode_frame(&raw).is_err());
    }

    #[test]
    fn id_filter_command_layout() {
        let raw = encode_id_filter(&[0x01, 0x81]);
        let mut unpacker = Unpacker::new(&raw);
        assert_eq!(unpacker.unpack().unwrap(), Value::UInt(1));
        assert_eq!(
            unpacker.unpack().unwrap(),
            Value::Array(vec![Value::UInt(0x01), Value::UInt(0x81)])
        );
    }
}
