use std::fmt;

use thiserror::Error;

/// valid bits in standard frame id
pub const SFF_MASK: u32 = 0x0000_07ff;

/// valid bits in extended frame id
pub const EFF_MASK: u32 = 0x1fff_ffff;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Provided slice of data was longer than 8 bytes.")]
    TooMuchData,
    #[error("Provided ID does not fit the frame format.")]
    IdTooLarge,
}

/// A single CAN frame.
///
/// Pure value type; how a frame is rendered into bytes is the business of
/// the transport adapters. Two frames are equal when their id and payload
/// are equal.
#[derive(Debug, Copy, Clone)]
pub struct Frame {
    id: u32,
    data: [u8; 8],
    data_len: u8,
    extended: bool,
    rtr: bool,
}

impl Frame {
    pub fn new(id: u32, data: &[u8], extended: bool, rtr: bool) -> Result<Frame, FrameError> {
        if data.len() > 8 {
            return Err(FrameError::TooMuchData);
        }

        let mask = if extended { EFF_MASK } else { SFF_MASK };
        if id > mask {
            return Err(FrameError::IdTooLarge);
        }

        let mut full_data = [0; 8];
        full_data[..data.len()].copy_from_slice(data);

        Ok(Frame {
            id,
            data: full_data,
            data_len: data.len() as u8,
            extended,
            rtr,
        })
    }

    /// Standard (11 bit id) data frame.
    pub fn standard(id: u32, data: &[u8]) -> Result<Frame, FrameError> {
        Frame::new(id, data, false, false)
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..(self.data_len as usize)]
    }

    pub fn len(&self) -> usize {
        self.data_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Frame) -> bool {
        self.id == other.id && self.data() == other.data()
    }
}

impl Eq for Frame {}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ID: {:#x} RTR: {} DATA: {:?}",
            self.id(),
            self.is_rtr(),
            self.data()
        )
    }
}

impl fmt::UpperHex for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:X}#", self.id())?;

        let parts: Vec<String> = self.data().iter().map(|v| format!("{:02X}", v)).collect();

        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_longer_than_eight_bytes_is_rejected() {
        let data: Vec<u8> = (0..10).collect();
        assert!(matches!(
            Frame::standard(0x42, &data),
            Err(FrameError::TooMuchData)
        ));
    }

    #[test]
    fn standard_id_is_bounded() {
        assert!(Frame::standard(SFF_MASK, &[]).is_ok());
        assert!(matches!(
            Frame::standard(SFF_MASK + 1, &[]),
            Err(FrameError::IdTooLarge)
        ));
        assert!(Frame::new(SFF_MASK + 1, &[], true, false).is_ok());
    }

    #[test]
    fn equality_ignores_flags() {
        let a = Frame::new(0x42, &[1, 2, 3], false, false).unwrap();
        let b = Frame::new(0x42, &[1, 2, 3], false, true).unwrap();
        let c = Frame::new(0x42, &[1, 2], false, false).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn payload_is_truncated_to_declared_length() {
        let frame = Frame::standard(0x10, &[0xAA, 0xBB]).unwrap();
        assert_eq!(frame.data(), &[0xAA, 0xBB]);
        assert_eq!(frame.len(), 2);
    }
}
