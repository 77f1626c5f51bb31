use crate::error::FrameError;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Opcodes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Compressed,
    Msg,
}

impl OpCode {
    pub const fn code(self) -> u32 {
        match self {
            OpCode::Compressed => 2012,
            OpCode::Msg => 2013,
        }
    }
}

impl TryFrom<u32> for OpCode {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Msg),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// The fixed 16-byte header preceding every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total frame size, header included.
    pub message_length: u32,
    pub request_id: u32,
    /// Request id this frame answers, 0 for requests.
    pub response_to: u32,
    pub op_code: u32,
}

impl MessageHeader {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.to_le_bytes());
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::LengthMismatch {
                declared: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            message_length: read_u32(bytes, 0),
            request_id: read_u32(bytes, 4),
            response_to: read_u32(bytes, 8),
            op_code: read_u32(bytes, 12),
        })
    }
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
