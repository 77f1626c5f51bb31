//! Wire protocol definitions
//!
//! Messages travel as length-prefixed frames:
//! - **Header**: `[message_length][request_id][response_to][op_code]`, four
//!   little-endian 32-bit integers (16 bytes). `message_length` includes the header.
//! - **OP_MSG** (2013): `[flag_bits: u32][sections...][checksum: u32, optional]`
//!   - kind 0: a single body document
//!   - kind 1: `[size: i32][identifier\0][documents...]`
//! - **OP_COMPRESSED** (2012): `[original_opcode][uncompressed_size][compressor_id: u8][payload]`
//!
//! Documents are encoded with the external codec in [`codec`].

pub mod codec;
pub mod compression;
pub mod flags;
pub mod header;
pub mod message;
pub mod reply;

pub use codec::{decode_document, encode_document, FrameCodec, MAX_MESSAGE_SIZE};
pub use compression::{
    Compressor, CompressorRegistry, NoopCompressor, SnappyCompressor, ZlibCompressor,
    ZstdCompressor,
};
pub use flags::MessageFlags;
pub use header::{MessageHeader, OpCode, HEADER_LEN};
pub use message::{Message, Section};
