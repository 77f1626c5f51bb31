use std::sync::Arc;

use bson::Document;

use super::compression::{Compressor, CompressorRegistry};
use super::flags::MessageFlags;
use super::header::{read_u32, MessageHeader, OpCode, HEADER_LEN};
use super::message::{Message, Section};
use crate::error::FrameError;

/// Maximum message size accepted before the server reports its own limit.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

const SECTION_BODY: u8 = 0;
const SECTION_SEQUENCE: u8 = 1;
const COMPRESSED_PREFIX_LEN: usize = 9;

// Commands whose bodies must never travel compressed.
const UNCOMPRESSIBLE_COMMANDS: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "saslStart",
    "saslContinue",
    "getnonce",
    "authenticate",
    "createUser",
    "updateUser",
];

/// Encode one document with the external document codec.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>, FrameError> {
    Ok(bson::to_vec(doc)?)
}

/// Decode one document with the external document codec.
pub fn decode_document(bytes: &[u8]) -> Result<Document, FrameError> {
    Ok(bson::from_slice(bytes)?)
}

/// Converts [`Message`]s to wire frames and back.
///
/// Decoding understands every compressor in the registry; encoding compresses
/// with the negotiated outbound compressor, if any.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: CompressorRegistry,
    outbound: Option<Arc<dyn Compressor>>,
    max_message_size: usize,
    checksum: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(CompressorRegistry::default())
    }
}

impl FrameCodec {
    pub fn new(registry: CompressorRegistry) -> Self {
        Self {
            registry,
            outbound: None,
            max_message_size: MAX_MESSAGE_SIZE,
            checksum: false,
        }
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Compress outgoing messages with `compressor`.
    pub fn with_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.outbound = compressor;
        self
    }

    /// Append a CRC-32C checksum to every uncompressed outgoing message.
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    pub fn registry(&self) -> &CompressorRegistry {
        &self.registry
    }

    pub fn compressor(&self) -> Option<&Arc<dyn Compressor>> {
        self.outbound.as_ref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Serialize `message` into one OP_MSG or OP_COMPRESSED frame.
    ///
    /// `CHECKSUM_PRESENT` belongs to the codec, not the message: it is set when
    /// the codec (or the message) asks for a checksum and always cleared on
    /// compressed frames. Decoding returns the flag as written on the wire, so
    /// `decode(encode(m))` matches `m` with that bit masked out.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, FrameError> {
        let bodies = message
            .sections
            .iter()
            .filter(|s| matches!(s, Section::Body(_)))
            .count();
        if bodies != 1 {
            return Err(FrameError::MalformedSection(format!(
                "expected exactly one body section, found {bodies}"
            )));
        }

        let compressor = self
            .outbound
            .as_ref()
            .filter(|_| is_compressible(message));
        let checksum = compressor.is_none()
            && (self.checksum || message.flags.contains(MessageFlags::CHECKSUM_PRESENT));

        let mut flags = message.flags;
        if checksum {
            flags.insert(MessageFlags::CHECKSUM_PRESENT);
        } else {
            flags.remove(MessageFlags::CHECKSUM_PRESENT);
        }

        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&flags.bits().to_le_bytes());
        for section in &message.sections {
            write_section(&mut payload, section)?;
        }

        let frame = match compressor {
            None => {
                let total = HEADER_LEN + payload.len() + if checksum { 4 } else { 0 };
                self.check_size(total)?;

                let mut frame = Vec::with_capacity(total);
                MessageHeader {
                    message_length: total as u32,
                    request_id: message.request_id,
                    response_to: message.response_to,
                    op_code: OpCode::Msg.code(),
                }
                .write_to(&mut frame);
                frame.extend_from_slice(&payload);
                if checksum {
                    let crc = crc32c::crc32c(&frame);
                    frame.extend_from_slice(&crc.to_le_bytes());
                }
                frame
            }
            Some(compressor) => {
                let compressed = compressor.compress(&payload)?;
                let total = HEADER_LEN + COMPRESSED_PREFIX_LEN + compressed.len();
                self.check_size(total)?;

                let mut frame = Vec::with_capacity(total);
                MessageHeader {
                    message_length: total as u32,
                    request_id: message.request_id,
                    response_to: message.response_to,
                    op_code: OpCode::Compressed.code(),
                }
                .write_to(&mut frame);
                frame.extend_from_slice(&OpCode::Msg.code().to_le_bytes());
                frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
                frame.push(compressor.id());
                frame.extend_from_slice(&compressed);
                frame
            }
        };

        Ok(frame)
    }

    /// Decode one complete frame, header included.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, FrameError> {
        let header = MessageHeader::parse(frame)?;
        let declared = header.message_length as usize;
        if declared != frame.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }
        self.check_size(declared)?;

        match OpCode::try_from(header.op_code)? {
            OpCode::Msg => parse_msg(&header, &frame[HEADER_LEN..], || {
                crc32c::crc32c(&frame[..frame.len() - 4])
            }),
            OpCode::Compressed => self.decode_compressed(&header, &frame[HEADER_LEN..]),
        }
    }

    fn decode_compressed(&self, header: &MessageHeader, body: &[u8]) -> Result<Message, FrameError> {
        if body.len() < COMPRESSED_PREFIX_LEN {
            return Err(FrameError::MalformedSection(
                "compressed frame shorter than its prefix".to_string(),
            ));
        }

        let original_opcode = read_u32(body, 0);
        let uncompressed_size = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        let compressor_id = body[8];

        if uncompressed_size < 0 || uncompressed_size as usize > self.max_message_size {
            return Err(FrameError::TooLarge {
                size: uncompressed_size.max(0) as usize,
                max: self.max_message_size,
            });
        }
        let uncompressed_size = uncompressed_size as usize;

        let compressor = self
            .registry
            .by_id(compressor_id)
            .ok_or(FrameError::UnknownCompressor(compressor_id))?;
        let payload = compressor.decompress(&body[COMPRESSED_PREFIX_LEN..], uncompressed_size)?;
        if payload.len() != uncompressed_size {
            return Err(FrameError::LengthMismatch {
                declared: uncompressed_size,
                actual: payload.len(),
            });
        }

        if OpCode::try_from(original_opcode)? != OpCode::Msg {
            return Err(FrameError::UnknownOpcode(original_opcode));
        }

        let inner = MessageHeader {
            message_length: (HEADER_LEN + payload.len()) as u32,
            op_code: original_opcode,
            ..*header
        };
        parse_msg(&inner, &payload, || {
            let mut covered = Vec::with_capacity(inner.message_length as usize);
            inner.write_to(&mut covered);
            covered.extend_from_slice(&payload[..payload.len() - 4]);
            crc32c::crc32c(&covered)
        })
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_message_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn is_compressible(message: &Message) -> bool {
    match message.body().and_then(|body| body.keys().next()) {
        Some(command) => !UNCOMPRESSIBLE_COMMANDS.contains(&command.as_str()),
        None => true,
    }
}

fn write_section(buf: &mut Vec<u8>, section: &Section) -> Result<(), FrameError> {
    match section {
        Section::Body(doc) => {
            buf.push(SECTION_BODY);
            buf.extend_from_slice(&encode_document(doc)?);
        }
        Section::Sequence {
            identifier,
            documents,
        } => {
            if identifier.as_bytes().contains(&0) {
                return Err(FrameError::MalformedSection(format!(
                    "sequence identifier {identifier:?} contains a NUL byte"
                )));
            }

            buf.push(SECTION_SEQUENCE);
            let size_at = buf.len();
            buf.extend_from_slice(&[0u8; 4]);
            buf.extend_from_slice(identifier.as_bytes());
            buf.push(0);
            for doc in documents {
                buf.extend_from_slice(&encode_document(doc)?);
            }
            let size = (buf.len() - size_at) as i32;
            buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
        }
    }
    Ok(())
}

fn parse_msg(
    header: &MessageHeader,
    payload: &[u8],
    checksum_of_prefix: impl FnOnce() -> u32,
) -> Result<Message, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::MalformedSection(
            "message has no flag bits".to_string(),
        ));
    }

    let flags = MessageFlags::from_bits(read_u32(payload, 0))?;
    let mut end = payload.len();

    if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
        if end < 8 {
            return Err(FrameError::MalformedSection(
                "checksum flag set but no room for a checksum".to_string(),
            ));
        }
        end -= 4;
        let expected = read_u32(payload, end);
        let computed = checksum_of_prefix();
        if expected != computed {
            return Err(FrameError::ChecksumMismatch { expected, computed });
        }
    }

    let mut pos = 4;
    let mut sections = Vec::new();
    let mut bodies = 0;

    while pos < end {
        let kind = payload[pos];
        pos += 1;

        match kind {
            SECTION_BODY => {
                let len = document_len(payload, pos, end)?;
                sections.push(Section::Body(decode_document(&payload[pos..pos + len])?));
                pos += len;
                bodies += 1;
            }
            SECTION_SEQUENCE => {
                if pos + 4 > end {
                    return Err(FrameError::MalformedSection(
                        "truncated document sequence size".to_string(),
                    ));
                }
                let size = i32::from_le_bytes([
                    payload[pos],
                    payload[pos + 1],
                    payload[pos + 2],
                    payload[pos + 3],
                ]);
                if size < 5 || pos + size as usize > end {
                    return Err(FrameError::MalformedSection(format!(
                        "document sequence size {size} overruns the message"
                    )));
                }
                let seq_end = pos + size as usize;

                let ident_start = pos + 4;
                let nul = payload[ident_start..seq_end]
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| {
                        FrameError::MalformedSection(
                            "unterminated sequence identifier".to_string(),
                        )
                    })?;
                let identifier = std::str::from_utf8(&payload[ident_start..ident_start + nul])
                    .map_err(|e| {
                        FrameError::MalformedSection(format!("sequence identifier: {e}"))
                    })?
                    .to_string();

                let mut cursor = ident_start + nul + 1;
                let mut documents = Vec::new();
                while cursor < seq_end {
                    let len = document_len(payload, cursor, seq_end)?;
                    documents.push(decode_document(&payload[cursor..cursor + len])?);
                    cursor += len;
                }

                sections.push(Section::Sequence {
                    identifier,
                    documents,
                });
                pos = seq_end;
            }
            other => {
                return Err(FrameError::MalformedSection(format!(
                    "unknown section kind {other}"
                )));
            }
        }
    }

    if bodies != 1 {
        return Err(FrameError::MalformedSection(format!(
            "expected exactly one body section, found {bodies}"
        )));
    }

    Ok(Message {
        request_id: header.request_id,
        response_to: header.response_to,
        flags,
        sections,
    })
}

fn document_len(buf: &[u8], pos: usize, end: usize) -> Result<usize, FrameError> {
    if pos + 4 > end {
        return Err(FrameError::MalformedSection(
            "truncated document length".to_string(),
        ));
    }
    let len = i32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    if len < 5 || pos + len as usize > end {
        return Err(FrameError::MalformedSection(format!(
            "document length {len} overruns its section"
        )));
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::protocol::NoopCompressor;

    fn sample() -> Message {
        Message {
            request_id: 42,
            response_to: 0,
            flags: MessageFlags::NONE,
            sections: vec![Section::Body(doc! { "find": "people", "$db": "data" })],
        }
    }

    #[test]
    fn test_round_trip_body() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&sample()).unwrap();

        assert_eq!(read_u32(&frame, 0) as usize, frame.len());
        assert_eq!(read_u32(&frame, 12), 2013);
        assert_eq!(codec.decode(&frame).unwrap(), sample());
    }

    #[test]
    fn test_round_trip_document_sequence() {
        let codec = FrameCodec::default();
        let message = sample().with_sequence(
            "documents",
            vec![doc! { "foo": "bar" }, doc! { "spam": "eggs" }, doc! {}],
        );

        let frame = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_sequence_layout() {
        let codec = FrameCodec::default();
        let message = Message::command(doc! {}).with_sequence("d", vec![]);
        let frame = codec.encode(&message).unwrap();

        // header, flags, kind 0 + empty doc, kind 1 + size + "d\0"
        let body = &frame[HEADER_LEN..];
        assert_eq!(&body[0..4], &[0, 0, 0, 0]);
        assert_eq!(&body[4..10], &[0, 5, 0, 0, 0, 0]);
        assert_eq!(&body[10..], &[1, 6, 0, 0, 0, b'd', 0]);
    }

    #[test]
    fn test_checksum_is_written_and_verified() {
        let codec = FrameCodec::default().with_checksum(true);
        let frame = codec.encode(&sample()).unwrap();

        let decoded = codec.decode(&frame).unwrap();
        assert!(decoded.flags.contains(MessageFlags::CHECKSUM_PRESENT));
        assert_eq!(decoded.sections, sample().sections);

        let mut corrupted = frame.clone();
        let at = corrupted.len() - 6;
        corrupted[at] ^= 0xff;
        assert!(matches!(
            codec.decode(&corrupted),
            Err(FrameError::ChecksumMismatch { .. }) | Err(FrameError::Document(_))
        ));

        let mut bad_crc = frame;
        let last = bad_crc.len() - 1;
        bad_crc[last] ^= 0x01;
        assert!(matches!(
            codec.decode(&bad_crc),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_covers_frame_prefix() {
        assert_eq!(crc32c::crc32c(b"123456789"), 0xe306_9283);

        let codec = FrameCodec::default().with_checksum(true);
        let frame = codec.encode(&sample()).unwrap();
        let (prefix, trailer) = frame.split_at(frame.len() - 4);
        assert_eq!(
            u32::from_le_bytes(trailer.try_into().unwrap()),
            crc32c::crc32c(prefix)
        );
    }

    #[test]
    fn test_compressed_round_trip() {
        let codec = FrameCodec::default().with_compressor(Some(Arc::new(NoopCompressor)));
        let frame = codec.encode(&sample()).unwrap();

        assert_eq!(read_u32(&frame, 12), 2012);
        assert_eq!(read_u32(&frame, 16), 2013);
        assert_eq!(frame[24], 0);
        assert_eq!(codec.decode(&frame).unwrap(), sample());
    }

    #[test]
    fn test_handshake_is_never_compressed() {
        let codec = FrameCodec::default().with_compressor(Some(Arc::new(NoopCompressor)));
        let frame = codec
            .encode(&Message::command(doc! { "hello": 1, "$db": "admin" }))
            .unwrap();
        assert_eq!(read_u32(&frame, 12), 2013);
    }

    #[test]
    fn test_unknown_compressor_is_rejected() {
        let codec = FrameCodec::default().with_compressor(Some(Arc::new(NoopCompressor)));
        let mut frame = codec.encode(&sample()).unwrap();
        frame[24] = 9;
        assert_eq!(
            codec.decode(&frame).unwrap_err(),
            FrameError::UnknownCompressor(9)
        );
    }

    #[test]
    fn test_length_mismatch() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&sample()).unwrap();
        frame.push(0);

        assert_eq!(
            codec.decode(&frame).unwrap_err(),
            FrameError::LengthMismatch {
                declared: frame.len() - 1,
                actual: frame.len()
            }
        );
    }

    #[test]
    fn test_unknown_opcode() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&sample()).unwrap();
        frame[12..16].copy_from_slice(&2004u32.to_le_bytes());

        assert_eq!(
            codec.decode(&frame).unwrap_err(),
            FrameError::UnknownOpcode(2004)
        );
    }

    #[test]
    fn test_unknown_section_kind() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&sample()).unwrap();
        frame[20] = 7;

        assert!(matches!(
            codec.decode(&frame),
            Err(FrameError::MalformedSection(_))
        ));
    }

    #[test]
    fn test_overrunning_document_length() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&sample()).unwrap();
        frame[21..25].copy_from_slice(&1000i32.to_le_bytes());

        assert!(matches!(
            codec.decode(&frame),
            Err(FrameError::MalformedSection(_))
        ));
    }

    #[test]
    fn test_two_bodies_are_rejected() {
        let codec = FrameCodec::default();
        let mut message = sample();
        message.sections.push(Section::Body(doc! {}));

        assert!(matches!(
            codec.encode(&message),
            Err(FrameError::MalformedSection(_))
        ));
    }

    #[test]
    fn test_too_large() {
        let codec = FrameCodec::default().with_max_message_size(32);
        assert!(matches!(
            codec.encode(&sample()),
            Err(FrameError::TooLarge { max: 32, .. })
        ));
    }
}
