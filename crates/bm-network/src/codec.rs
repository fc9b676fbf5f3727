//! P2P protocol codec for message framing.
//!
//! Every message is framed as:
//!
//! ```text
//! +----------+--------------+----------+----------+
//! |  Magic   |   Command    |  Length  | Checksum |
//! | 4 bytes  |   12 bytes   | 4 bytes  | 4 bytes  |
//! +----------+--------------+----------+----------+
//! |                    Payload                     |
//! |                 (Length bytes)                 |
//! +------------------------------------------------+
//! ```
//!
//! - Magic: `0xE9BEB4D9`
//! - Command: ASCII, NUL padded
//! - Length: payload length in bytes (big-endian)
//! - Checksum: first 4 bytes of SHA-512(payload)
//!
//! When the buffer does not start with the magic (garbage from a broken
//! peer, or a frame corrupted in flight) the decoder skips ahead to the next
//! occurrence of the magic instead of failing.

use crate::{Message, NetworkError, NetworkResult};
use bm_core::{Cryptography, Sha512Cryptography, NETWORK_MAGIC};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Header size: magic (4) + command (12) + length (4) + checksum (4).
pub const HEADER_SIZE: usize = 24;

/// Size of the command field.
pub const COMMAND_SIZE: usize = 12;

/// Maximum payload size.
pub const MAX_PAYLOAD_SIZE: usize = 1_600_003;

/// Message codec.
pub struct MessageCodec {
    magic: [u8; 4],
    max_size: usize,
    crypto: Arc<dyn Cryptography>,
}

impl MessageCodec {
    /// Create a codec with the network magic.
    pub fn new(crypto: Arc<dyn Cryptography>) -> Self {
        Self {
            magic: NETWORK_MAGIC,
            max_size: MAX_PAYLOAD_SIZE,
            crypto,
        }
    }

    /// Create a codec with custom magic bytes.
    pub fn with_magic(magic: [u8; 4], crypto: Arc<dyn Cryptography>) -> Self {
        Self {
            magic,
            max_size: MAX_PAYLOAD_SIZE,
            crypto,
        }
    }

    /// First 4 bytes of the payload hash.
    fn checksum(&self, payload: &[u8]) -> [u8; 4] {
        let hash = self.crypto.hash(&[payload]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[..4]);
        checksum
    }

    /// Drop bytes up to the next magic. Returns `false` when no complete
    /// magic is buffered; a trailing partial magic is kept.
    fn resync(&self, src: &mut BytesMut) -> bool {
        if src.starts_with(&self.magic) {
            return true;
        }

        let found = src.windows(self.magic.len()).position(|w| w == self.magic);
        let skip = match found {
            Some(pos) => pos,
            None => {
                let keep = (1..self.magic.len())
                    .rev()
                    .find(|&n| src.len() >= n && src[src.len() - n..] == self.magic[..n])
                    .unwrap_or(0);
                src.len() - keep
            }
        };

        if skip > 0 {
            warn!(skipped = skip, "Skipping bytes while looking for frame start");
            src.advance(skip);
        }
        found.is_some()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(Arc::new(Sha512Cryptography))
    }
}

/// Parse the 12-byte command field. Everything after the first NUL must be
/// NUL too, and the command itself must be printable ASCII.
pub fn parse_command(field: &[u8]) -> NetworkResult<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let (command, padding) = field.split_at(end);

    if padding.iter().any(|&b| b != 0) {
        return Err(NetworkError::InvalidCommand(format!(
            "non-NUL byte after command terminator in {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    if command.is_empty() {
        return Err(NetworkError::InvalidCommand("empty command".to_string()));
    }
    if !command.iter().all(|b| b.is_ascii_graphic()) {
        return Err(NetworkError::InvalidCommand(format!(
            "non-ASCII command {:?}",
            String::from_utf8_lossy(command)
        )));
    }

    Ok(String::from_utf8_lossy(command).into_owned())
}

fn encode_command(command: &str) -> NetworkResult<[u8; COMMAND_SIZE]> {
    let bytes = command.as_bytes();
    if bytes.is_empty() || bytes.len() > COMMAND_SIZE || !bytes.iter().all(|b| b.is_ascii_graphic())
    {
        return Err(NetworkError::InvalidCommand(command.to_string()));
    }
    let mut field = [0u8; COMMAND_SIZE];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.resync(src) {
            return Ok(None);
        }

        // Need at least header size
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let command = parse_command(&src[4..16])?;
        let length = u32::from_be_bytes([src[16], src[17], src[18], src[19]]) as usize;
        let checksum: [u8; 4] = [src[20], src[21], src[22], src[23]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload: Bytes = src.split_to(length).freeze();

        let actual = self.checksum(&payload);
        if actual != checksum {
            return Err(NetworkError::ChecksumMismatch {
                expected: hex::encode(checksum),
                actual: hex::encode(actual),
            });
        }

        Message::decode(&command, payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = encode_command(item.command())?;
        let payload = item.encode_payload()?;
        let length = payload.len();

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let checksum = self.checksum(&payload);

        dst.reserve(HEADER_SIZE + length);
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32(length as u32);
        dst.put_slice(&checksum);
        dst.put_slice(&payload);

        Ok(())
    }
}
