//! P2P protocol messages.
//!
//! Messages are identified by the command string in the frame header; this
//! module only deals with the payload that follows it.

use crate::{NetworkError, NetworkResult};
use bm_core::encoding::{
    ensure_remaining, get_var_int_list, get_var_str, get_varint_bounded, put_var_int_list,
    put_var_str, put_varint,
};
use bm_core::{InventoryVector, NetworkAddress, ObjectEnvelope};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum addresses in one `addr` message.
pub const MAX_ADDRESSES_PER_MESSAGE: usize = 1000;

/// Maximum vectors in one `inv` or `getdata` message.
pub const MAX_VECTORS_PER_MESSAGE: usize = 50_000;

/// Maximum user agent length.
pub const MAX_USER_AGENT_LENGTH: usize = 5000;

/// Maximum number of streams a peer may announce.
pub const MAX_STREAMS_PER_VERSION: usize = 160_000;

/// Maximum length of a custom command name.
const MAX_CUSTOM_COMMAND_LENGTH: usize = 256;

/// Known command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Handshake opener.
    Version,
    /// Handshake acknowledgement.
    Verack,
    /// Known peer addresses.
    Addr,
    /// Inventory announcement.
    Inv,
    /// Object request.
    GetData,
    /// Object transfer.
    Object,
    /// Out-of-band request/response.
    Custom,
}

impl MessageType {
    /// Command string on the wire.
    pub fn command(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::Verack => "verack",
            MessageType::Addr => "addr",
            MessageType::Inv => "inv",
            MessageType::GetData => "getdata",
            MessageType::Object => "object",
            MessageType::Custom => "custom",
        }
    }

    /// Look up a command string.
    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "version" => Some(MessageType::Version),
            "verack" => Some(MessageType::Verack),
            "addr" => Some(MessageType::Addr),
            "inv" => Some(MessageType::Inv),
            "getdata" => Some(MessageType::GetData),
            "object" => Some(MessageType::Object),
            "custom" => Some(MessageType::Custom),
            _ => None,
        }
    }
}

/// Handshake opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version.
    pub version: i32,
    /// Service bitfield.
    pub services: u64,
    /// Sender's unix time.
    pub timestamp: i64,
    /// Address of the receiving node.
    pub addr_recv: NetworkAddress,
    /// Address of the sending node.
    pub addr_from: NetworkAddress,
    /// Random per-process nonce used to detect self connections.
    pub nonce: u64,
    /// Software identifier.
    pub user_agent: String,
    /// Streams the sender is interested in.
    pub streams: Vec<u64>,
}

impl VersionMessage {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(self.version);
        buf.put_u64(self.services);
        buf.put_i64(self.timestamp);
        self.addr_recv.write_short(buf);
        self.addr_from.write_short(buf);
        buf.put_u64(self.nonce);
        put_var_str(buf, &self.user_agent);
        put_var_int_list(buf, &self.streams);
    }

    fn read(buf: &mut Bytes) -> NetworkResult<Self> {
        ensure_remaining(buf, 4 + 8 + 8, "version header")?;
        let version = buf.get_i32();
        let services = buf.get_u64();
        let timestamp = buf.get_i64();
        let addr_recv = NetworkAddress::read_short(buf)?;
        let addr_from = NetworkAddress::read_short(buf)?;
        ensure_remaining(buf, 8, "version nonce")?;
        let nonce = buf.get_u64();
        let user_agent = get_var_str(buf, MAX_USER_AGENT_LENGTH, "user agent")?;
        let streams = get_var_int_list(buf, MAX_STREAMS_PER_VERSION, "stream list")?;
        Ok(Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            streams,
        })
    }
}

/// Out-of-band request or response, exchanged outside the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
    /// Application-defined command.
    pub command: String,
    /// Application-defined data.
    pub data: Bytes,
}

impl CustomMessage {
    /// Create a custom message.
    pub fn new(command: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            data: data.into(),
        }
    }

    /// Error response as sent by a handler that could not serve a request.
    pub fn error(message: impl fmt::Display) -> Self {
        Self::new("ERROR", Bytes::from(message.to_string()))
    }

    /// Whether this is an error response.
    pub fn is_error(&self) -> bool {
        self.command == "ERROR"
    }
}

/// P2P message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake opener.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    Verack,
    /// Known peer addresses.
    Addr(Vec<NetworkAddress>),
    /// Inventory announcement.
    Inv(Vec<InventoryVector>),
    /// Object request.
    GetData(Vec<InventoryVector>),
    /// Object transfer.
    Object(ObjectEnvelope),
    /// Out-of-band request/response.
    Custom(CustomMessage),
    /// Command this node does not know; kept so it can be logged.
    Unknown {
        /// Command string.
        command: String,
        /// Raw payload.
        payload: Bytes,
    },
}

impl Message {
    /// Known message type, `None` for unknown commands.
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Message::Version(_) => Some(MessageType::Version),
            Message::Verack => Some(MessageType::Verack),
            Message::Addr(_) => Some(MessageType::Addr),
            Message::Inv(_) => Some(MessageType::Inv),
            Message::GetData(_) => Some(MessageType::GetData),
            Message::Object(_) => Some(MessageType::Object),
            Message::Custom(_) => Some(MessageType::Custom),
            Message::Unknown { .. } => None,
        }
    }

    /// Command string for the frame header.
    pub fn command(&self) -> &str {
        match self {
            Message::Unknown { command, .. } => command,
            other => other
                .message_type()
                .map(|t| t.command())
                .unwrap_or_default(),
        }
    }

    /// Encode the payload.
    pub fn encode_payload(&self) -> NetworkResult<Bytes> {
        let mut buf = BytesMut::new();

        match self {
            Message::Version(v) => v.write(&mut buf),
            Message::Verack => {}
            Message::Addr(addresses) => {
                if addresses.len() > MAX_ADDRESSES_PER_MESSAGE {
                    return Err(NetworkError::InvalidMessage(format!(
                        "Too many addresses: {}",
                        addresses.len()
                    )));
                }
                put_varint(&mut buf, addresses.len() as u64);
                for address in addresses {
                    address.write_full(&mut buf);
                }
            }
            Message::Inv(vectors) | Message::GetData(vectors) => {
                if vectors.len() > MAX_VECTORS_PER_MESSAGE {
                    return Err(NetworkError::InvalidMessage(format!(
                        "Too many inventory vectors: {}",
                        vectors.len()
                    )));
                }
                put_varint(&mut buf, vectors.len() as u64);
                for iv in vectors {
                    buf.put_slice(iv.as_bytes());
                }
            }
            Message::Object(object) => object.write(&mut buf)?,
            Message::Custom(custom) => {
                put_var_str(&mut buf, &custom.command);
                buf.put_slice(&custom.data);
            }
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }

        Ok(buf.freeze())
    }

    /// Decode a payload received under `command`.
    pub fn decode(command: &str, mut payload: Bytes) -> NetworkResult<Self> {
        let message_type = match MessageType::from_command(command) {
            Some(t) => t,
            None => {
                return Ok(Message::Unknown {
                    command: command.to_string(),
                    payload,
                })
            }
        };

        let message = match message_type {
            MessageType::Version => Message::Version(VersionMessage::read(&mut payload)?),
            MessageType::Verack => Message::Verack,
            MessageType::Addr => {
                let count = get_varint_bounded(
                    &mut payload,
                    MAX_ADDRESSES_PER_MESSAGE as u64,
                    "address count",
                )? as usize;
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(NetworkAddress::read_full(&mut payload)?);
                }
                Message::Addr(addresses)
            }
            MessageType::Inv => Message::Inv(read_vectors(&mut payload)?),
            MessageType::GetData => Message::GetData(read_vectors(&mut payload)?),
            MessageType::Object => Message::Object(ObjectEnvelope::decode(payload.split_off(0))?),
            MessageType::Custom => {
                let command = get_var_str(&mut payload, MAX_CUSTOM_COMMAND_LENGTH, "custom command")?;
                let data = payload.split_off(0);
                Message::Custom(CustomMessage { command, data })
            }
        };

        if payload.has_remaining() {
            return Err(NetworkError::InvalidMessage(format!(
                "{} trailing bytes after {}",
                payload.remaining(),
                command
            )));
        }

        Ok(message)
    }
}

fn read_vectors(payload: &mut Bytes) -> NetworkResult<Vec<InventoryVector>> {
    let count =
        get_varint_bounded(payload, MAX_VECTORS_PER_MESSAGE as u64, "inventory count")? as usize;
    ensure_remaining(payload, count * InventoryVector::SIZE, "inventory vectors")?;
    let mut vectors = Vec::with_capacity(count);
    for _ in 0..count {
        let bytes = payload.split_to(InventoryVector::SIZE);
        vectors.push(InventoryVector::from_slice(&bytes)?);
    }
    Ok(vectors)
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Addr(a) => write!(f, "addr({})", a.len()),
            Message::Inv(v) => write!(f, "inv({})", v.len()),
            Message::GetData(v) => write!(f, "getdata({})", v.len()),
            Message::Custom(c) => write!(f, "custom({})", c.command),
            other => f.write_str(other.command()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bm_core::{ObjectPayload, NODE_NETWORK_SERVICE, PROTOCOL_VERSION};
    use std::net::SocketAddr;

    fn roundtrip(message: Message) -> Message {
        let payload = message.encode_payload().unwrap();
        Message::decode(message.command(), payload).unwrap()
    }

    fn version() -> VersionMessage {
        let recv: SocketAddr = "10.1.2.3:8444".parse().unwrap();
        let from: SocketAddr = "[2001:db8::1]:8445".parse().unwrap();
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK_SERVICE,
            timestamp: 1_700_000_000,
            addr_recv: NetworkAddress::from_socket_addr(recv, 0, NODE_NETWORK_SERVICE, 0),
            addr_from: NetworkAddress::from_socket_addr(from, 0, NODE_NETWORK_SERVICE, 0),
            nonce: 0xDEAD_BEEF_0102_0304,
            user_agent: "/bm-node:0.1.0/".to_string(),
            streams: vec![1, 2, 300],
        }
    }

    #[test]
    fn test_version_roundtrip() {
        let message = Message::Version(version());
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_version_layout() {
        let payload = Message::Version(version()).encode_payload().unwrap();
        // version + services + timestamp + 2 short addresses + nonce
        let fixed = 4 + 8 + 8 + 2 * NetworkAddress::SHORT_SIZE + 8;
        assert_eq!(&payload[..4], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(payload[fixed] as usize, "/bm-node:0.1.0/".len());
    }

    #[test]
    fn test_verack_is_empty() {
        assert!(Message::Verack.encode_payload().unwrap().is_empty());
        assert_eq!(roundtrip(Message::Verack), Message::Verack);
    }

    #[test]
    fn test_addr_roundtrip() {
        let addr: SocketAddr = "192.168.1.1:8444".parse().unwrap();
        let message = Message::Addr(vec![
            NetworkAddress::from_socket_addr(addr, 1, NODE_NETWORK_SERVICE, 1_700_000_000);
            3
        ]);
        let payload = message.encode_payload().unwrap();
        assert_eq!(payload.len(), 1 + 3 * NetworkAddress::FULL_SIZE);
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_inv_and_getdata_roundtrip() {
        let vectors: Vec<_> = (0..300u16)
            .map(|i| {
                let mut iv = [0u8; 32];
                iv[..2].copy_from_slice(&i.to_be_bytes());
                InventoryVector(iv)
            })
            .collect();

        let inv = Message::Inv(vectors.clone());
        assert_eq!(inv.encode_payload().unwrap().len(), 3 + 300 * 32);
        assert_eq!(roundtrip(inv.clone()), inv);

        let getdata = Message::GetData(vectors);
        assert_eq!(roundtrip(getdata.clone()), getdata);
    }

    #[test]
    fn test_vector_limit() {
        let too_many = Message::Inv(vec![InventoryVector([0; 32]); MAX_VECTORS_PER_MESSAGE + 1]);
        assert!(too_many.encode_payload().is_err());

        let mut payload = BytesMut::new();
        put_varint(&mut payload, MAX_VECTORS_PER_MESSAGE as u64 + 1);
        assert!(Message::decode("inv", payload.freeze()).is_err());
    }

    #[test]
    fn test_truncated_inv_is_rejected() {
        let mut payload = BytesMut::new();
        put_varint(&mut payload, 2);
        payload.put_slice(&[0u8; 40]);
        assert!(Message::decode("getdata", payload.freeze()).is_err());
    }

    #[test]
    fn test_object_roundtrip() {
        let object = ObjectEnvelope::new(
            2,
            1,
            1,
            1_700_000_000,
            ObjectPayload::Msg {
                encrypted: Bytes::from_static(b"ciphertext"),
            },
        )
        .with_nonce([1, 2, 3, 4, 5, 6, 7, 8]);
        let message = Message::Object(object);
        assert_eq!(roundtrip(message.clone()), message);

        let unsent = Message::Object(ObjectEnvelope::new(
            2,
            1,
            1,
            0,
            ObjectPayload::Opaque(Bytes::new()),
        ));
        assert!(unsent.encode_payload().is_err());
    }

    #[test]
    fn test_custom_roundtrip() {
        let message = Message::Custom(CustomMessage::new("ping", Bytes::from_static(b"\x00\x01")));
        assert_eq!(roundtrip(message.clone()), message);
        assert!(CustomMessage::error("boom").is_error());
    }

    #[test]
    fn test_unknown_command_is_kept() {
        let decoded = Message::decode("ping", Bytes::from_static(b"abc")).unwrap();
        assert_eq!(decoded.command(), "ping");
        assert_eq!(decoded.message_type(), None);
        assert_eq!(decoded.encode_payload().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        assert!(Message::decode("verack", Bytes::from_static(b"x")).is_err());
    }
}
