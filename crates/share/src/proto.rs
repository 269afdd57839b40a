//! Framed wire protocol, version 1.
//!
//! Frame layout: `| u32 BE payload length | u8 type | payload |`, payload
//! capped at 16 MiB. Control payloads are JSON (nonces hex-encoded); AUTH
//! is a raw 32-byte HMAC; GET_CHUNK is binary:
//! `file_id(16) || version_id(16) || offset u64 BE || bytes`, with an empty
//! `bytes` marking end of file.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shadowbox_core::ids::{FileId, VersionId};
use shadowbox_core::{Error, Result};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;
/// Maximum frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// Plaintext chunk size for GET_CHUNK streaming.
pub const CHUNK_SIZE: usize = 1024 * 1024;
/// Length of the HELLO/HELLO_ACK nonces.
pub const SESSION_NONCE_LEN: usize = 16;
/// Length of the AUTH MAC payload.
pub const AUTH_MAC_LEN: usize = 32;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client greeting.
    Hello = 0x01,
    /// Server reply to HELLO.
    HelloAck = 0x02,
    /// Client authentication MAC (private boxes only).
    Auth = 0x03,
    /// Manifest request.
    ListReq = 0x04,
    /// Manifest response.
    ListResp = 0x05,
    /// File content request.
    GetReq = 0x06,
    /// One plaintext chunk.
    GetChunk = 0x07,
    /// Error, either direction.
    Error = 0x7F,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x01 => Self::Hello,
            0x02 => Self::HelloAck,
            0x03 => Self::Auth,
            0x04 => Self::ListReq,
            0x05 => Self::ListResp,
            0x06 => Self::GetReq,
            0x07 => Self::GetChunk,
            0x7F => Self::Error,
            other => return Err(Error::Protocol(format!("unknown frame type {other:#04x}"))),
        })
    }
}

/// One decoded frame.
#[derive(Debug)]
pub struct Frame {
    /// Frame type byte.
    pub kind: FrameType,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Read one frame. Surfaces `Protocol` for malformed input and `Io` for a
/// dropped connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds cap")));
    }
    let mut kind_buf = [0u8; 1];
    reader.read_exact(&mut kind_buf).await?;
    let kind = FrameType::try_from(kind_buf[0])?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameType,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes exceeds cap", payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&[kind as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a control payload.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Protocol(format!("encode: {e}")))
}

/// Parse a control payload.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::Protocol(format!("decode: {e}")))
}

/// HELLO payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct Hello {
    /// Must equal [`PROTOCOL_VERSION`].
    pub protocol_version: u32,
    /// The rendezvous code the client connected through.
    pub code: String,
    /// Hex-encoded 16-byte client nonce.
    pub client_nonce: String,
}

/// HELLO_ACK payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct HelloAck {
    /// Hex-encoded 16-byte server nonce.
    pub server_nonce: String,
    /// Display name of the hosted box.
    pub box_name: String,
    /// Whether AUTH is skipped.
    pub is_public: bool,
}

/// One manifest entry of LIST_RESP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    /// File id on the serving side.
    pub file_id: FileId,
    /// File name.
    pub name: String,
    /// File description.
    pub description: String,
    /// Tags, lowercased.
    pub tags: Vec<String>,
    /// The current version being offered.
    pub current: ListVersion,
}

/// Current-version block of a manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVersion {
    /// Version id on the serving side.
    pub version_id: VersionId,
    /// Plaintext size.
    pub size: u64,
    /// MIME type.
    pub mime: String,
    /// Hex SHA-256 of the plaintext; the client re-verifies against it.
    pub sha256: String,
}

/// GET_REQ payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetReq {
    /// Requested file.
    pub file_id: FileId,
    /// Requested version.
    pub version_id: VersionId,
}

/// ERROR payload; `code` is an error kind from the core taxonomy.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable error kind.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// One GET_CHUNK, binary-encoded.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    /// File the chunk belongs to.
    pub file_id: FileId,
    /// Version the chunk belongs to.
    pub version_id: VersionId,
    /// Plaintext offset of the first byte.
    pub offset: u64,
    /// Chunk bytes; empty means end of file.
    pub bytes: Vec<u8>,
}

const CHUNK_HEADER_LEN: usize = 16 + 16 + 8;

impl Chunk {
    /// Binary encoding: ids, big-endian offset, raw bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.bytes.len());
        out.extend_from_slice(self.file_id.as_bytes());
        out.extend_from_slice(self.version_id.as_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Parse a GET_CHUNK payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < CHUNK_HEADER_LEN {
            return Err(Error::Protocol("short GET_CHUNK payload".into()));
        }
        let file_id = FileId::from_bytes(payload[..16].try_into().expect("sliced to 16"));
        let version_id = VersionId::from_bytes(payload[16..32].try_into().expect("sliced to 16"));
        let offset = u64::from_be_bytes(payload[32..40].try_into().expect("sliced to 8"));
        Ok(Self { file_id, version_id, offset, bytes: payload[40..].to_vec() })
    }
}

/// Fresh 16-byte session nonce.
pub fn session_nonce() -> Result<[u8; SESSION_NONCE_LEN]> {
    let mut n = [0u8; SESSION_NONCE_LEN];
    getrandom::getrandom(&mut n)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(n)
}

/// Decode a hex nonce from HELLO/HELLO_ACK.
pub fn decode_nonce(hex_str: &str) -> Result<[u8; SESSION_NONCE_LEN]> {
    let bytes = hex::decode(hex_str).map_err(|e| Error::Protocol(format!("bad nonce: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::Protocol("bad nonce length".into()))
}

/// The AUTH MAC: `HMAC-SHA256(wire_key, client_nonce || server_nonce)`.
pub fn auth_mac(
    code: &str,
    client_nonce: &[u8; SESSION_NONCE_LEN],
    server_nonce: &[u8; SESSION_NONCE_LEN],
) -> Result<[u8; AUTH_MAC_LEN]> {
    use hmac::{Hmac, Mac};
    let key = crypto::wire_key(code, client_nonce, server_nonce)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    let mut mac = <Hmac<sha2::Sha256> as Mac>::new_from_slice(&key)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    mac.update(client_nonce);
    mac.update(server_nonce);
    let out = mac.finalize().into_bytes();
    let mut buf = [0u8; AUTH_MAC_LEN];
    buf.copy_from_slice(&out);
    Ok(buf)
}

/// Constant-time comparison of a received AUTH payload.
pub fn auth_mac_matches(expected: &[u8; AUTH_MAC_LEN], received: &[u8]) -> bool {
    received.len() == AUTH_MAC_LEN && bool::from(expected.as_slice().ct_eq(received))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameType::ListReq, b"").await.unwrap();
        write_frame(&mut buf, FrameType::Hello, b"{\"x\":1}").await.unwrap();
        let mut cursor = buf.as_slice();
        let f1 = read_frame(&mut cursor).await.unwrap();
        assert_eq!(f1.kind, FrameType::ListReq);
        assert!(f1.payload.is_empty());
        let f2 = read_frame(&mut cursor).await.unwrap();
        assert_eq!(f2.kind, FrameType::Hello);
        assert_eq!(f2.payload, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        buf.push(FrameType::Hello as u8);
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[tokio::test]
    async fn unknown_type_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0x42);
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn chunk_roundtrip() {
        let chunk = Chunk {
            file_id: FileId::new(),
            version_id: VersionId::new(),
            offset: 7 * 1024 * 1024,
            bytes: vec![1, 2, 3],
        };
        assert_eq!(Chunk::decode(&chunk.encode()).unwrap(), chunk);
    }

    #[test]
    fn eof_chunk_has_no_bytes() {
        let chunk = Chunk {
            file_id: FileId::new(),
            version_id: VersionId::new(),
            offset: 3,
            bytes: Vec::new(),
        };
        let decoded = Chunk::decode(&chunk.encode()).unwrap();
        assert!(decoded.bytes.is_empty());
    }

    #[test]
    fn short_chunk_rejected() {
        assert_eq!(Chunk::decode(&[0u8; 10]).unwrap_err().kind(), "protocol_error");
    }

    #[test]
    fn auth_mac_agrees_only_on_same_code() {
        let cn = [1u8; SESSION_NONCE_LEN];
        let sn = [2u8; SESSION_NONCE_LEN];
        let good = auth_mac("QWER", &cn, &sn).unwrap();
        let also_good = auth_mac("QWER", &cn, &sn).unwrap();
        let bad = auth_mac("ZZZZ", &cn, &sn).unwrap();
        assert!(auth_mac_matches(&good, &also_good));
        assert!(!auth_mac_matches(&good, &bad));
        assert!(!auth_mac_matches(&good, &good[..16]));
    }

    #[test]
    fn nonce_hex_roundtrip() {
        let n = session_nonce().unwrap();
        assert_eq!(decode_nonce(&hex::encode(n)).unwrap(), n);
        assert!(decode_nonce("zz").is_err());
        assert!(decode_nonce("aabb").is_err());
    }
}
