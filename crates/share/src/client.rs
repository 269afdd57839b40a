//! Share client: resolve a code, pull files, re-encrypt them locally.

use std::net::SocketAddr;
use std::time::Duration;

use blob_store::digest_hex;
use box_engine::BoxEngine;
use shadowbox_core::ids::{BoxId, FileId};
use shadowbox_core::{Error, Result};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::discovery::ShareCode;
use crate::proto::{
    self, auth_mac, Chunk, Frame, FrameType, GetReq, Hello, HelloAck, ListEntry, WireError,
    PROTOCOL_VERSION,
};
use crate::server::FRAME_TIMEOUT;

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Whole-file transfer timeout.
pub const FILE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Which manifest entries to pull. `All` takes everything on offer.
#[derive(Debug, Clone, Default)]
pub enum Selection {
    /// Pull every offered file.
    #[default]
    All,
    /// Pull only files with these names.
    Names(Vec<String>),
}

impl Selection {
    fn wants(&self, entry: &ListEntry) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.iter().any(|n| n == &entry.name),
        }
    }
}

async fn read_frame_timed(stream: &mut BufStream<TcpStream>) -> Result<Frame> {
    tokio::time::timeout(FRAME_TIMEOUT, proto::read_frame(stream))
        .await
        .map_err(|_| Error::Timeout("frame read".into()))?
}

// An ERROR frame anywhere becomes the error it carries.
fn reject_error(frame: &Frame) -> Result<()> {
    if frame.kind == FrameType::Error {
        let err: WireError = proto::from_payload(&frame.payload)?;
        return Err(Error::from_wire(&err.code, &err.message));
    }
    Ok(())
}

/// Pull files offered at `addr` into a local box. The remote plaintext is
/// hash-verified against the manifest and re-encrypted under the local
/// box's own DEK; nothing derived from the wire key is persisted.
#[instrument(skip(engine, selection, cancel), fields(%code))]
pub async fn pull_from(
    addr: SocketAddr,
    code: &ShareCode,
    engine: &BoxEngine,
    into_box: BoxId,
    selection: &Selection,
    cancel: &CancellationToken,
) -> Result<Vec<FileId>> {
    let stream = tokio::select! {
        () = cancel.cancelled() => return Err(Error::Cancelled),
        conn = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
            conn.map_err(|_| Error::Timeout(format!("connect {addr}")))??
        }
    };
    let mut stream = BufStream::new(stream);

    // HELLO / HELLO_ACK
    let client_nonce = proto::session_nonce()?;
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        code: code.as_str().to_string(),
        client_nonce: hex::encode(client_nonce),
    };
    proto::write_frame(&mut stream, FrameType::Hello, &proto::to_payload(&hello)?).await?;
    let frame = read_frame_timed(&mut stream).await?;
    reject_error(&frame)?;
    if frame.kind != FrameType::HelloAck {
        return Err(Error::Protocol(format!("expected HELLO_ACK, got {:?}", frame.kind)));
    }
    let ack: HelloAck = proto::from_payload(&frame.payload)?;
    let server_nonce = proto::decode_nonce(&ack.server_nonce)?;

    // AUTH (private boxes)
    if !ack.is_public {
        let mac = auth_mac(code.as_str(), &client_nonce, &server_nonce)?;
        proto::write_frame(&mut stream, FrameType::Auth, &mac).await?;
    }

    // LIST
    proto::write_frame(&mut stream, FrameType::ListReq, b"").await?;
    let frame = read_frame_timed(&mut stream).await?;
    reject_error(&frame)?;
    if frame.kind != FrameType::ListResp {
        return Err(Error::Protocol(format!("expected LIST_RESP, got {:?}", frame.kind)));
    }
    let manifest: Vec<ListEntry> = proto::from_payload(&frame.payload)?;
    info!(box_name = %ack.box_name, offered = manifest.len(), "manifest received");

    // GET each selected file; first failure aborts the pull.
    let mut pulled = Vec::new();
    for entry in manifest.iter().filter(|e| selection.wants(e)) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let bytes = tokio::time::timeout(FILE_TIMEOUT, fetch_file(&mut stream, entry))
            .await
            .map_err(|_| Error::Timeout(format!("pull of {}", entry.name)))??;
        if digest_hex(&bytes) != entry.current.sha256 {
            // Discard; no partial file rows.
            warn!(name = %entry.name, "pulled bytes failed hash verification");
            return Err(Error::IntegrityFailure(format!(
                "hash mismatch for pulled file {}",
                entry.name
            )));
        }
        let file_id = engine.add_file(
            into_box,
            &entry.name,
            &bytes,
            &entry.current.mime,
            &entry.description,
            &entry.tags,
            cancel,
        )?;
        debug!(name = %entry.name, %file_id, bytes = bytes.len(), "file pulled");
        pulled.push(file_id);
    }
    Ok(pulled)
}

async fn fetch_file(stream: &mut BufStream<TcpStream>, entry: &ListEntry) -> Result<Vec<u8>> {
    let req = GetReq { file_id: entry.file_id, version_id: entry.current.version_id };
    proto::write_frame(stream, FrameType::GetReq, &proto::to_payload(&req)?).await?;

    let mut bytes: Vec<u8> = Vec::with_capacity(entry.current.size as usize);
    loop {
        let frame = read_frame_timed(stream).await?;
        reject_error(&frame)?;
        if frame.kind != FrameType::GetChunk {
            return Err(Error::Protocol(format!("expected GET_CHUNK, got {:?}", frame.kind)));
        }
        let chunk = Chunk::decode(&frame.payload)?;
        if chunk.file_id != entry.file_id || chunk.version_id != entry.current.version_id {
            return Err(Error::Protocol("chunk for a different file".into()));
        }
        if chunk.bytes.is_empty() {
            break;
        }
        if chunk.offset != bytes.len() as u64 {
            return Err(Error::Protocol(format!(
                "out-of-order chunk at offset {}",
                chunk.offset
            )));
        }
        bytes.extend_from_slice(&chunk.bytes);
    }
    Ok(bytes)
}
