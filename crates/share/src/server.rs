//! Share server: one TCP listener serving exactly one box, read-only.
//!
//! Per-connection state machine:
//! `Listen -> HelloRcvd -> Authed (private only) -> Ready -> Serving`.
//! Any out-of-order or malformed frame gets an `ERROR{protocol_error}` and
//! the connection closes. Failed authentication answers after a uniform
//! delay with the same `auth_failure` whether the box exists or not, so a
//! scanning peer learns nothing. The box must be unlocked locally; only
//! plaintext crosses the wire.

use std::sync::Arc;
use std::time::Duration;

use box_engine::BoxEngine;
use shadowbox_core::ids::BoxId;
use shadowbox_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::discovery::ShareCode;
use crate::proto::{
    self, auth_mac, auth_mac_matches, Chunk, Frame, FrameType, GetReq, Hello, HelloAck, ListEntry,
    ListVersion, WireError, CHUNK_SIZE, PROTOCOL_VERSION,
};

/// How long the server waits for the next frame of a connection.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(30);
// Uniform answer delay for failed authentication.
const AUTH_FAIL_DELAY: Duration = Duration::from_millis(300);

/// The box one server instance offers.
#[derive(Debug, Clone)]
pub struct HostedBox {
    /// The served box.
    pub box_id: BoxId,
    /// Rendezvous code the box is advertised under.
    pub code: ShareCode,
    /// Display name sent in HELLO_ACK.
    pub name: String,
    /// Public boxes skip AUTH.
    pub public: bool,
}

/// A running share server bound to one port.
pub struct ShareServer {
    port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ShareServer {
    /// Bind a listener (`port` 0 picks an ephemeral one) and start the
    /// accept loop.
    pub async fn bind(
        engine: Arc<BoxEngine>,
        hosted: HostedBox,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Self::serve(listener, engine, hosted, cancel)
    }

    /// Start the accept loop on a listener the caller already bound (the
    /// share service advertises the port before serving).
    pub fn serve(
        listener: TcpListener,
        engine: Arc<BoxEngine>,
        hosted: HostedBox,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let port = listener.local_addr()?.port();
        let accept_cancel = cancel.clone();
        let span = info_span!("share.server", box_id = %hosted.box_id, port);
        let task = tokio::spawn(
            async move {
                accept_loop(listener, engine, hosted, accept_cancel).await;
            }
            .instrument(span),
        );
        Ok(Self { port, cancel, task })
    }

    /// The bound TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, close active handlers, and wait for the loop.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    engine: Arc<BoxEngine>,
    hosted: HostedBox,
    cancel: CancellationToken,
) {
    info!("share server listening");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let engine = engine.clone();
                        let hosted = hosted.clone();
                        let conn_cancel = cancel.child_token();
                        let span = info_span!("share.conn", %peer);
                        tokio::spawn(
                            async move {
                                if let Err(e) =
                                    handle_conn(stream, &engine, &hosted, &conn_cancel).await
                                {
                                    debug!(error = %e, "connection ended with error");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        // Accept failures are transient; the loop survives.
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    info!("share server stopped");
}

async fn read_frame_timed<R: AsyncRead + Unpin>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Frame> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        frame = tokio::time::timeout(FRAME_TIMEOUT, proto::read_frame(reader)) => {
            frame.map_err(|_| Error::Timeout("frame read".into()))?
        }
    }
}

async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, err: &Error) {
    let payload = proto::to_payload(&WireError {
        code: err.kind().to_string(),
        message: err.to_string(),
    })
    .unwrap_or_default();
    if let Err(e) = proto::write_frame(writer, FrameType::Error, &payload).await {
        debug!(error = %e, "error frame not delivered");
    }
}

async fn handle_conn(
    stream: TcpStream,
    engine: &BoxEngine,
    hosted: &HostedBox,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut stream = BufStream::new(stream);
    match drive_conn(&mut stream, engine, hosted, cancel).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if matches!(e, Error::AuthFailure) {
                // Same answer, same latency, whether the box exists or the
                // code was wrong.
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
            }
            send_error(&mut stream, &e).await;
            Err(e)
        }
    }
}

async fn drive_conn(
    stream: &mut BufStream<TcpStream>,
    engine: &BoxEngine,
    hosted: &HostedBox,
    cancel: &CancellationToken,
) -> Result<()> {
    // Listen -> HelloRcvd
    let frame = read_frame_timed(stream, cancel).await?;
    if frame.kind != FrameType::Hello {
        return Err(Error::Protocol(format!("expected HELLO, got {:?}", frame.kind)));
    }
    let hello: Hello = proto::from_payload(&frame.payload)?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported protocol version {}",
            hello.protocol_version
        )));
    }
    let client_nonce = proto::decode_nonce(&hello.client_nonce)?;
    let server_nonce = proto::session_nonce()?;

    let ack = HelloAck {
        server_nonce: hex::encode(server_nonce),
        box_name: hosted.name.clone(),
        is_public: hosted.public,
    };
    proto::write_frame(stream, FrameType::HelloAck, &proto::to_payload(&ack)?).await?;

    // A HELLO for some other code reveals nothing either.
    let code_matches = hello.code.eq_ignore_ascii_case(hosted.code.as_str());

    // HelloRcvd -> Authed (private boxes only)
    if !hosted.public {
        let frame = read_frame_timed(stream, cancel).await?;
        if frame.kind != FrameType::Auth {
            return Err(Error::Protocol(format!("expected AUTH, got {:?}", frame.kind)));
        }
        let expected = auth_mac(hosted.code.as_str(), &client_nonce, &server_nonce)?;
        if !code_matches || !auth_mac_matches(&expected, &frame.payload) {
            return Err(Error::AuthFailure);
        }
        debug!("peer authenticated");
    } else if !code_matches {
        return Err(Error::AuthFailure);
    }

    // Ready / Serving
    loop {
        let frame = match read_frame_timed(stream, cancel).await {
            Ok(frame) => frame,
            // A clean disconnect between requests is a normal end.
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match frame.kind {
            FrameType::ListReq => {
                let manifest = build_manifest(engine, hosted.box_id)?;
                proto::write_frame(stream, FrameType::ListResp, &proto::to_payload(&manifest)?)
                    .await?;
                debug!(entries = manifest.len(), "manifest served");
            }
            FrameType::GetReq => {
                let req: GetReq = proto::from_payload(&frame.payload)?;
                match serve_file(stream, engine, hosted.box_id, &req, cancel).await {
                    Ok(()) => {}
                    // Operational failures answer in-band; the session
                    // survives. Everything else tears the connection down.
                    Err(e @ (Error::NotFound(_) | Error::Locked(_) | Error::IntegrityFailure(_))) => {
                        warn!(error = %e, "get request failed");
                        send_error(stream, &e).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            other => {
                return Err(Error::Protocol(format!("unexpected frame {other:?}")));
            }
        }
    }
}

fn build_manifest(engine: &BoxEngine, box_id: BoxId) -> Result<Vec<ListEntry>> {
    let mut manifest = Vec::new();
    for file in engine.list_files(box_id)? {
        let Some(current_id) = file.current_version_id else { continue };
        let version = engine.get_version(file.file_id, current_id)?;
        manifest.push(ListEntry {
            file_id: file.file_id,
            name: file.name,
            description: file.description,
            tags: engine.file_tags(file.file_id)?,
            current: ListVersion {
                version_id: version.version_id,
                size: version.size,
                mime: version.mime,
                sha256: version.blob_hash,
            },
        });
    }
    Ok(manifest)
}

async fn serve_file(
    stream: &mut BufStream<TcpStream>,
    engine: &BoxEngine,
    box_id: BoxId,
    req: &GetReq,
    cancel: &CancellationToken,
) -> Result<()> {
    let plaintext = engine.read_file(box_id, req.file_id, Some(req.version_id), cancel)?;
    let mut offset = 0usize;
    while offset < plaintext.len() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let end = (offset + CHUNK_SIZE).min(plaintext.len());
        let chunk = Chunk {
            file_id: req.file_id,
            version_id: req.version_id,
            offset: offset as u64,
            bytes: plaintext[offset..end].to_vec(),
        };
        proto::write_frame(stream, FrameType::GetChunk, &chunk.encode()).await?;
        offset = end;
    }
    let eof = Chunk {
        file_id: req.file_id,
        version_id: req.version_id,
        offset: plaintext.len() as u64,
        bytes: Vec::new(),
    };
    proto::write_frame(stream, FrameType::GetChunk, &eof.encode()).await?;
    debug!(file_id = %req.file_id, bytes = plaintext.len(), "file streamed");
    Ok(())
}
