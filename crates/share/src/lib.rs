//! LAN sharing for ShadowBox: mDNS discovery, the framed TCP share server,
//! and the pull client, tied together by [`ShareService`].

#![deny(unsafe_code)]

pub mod client;
pub mod discovery;
pub mod proto;
pub mod server;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use box_engine::BoxEngine;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use shadowbox_core::ids::{BoxId, FileId};
use shadowbox_core::{Error, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub use client::{pull_from, Selection};
pub use discovery::{BrowseEvent, Discovery, Peer, ShareCode, RESOLVE_TIMEOUT};
pub use server::{HostedBox, ShareServer};

/// Process-wide sharing facade: hosting, browsing, pulling.
pub struct ShareService {
    engine: Arc<BoxEngine>,
    // The mDNS daemon starts on first use so machines without multicast can
    // still run everything but sharing.
    discovery: OnceCell<Discovery>,
    hosts: DashMap<ShareCode, ShareServer>,
    cancel: CancellationToken,
    share_port: u16,
}

impl ShareService {
    /// Prepare the sharing layer. `share_port` 0 means every server picks
    /// an ephemeral port; a fixed port is used for the first hosted box
    /// only (one listener per box).
    pub fn new(engine: Arc<BoxEngine>, share_port: u16) -> Self {
        Self {
            engine,
            discovery: OnceCell::new(),
            hosts: DashMap::new(),
            cancel: CancellationToken::new(),
            share_port,
        }
    }

    /// The engine this service serves from and pulls into.
    pub fn engine(&self) -> &Arc<BoxEngine> {
        &self.engine
    }

    fn discovery(&self) -> Result<&Discovery> {
        self.discovery.get_or_try_init(Discovery::new)
    }

    /// Host a box on the LAN. The box must be unlocked (the server streams
    /// plaintext decrypted through the local session). Returns the
    /// rendezvous code peers use.
    #[instrument(skip(self))]
    pub async fn start_hosting(&self, box_id: BoxId, public: bool) -> Result<ShareCode> {
        let rec = self.engine.index().get_box(box_id)?;
        if !self.engine.sessions().is_unlocked(box_id) {
            return Err(Error::Locked(box_id.to_string()));
        }
        let port = if self.share_port != 0 && self.hosts.is_empty() { self.share_port } else { 0 };
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let port = listener.local_addr()?.port();
        let discovery = self.discovery()?;
        let code = discovery.advertise(box_id, &rec.owner, &rec.name, port, public)?;
        let hosted = HostedBox { box_id, code: code.clone(), name: rec.name, public };
        let server = match ShareServer::serve(
            listener,
            self.engine.clone(),
            hosted,
            self.cancel.child_token(),
        ) {
            Ok(server) => server,
            Err(e) => {
                let _ = discovery.withdraw(&code);
                return Err(e);
            }
        };
        self.hosts.insert(code.clone(), server);
        info!(%box_id, %code, port, "hosting started");
        Ok(code)
    }

    /// TCP port a hosted box is served on.
    pub fn host_port(&self, code: &ShareCode) -> Result<u16> {
        self.hosts
            .get(code)
            .map(|s| s.port())
            .ok_or_else(|| Error::NotFound(format!("hosting {code}")))
    }

    /// Withdraw an advertisement and stop its server.
    pub async fn stop_hosting(&self, code: &ShareCode) -> Result<()> {
        let Some((_, server)) = self.hosts.remove(code) else {
            return Err(Error::NotFound(format!("hosting {code}")));
        };
        self.discovery()?.withdraw(code)?;
        server.stop().await;
        info!(%code, "hosting stopped");
        Ok(())
    }

    /// Continuous browse of ShadowBox advertisements on the subnet.
    pub fn browse(&self) -> Result<mpsc::Receiver<BrowseEvent>> {
        self.discovery()?.browse()
    }

    /// Resolve `code` and pull the selected files into a local box.
    #[instrument(skip(self, selection))]
    pub async fn pull(
        &self,
        code: &str,
        into_box: BoxId,
        selection: &Selection,
    ) -> Result<Vec<FileId>> {
        let code = ShareCode::from_str(code)?;
        let peer = self.discovery()?.resolve(&code, RESOLVE_TIMEOUT).await?;
        let addr = SocketAddr::new(peer.host, peer.port);
        pull_from(addr, &code, &self.engine, into_box, selection, &self.cancel.child_token())
            .await
    }

    /// Withdraw every advertisement, stop every server, cancel active
    /// pulls, and stop the mDNS daemon.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let codes: Vec<ShareCode> = self.hosts.iter().map(|e| e.key().clone()).collect();
        for code in codes {
            if let Some((_, server)) = self.hosts.remove(&code) {
                server.stop().await;
            }
        }
        if let Some(discovery) = self.discovery.get() {
            discovery.shutdown();
        }
        info!("share service stopped");
    }
}

impl std::fmt::Debug for ShareService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareService")
            .field("hosts", &self.hosts.len())
            .field("share_port", &self.share_port)
            .finish_non_exhaustive()
    }
}
