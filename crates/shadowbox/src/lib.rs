//! ShadowBox core facade.
//!
//! `Shadowbox::init` wires the metadata index, blob store, session manager,
//! box engine and share service from one [`Config`], and spawns the
//! auto-lock timer. Frontends (TUI, importer) consume this type and nothing
//! below it. `shutdown` withdraws advertisements, stops the share servers,
//! cancels active pulls, locks every box and releases the index.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use blob_store::BlobStore;
use box_engine::BoxEngine;
use metadata_index::Index;
use session::SessionManager;
use shadowbox_core::ids::{now_ms, BoxId, FileId};
use shadowbox_core::{Config, Error, Result};
use share::{BrowseEvent, Selection, ShareCode, ShareService};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

pub use shadowbox_core::{config, entity, error, ids};
pub use share::{pull_from, Peer};

// Auto-lock sweep cadence; the idle window itself lives in the session
// manager and is configurable at runtime.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// The assembled core. One per installation root.
pub struct Shadowbox {
    engine: Arc<BoxEngine>,
    sessions: Arc<SessionManager>,
    share: ShareService,
    cancel: CancellationToken,
}

impl Shadowbox {
    /// Open the index (migrating if needed), the blob store and the session
    /// manager, and spawn the auto-lock timer. Must run inside a tokio
    /// runtime.
    pub fn init(config: Config) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index = Index::open(&config.db_path)?;
        let blobs = BlobStore::open(&config.storage_root)?;
        let sessions = Arc::new(SessionManager::new(config.auto_lock_minutes));
        let engine =
            Arc::new(BoxEngine::new(index, blobs, sessions.clone(), config.max_file_size));
        let share = ShareService::new(engine.clone(), config.share_port);
        let cancel = CancellationToken::new();

        let sweep_sessions = sessions.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(
            async move {
                let mut tick = tokio::time::interval(SWEEP_PERIOD);
                loop {
                    tokio::select! {
                        () = sweep_cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let locked = sweep_sessions.sweep_idle(now_ms());
                            if !locked.is_empty() {
                                debug!(count = locked.len(), "auto-lock sweep");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("auto_lock")),
        );

        info!(db = %config.db_path.display(), "shadowbox core initialized");
        Ok(Self { engine, sessions, share, cancel })
    }

    /// The box engine: create/open/close boxes, add/read/delete/search
    /// files, versions, restore.
    pub fn engine(&self) -> &Arc<BoxEngine> {
        &self.engine
    }

    /// Unlock a box for use.
    pub fn unlock(&self, box_id: BoxId, password: &str) -> Result<()> {
        self.engine.open_box(box_id, password)
    }

    /// Lock one box, zeroizing its key material.
    pub fn lock(&self, box_id: BoxId) {
        self.engine.close_box(box_id);
    }

    /// Lock every box.
    pub fn lock_all(&self) {
        self.sessions.lock_all();
    }

    /// Change the auto-lock idle window.
    pub fn set_auto_lock(&self, minutes: u64) {
        self.sessions.set_auto_lock(minutes);
    }

    /// Host a box on the LAN; returns its rendezvous code.
    pub async fn start_hosting(&self, box_id: BoxId, public: bool) -> Result<ShareCode> {
        self.share.start_hosting(box_id, public).await
    }

    /// TCP port a hosted box is served on.
    pub fn host_port(&self, code: &ShareCode) -> Result<u16> {
        self.share.host_port(code)
    }

    /// Stop hosting one box.
    pub async fn stop_hosting(&self, code: &ShareCode) -> Result<()> {
        self.share.stop_hosting(code).await
    }

    /// Stream of peers appearing and disappearing on the subnet.
    pub fn browse(&self) -> Result<mpsc::Receiver<BrowseEvent>> {
        self.share.browse()
    }

    /// Resolve a code and pull the selected files into a local box.
    pub async fn pull(
        &self,
        code: &str,
        into_box: BoxId,
        selection: &Selection,
    ) -> Result<Vec<FileId>> {
        self.share.pull(code, into_box, selection).await
    }

    /// Tear the core down: withdraw advertisements, stop servers, cancel
    /// pulls and the auto-lock timer, zeroize every key. The index closes
    /// when the last handle drops.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.share.shutdown().await;
        self.sessions.lock_all();
        info!("shadowbox core shut down");
    }
}

impl std::fmt::Debug for Shadowbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shadowbox").finish_non_exhaustive()
    }
}

// Re-exported so frontends depend on one crate.
pub use shadowbox_core::Config as CoreConfig;
pub use shadowbox_core::Error as CoreError;

#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Shadowbox>();
    check::<Error>();
}
