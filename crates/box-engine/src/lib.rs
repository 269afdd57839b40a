//! Box engine: the single write path over the blob store, the metadata
//! index and the session manager.
//!
//! Writes to one box serialize on a per-box write lock; reads share it.
//! Every multi-table change runs in one index transaction, and a blob file
//! written for a transaction that later aborts is reaped before the call
//! returns, so the store is always consistent: either the old state or the
//! new one, never a half-state.

#![deny(unsafe_code)]

use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use blob_store::{digest_hex, BlobStore};
use crypto::CryptoError;
use dashmap::DashMap;
use metadata_index::{ops, Index};
use session::SessionManager;
use shadowbox_core::entity::{BlobRecord, BoxRecord, FileRecord, VersionRecord};
use shadowbox_core::ids::{now_ms, BoxId, FileId, VersionId};
use shadowbox_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Engine over one installation's index and storage root.
pub struct BoxEngine {
    index: Index,
    blobs: BlobStore,
    sessions: Arc<SessionManager>,
    locks: DashMap<BoxId, Arc<RwLock<()>>>,
    max_file_size: u64,
}

impl BoxEngine {
    /// Assemble the engine. `max_file_size` caps `add_file` plaintexts.
    pub fn new(
        index: Index,
        blobs: BlobStore,
        sessions: Arc<SessionManager>,
        max_file_size: u64,
    ) -> Self {
        Self { index, blobs, sessions, locks: DashMap::new(), max_file_size }
    }

    /// The session manager this engine authenticates against.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The metadata index handle.
    pub fn index(&self) -> &Index {
        &self.index
    }

    fn box_lock(&self, box_id: BoxId) -> Arc<RwLock<()>> {
        self.locks.entry(box_id).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    // ---- box lifecycle ----------------------------------------------------

    /// Create a box: fresh salt and DEK, DEK wrapped under the
    /// password-derived master key. The new box starts unlocked for its
    /// creator.
    #[instrument(skip(self, password))]
    pub fn create_box(
        &self,
        owner: &str,
        name: &str,
        password: &str,
        public: bool,
    ) -> Result<BoxId> {
        let salt = crypto::random_salt().map_err(crypto_internal)?;
        let master = crypto::derive_master_key(password.as_bytes(), &salt).map_err(crypto_internal)?;
        let dek = crypto::generate_dek().map_err(crypto_internal)?;
        let wrapped = crypto::wrap_dek(&master, &dek).map_err(crypto_internal)?;
        let rec = BoxRecord {
            box_id: BoxId::new(),
            name: name.to_string(),
            owner: owner.to_string(),
            created_at_ms: now_ms(),
            is_public: public,
            kdf_salt: salt,
            wrapped_dek: Some(wrapped),
            soft_deleted: false,
        };
        self.index.with_tx(|tx| ops::insert_box(tx, &rec))?;
        self.sessions.adopt(rec.box_id, dek);
        info!(box_id = %rec.box_id, owner, "box created");
        Ok(rec.box_id)
    }

    /// Non-deleted boxes of `owner`.
    pub fn list_boxes(&self, owner: &str) -> Result<Vec<BoxRecord>> {
        self.index.list_boxes(owner)
    }

    /// Unlock a box with its password. Wrong password is `AuthFailure`.
    #[instrument(skip(self, password))]
    pub fn open_box(&self, box_id: BoxId, password: &str) -> Result<()> {
        let rec = self.index.get_box(box_id)?;
        let Some(wrapped) = rec.wrapped_dek.as_deref() else {
            // A box without a wrapped DEK is unrecoverable by anyone.
            return Err(Error::IntegrityFailure(format!("box {box_id} has no wrapped key")));
        };
        self.sessions.unlock_with(box_id, &rec.kdf_salt, wrapped, password)
    }

    /// Lock a box, zeroizing its cached DEK.
    pub fn close_box(&self, box_id: BoxId) {
        self.sessions.lock(box_id);
    }

    // ---- write path -------------------------------------------------------

    /// Ingest bytes as a file of the box. An existing live file of the same
    /// name gains a new version (`seq = max + 1`); content identical to an
    /// already-stored plaintext of the same box is deduplicated.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, bytes, description, tags, cancel), fields(size = bytes.len()))]
    pub fn add_file(
        &self,
        box_id: BoxId,
        name: &str,
        bytes: &[u8],
        mime: &str,
        description: &str,
        tags: &[String],
        cancel: &CancellationToken,
    ) -> Result<FileId> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if bytes.len() as u64 > self.max_file_size {
            return Err(Error::QuotaExceeded {
                size: bytes.len() as u64,
                max: self.max_file_size,
            });
        }
        let boxrec = self.index.get_box(box_id)?;
        if boxrec.soft_deleted {
            return Err(Error::NotFound(format!("box {box_id}")));
        }

        let lock = self.box_lock(box_id);
        let _write = lock.write().unwrap_or_else(PoisonError::into_inner);

        let dek = self.sessions.dek_for(box_id)?;
        let hash = digest_hex(bytes);
        let now = now_ms();

        // Encrypt outside the transaction; the per-box write lock makes the
        // existence pre-check stable.
        let existing_blob = self.index.get_blob(box_id, &hash)?;
        let mut wrote_blob_file = false;
        let new_blob = if existing_blob.is_none() {
            let nonce = crypto::nonce().map_err(crypto_internal)?;
            let (ct, tag) =
                crypto::seal_detached(dek.as_bytes(), &nonce, bytes).map_err(crypto_internal)?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.blobs.put(box_id, &hash, &ct)?;
            wrote_blob_file = true;
            Some(BlobRecord {
                blob_hash: hash.clone(),
                box_id,
                ref_count: 1,
                nonce,
                tag,
                ct_size: ct.len() as u64,
                path_on_disk: BlobStore::rel_path(box_id, &hash),
            })
        } else {
            None
        };

        let outcome = self.index.with_tx(|tx| {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match &new_blob {
                Some(rec) => ops::insert_blob(tx, rec)?,
                None => {
                    ops::bump_blob_ref(tx, box_id, &hash, 1)?;
                }
            }
            let file = match ops::find_file_by_name(tx, box_id, name)? {
                Some(mut file) => {
                    ops::update_file_meta(tx, file.file_id, description, now)?;
                    file.description = description.to_string();
                    file.updated_at_ms = now;
                    file
                }
                None => {
                    let file = FileRecord {
                        file_id: FileId::new(),
                        box_id,
                        name: name.to_string(),
                        description: description.to_string(),
                        current_version_id: None,
                        created_at_ms: now,
                        updated_at_ms: now,
                        soft_deleted: false,
                    };
                    ops::insert_file(tx, &file)?;
                    file
                }
            };
            let version = VersionRecord {
                version_id: VersionId::new(),
                file_id: file.file_id,
                blob_hash: hash.clone(),
                size: bytes.len() as u64,
                mime: mime.to_string(),
                created_at_ms: now,
                seq: ops::next_seq(tx, file.file_id)?,
            };
            ops::insert_version(tx, &version)?;
            ops::set_current_version(tx, file.file_id, version.version_id, now)?;
            ops::set_tags(tx, file.file_id, tags)?;
            let normalized = ops::normalize_tags(tags);
            ops::fts_upsert(tx, &file, &normalized)?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Ok(file.file_id)
        });

        match outcome {
            Ok(file_id) => {
                self.sessions.touch(box_id);
                debug!(%box_id, %file_id, %hash, "file ingested");
                Ok(file_id)
            }
            Err(e) => {
                if wrote_blob_file {
                    if let Err(reap_err) = self.blobs.delete(box_id, &hash) {
                        warn!(%box_id, %hash, error = %reap_err, "failed to reap aborted blob");
                    }
                }
                Err(e)
            }
        }
    }

    /// Decrypt and return a file's plaintext, re-verifying its SHA-256
    /// against the version's recorded hash. `version` defaults to the
    /// file's current version.
    #[instrument(skip(self, cancel))]
    pub fn read_file(
        &self,
        box_id: BoxId,
        file_id: FileId,
        version: Option<VersionId>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let lock = self.box_lock(box_id);
        let _read = lock.read().unwrap_or_else(PoisonError::into_inner);

        let file = self.get_live_file(box_id, file_id)?;
        let version_id = match version {
            Some(v) => v,
            None => file
                .current_version_id
                .ok_or_else(|| Error::NotFound(format!("file {file_id} has no content")))?,
        };
        let version = self.index.get_version(version_id)?;
        if version.file_id != file_id {
            return Err(Error::NotFound(format!("version {version_id}")));
        }
        let blob = self
            .index
            .get_blob(box_id, &version.blob_hash)?
            .ok_or_else(|| {
                Error::IntegrityFailure(format!("missing blob row for {}", version.blob_hash))
            })?;
        let dek = self.sessions.dek_for(box_id)?;
        let ciphertext = self.blobs.get(box_id, &version.blob_hash, blob.ct_size)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plaintext =
            match crypto::open_detached(dek.as_bytes(), &blob.nonce, &ciphertext, &blob.tag) {
                Ok(pt) => pt,
                Err(CryptoError::Decrypt) => {
                    return Err(Error::IntegrityFailure(format!(
                        "AEAD tag failure for {}",
                        version.blob_hash
                    )));
                }
                Err(e) => return Err(crypto_internal(e)),
            };
        if digest_hex(&plaintext) != version.blob_hash {
            return Err(Error::IntegrityFailure(format!(
                "plaintext hash mismatch for version {version_id}"
            )));
        }
        self.sessions.touch(box_id);
        Ok(plaintext)
    }

    /// Mark a file deleted without touching its blobs.
    pub fn soft_delete_file(&self, file_id: FileId) -> Result<()> {
        let file = self.index.get_file(file_id)?;
        let lock = self.box_lock(file.box_id);
        let _write = lock.write().unwrap_or_else(PoisonError::into_inner);
        self.index.with_tx(|tx| ops::set_file_soft_deleted(tx, file_id, true, now_ms()))
    }

    /// Remove a file, its versions and tags; blobs whose refcount reaches
    /// zero lose their row and their on-disk ciphertext.
    #[instrument(skip(self))]
    pub fn hard_delete_file(&self, file_id: FileId) -> Result<()> {
        let file = self.index.get_file(file_id)?;
        let box_id = file.box_id;
        let lock = self.box_lock(box_id);
        let _write = lock.write().unwrap_or_else(PoisonError::into_inner);

        let dead_hashes = self.index.with_tx(|tx| {
            let versions = ops::delete_versions_of(tx, file_id)?;
            let mut dead = Vec::new();
            for version in &versions {
                let remaining = ops::bump_blob_ref(tx, box_id, &version.blob_hash, -1)?;
                if remaining == 0 && !dead.contains(&version.blob_hash) {
                    ops::delete_blob_row(tx, box_id, &version.blob_hash)?;
                    dead.push(version.blob_hash.clone());
                }
            }
            ops::delete_tags(tx, file_id)?;
            ops::fts_delete(tx, file_id)?;
            ops::delete_file_row(tx, file_id)?;
            Ok(dead)
        })?;

        // Unlink only after the rows are committed away.
        for hash in dead_hashes {
            self.blobs.delete(box_id, &hash)?;
        }
        info!(%box_id, %file_id, "file hard-deleted");
        Ok(())
    }

    /// Versions of a file, newest first.
    pub fn list_versions(&self, file_id: FileId) -> Result<Vec<VersionRecord>> {
        self.index.list_versions(file_id)
    }

    /// Point the file back at an older version. No new version is created.
    pub fn restore_version(&self, file_id: FileId, version_id: VersionId) -> Result<()> {
        let file = self.index.get_file(file_id)?;
        let lock = self.box_lock(file.box_id);
        let _write = lock.write().unwrap_or_else(PoisonError::into_inner);
        let version = self.index.get_version(version_id)?;
        if version.file_id != file_id {
            return Err(Error::NotFound(format!("version {version_id}")));
        }
        self.index.with_tx(|tx| ops::set_current_version(tx, file_id, version_id, now_ms()))
    }

    // ---- read path --------------------------------------------------------

    /// Non-deleted files of a box, `updated_at DESC, name ASC`.
    pub fn list_files(&self, box_id: BoxId) -> Result<Vec<FileRecord>> {
        self.index.list_files(box_id)
    }

    /// Full-text search, best match first, soft-deleted excluded.
    pub fn search(&self, box_id: BoxId, query: &str) -> Result<Vec<FileRecord>> {
        let ids = self.index.search(box_id, query)?;
        ids.into_iter().map(|id| self.index.get_file(id)).collect()
    }

    /// Files of a box carrying `tag` (case-insensitive).
    pub fn filter_by_tag(&self, box_id: BoxId, tag: &str) -> Result<Vec<FileRecord>> {
        self.index.files_with_tag(box_id, tag)
    }

    /// Tags of a file, sorted.
    pub fn file_tags(&self, file_id: FileId) -> Result<Vec<String>> {
        self.index.tags_for(file_id)
    }

    /// One file row, box-checked and live.
    pub fn get_file(&self, box_id: BoxId, file_id: FileId) -> Result<FileRecord> {
        self.get_live_file(box_id, file_id)
    }

    /// One version row, file-checked.
    pub fn get_version(&self, file_id: FileId, version_id: VersionId) -> Result<VersionRecord> {
        let version = self.index.get_version(version_id)?;
        if version.file_id != file_id {
            return Err(Error::NotFound(format!("version {version_id}")));
        }
        Ok(version)
    }

    fn get_live_file(&self, box_id: BoxId, file_id: FileId) -> Result<FileRecord> {
        let file = self.index.get_file(file_id)?;
        if file.box_id != box_id || file.soft_deleted {
            return Err(Error::NotFound(format!("file {file_id}")));
        }
        Ok(file)
    }

    // ---- recovery ---------------------------------------------------------

    /// Crash-recovery pass for one box: drop `.incomplete` artifacts,
    /// unlink on-disk ciphertexts with no blob row, and drop zero-ref blob
    /// rows whose file is already gone.
    #[instrument(skip(self))]
    pub fn reap(&self, box_id: BoxId) -> Result<u64> {
        let lock = self.box_lock(box_id);
        let _write = lock.write().unwrap_or_else(PoisonError::into_inner);

        let mut reaped = self.blobs.cleanup_incomplete(box_id)?;
        let indexed = self.index.list_blob_hashes(box_id)?;
        for hash in self.blobs.list_hashes(box_id)? {
            if indexed.binary_search(&hash).is_err() {
                self.blobs.delete(box_id, &hash)?;
                reaped += 1;
            }
        }
        for hash in indexed {
            let Some(blob) = self.index.get_blob(box_id, &hash)? else { continue };
            if blob.ref_count == 0 && !self.blobs.exists(box_id, &hash) {
                self.index.with_tx(|tx| ops::delete_blob_row(tx, box_id, &hash))?;
                reaped += 1;
            }
        }
        if reaped > 0 {
            warn!(%box_id, reaped, "reaper removed orphaned artifacts");
        }
        Ok(reaped)
    }
}

impl std::fmt::Debug for BoxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxEngine").field("max_file_size", &self.max_file_size).finish()
    }
}

fn crypto_internal(e: CryptoError) -> Error {
    Error::Io(io::Error::other(e.to_string()))
}
