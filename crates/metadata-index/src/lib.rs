//! Metadata index: one embedded SQLite database covering every box.
//!
//! WAL journal mode (snapshot-isolated readers), foreign keys on, and a
//! monotonic `user_version` migration chain where each migration runs in
//! its own transaction. Row-level operations live in [`ops`] and take a
//! plain connection so the box engine can compose several of them inside
//! one transaction via [`Index::with_tx`].

#![deny(unsafe_code)]

pub mod ops;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use shadowbox_core::ids::{BoxId, FileId, VersionId};
use shadowbox_core::entity::{BlobRecord, BoxRecord, FileRecord, VersionRecord};
use shadowbox_core::Result;
use tracing::info;

/// Hard cap on full-text search results.
pub const SEARCH_LIMIT: usize = 500;

const PRAGMAS: &str = "\
PRAGMA journal_mode = WAL;\n\
PRAGMA foreign_keys = ON;\n\
PRAGMA synchronous = NORMAL;\n";

// Migration chain. Index i upgrades user_version i -> i+1.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
CREATE TABLE boxes (
    box_id       TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    owner        TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    is_public    INTEGER NOT NULL DEFAULT 0,
    kdf_salt     BLOB NOT NULL,
    wrapped_dek  BLOB,
    soft_deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE files (
    file_id            TEXT PRIMARY KEY,
    box_id             TEXT NOT NULL REFERENCES boxes(box_id),
    name               TEXT NOT NULL,
    description        TEXT NOT NULL DEFAULT '',
    current_version_id TEXT,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL,
    soft_deleted       INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_files_box ON files(box_id);
CREATE UNIQUE INDEX idx_files_box_name ON files(box_id, name) WHERE soft_deleted = 0;

CREATE TABLE versions (
    version_id TEXT PRIMARY KEY,
    file_id    TEXT NOT NULL REFERENCES files(file_id),
    blob_hash  TEXT NOT NULL,
    size       INTEGER NOT NULL,
    mime       TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    seq        INTEGER NOT NULL,
    UNIQUE (file_id, seq)
);

CREATE TABLE blobs (
    blob_hash    TEXT NOT NULL,
    box_id       TEXT NOT NULL REFERENCES boxes(box_id),
    ref_count    INTEGER NOT NULL,
    nonce        BLOB NOT NULL,
    tag          BLOB NOT NULL,
    ct_size      INTEGER NOT NULL,
    path_on_disk TEXT NOT NULL,
    PRIMARY KEY (box_id, blob_hash)
);
CREATE INDEX idx_blobs_box ON blobs(box_id);

CREATE TABLE tags (
    file_id TEXT NOT NULL REFERENCES files(file_id),
    tag     TEXT NOT NULL,
    PRIMARY KEY (file_id, tag)
);

CREATE VIRTUAL TABLE files_fts USING fts5(file_id UNINDEXED, name, description, tags);
"#,
];

/// Shared handle to the index database.
#[derive(Clone)]
pub struct Index {
    conn: Arc<Mutex<Connection>>,
}

impl Index {
    /// Open (creating and migrating if needed) the index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(ops::db_err)?;
        Self::init(conn)
    }

    /// In-memory index, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(ops::db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMAS).map_err(ops::db_err)?;
        let mut conn = conn;
        let mut version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .map_err(ops::db_err)?;
        while (version as usize) < MIGRATIONS.len() {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(ops::db_err)?;
            tx.execute_batch(MIGRATIONS[version as usize]).map_err(ops::db_err)?;
            tx.pragma_update(None, "user_version", version + 1).map_err(ops::db_err)?;
            tx.commit().map_err(ops::db_err)?;
            version += 1;
            info!(version, "applied index migration");
        }
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Current schema version.
    pub fn user_version(&self) -> Result<i64> {
        let conn = self.lock();
        conn.query_row("PRAGMA user_version", [], |r| r.get(0)).map_err(ops::db_err)
    }

    /// Run `f` inside one immediate transaction. Commits on `Ok`, rolls
    /// back on `Err`. This is the scope handle the box engine uses to make
    /// multi-table writes atomic.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(ops::db_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(ops::db_err)?;
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // Read-side conveniences; writes normally go through `with_tx`.

    /// Fetch one box row.
    pub fn get_box(&self, box_id: BoxId) -> Result<BoxRecord> {
        ops::get_box(&self.lock(), box_id)
    }

    /// Non-deleted boxes belonging to `owner`, name order.
    pub fn list_boxes(&self, owner: &str) -> Result<Vec<BoxRecord>> {
        ops::list_boxes(&self.lock(), owner)
    }

    /// Fetch one file row.
    pub fn get_file(&self, file_id: FileId) -> Result<FileRecord> {
        ops::get_file(&self.lock(), file_id)
    }

    /// Non-deleted files of a box, `updated_at DESC, name ASC`.
    pub fn list_files(&self, box_id: BoxId) -> Result<Vec<FileRecord>> {
        ops::list_files(&self.lock(), box_id)
    }

    /// Versions of a file, `seq DESC`.
    pub fn list_versions(&self, file_id: FileId) -> Result<Vec<VersionRecord>> {
        ops::list_versions(&self.lock(), file_id)
    }

    /// Fetch one version row.
    pub fn get_version(&self, version_id: VersionId) -> Result<VersionRecord> {
        ops::get_version(&self.lock(), version_id)
    }

    /// Fetch a blob row if present.
    pub fn get_blob(&self, box_id: BoxId, blob_hash: &str) -> Result<Option<BlobRecord>> {
        ops::get_blob(&self.lock(), box_id, blob_hash)
    }

    /// Hashes of every blob row of a box (reaper support).
    pub fn list_blob_hashes(&self, box_id: BoxId) -> Result<Vec<String>> {
        ops::list_blob_hashes(&self.lock(), box_id)
    }

    /// Tags of a file, sorted.
    pub fn tags_for(&self, file_id: FileId) -> Result<Vec<String>> {
        ops::tags_for(&self.lock(), file_id)
    }

    /// Non-deleted files of a box carrying `tag` (case-insensitive).
    pub fn files_with_tag(&self, box_id: BoxId, tag: &str) -> Result<Vec<FileRecord>> {
        ops::files_with_tag(&self.lock(), box_id, tag)
    }

    /// Full-text search over name/description/tags with token-prefix
    /// expansion, best match first, at most [`SEARCH_LIMIT`] hits.
    pub fn search(&self, box_id: BoxId, query: &str) -> Result<Vec<FileId>> {
        ops::search(&self.lock(), box_id, query)
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowbox_core::ids::now_ms;
    use shadowbox_core::Error;

    fn sample_box() -> BoxRecord {
        BoxRecord {
            box_id: BoxId::new(),
            name: "photos".into(),
            owner: "alice".into(),
            created_at_ms: now_ms(),
            is_public: false,
            kdf_salt: [7u8; 16],
            wrapped_dek: Some(vec![1, 2, 3]),
            soft_deleted: false,
        }
    }

    #[test]
    fn migrations_apply_once() {
        let idx = Index::open_in_memory().unwrap();
        assert_eq!(idx.user_version().unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn migrations_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shadowbox.db");
        drop(Index::open(&path).unwrap());
        let idx = Index::open(&path).unwrap();
        assert_eq!(idx.user_version().unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn box_roundtrip() {
        let idx = Index::open_in_memory().unwrap();
        let rec = sample_box();
        idx.with_tx(|tx| ops::insert_box(tx, &rec)).unwrap();
        let got = idx.get_box(rec.box_id).unwrap();
        assert_eq!(got.name, "photos");
        assert_eq!(got.kdf_salt, rec.kdf_salt);
        assert_eq!(got.wrapped_dek, rec.wrapped_dek);
        assert_eq!(idx.list_boxes("alice").unwrap().len(), 1);
        assert!(idx.list_boxes("bob").unwrap().is_empty());
    }

    #[test]
    fn rollback_on_error_leaves_no_rows() {
        let idx = Index::open_in_memory().unwrap();
        let rec = sample_box();
        let res: Result<()> = idx.with_tx(|tx| {
            ops::insert_box(tx, &rec)?;
            Err(Error::Cancelled)
        });
        assert!(res.is_err());
        assert_eq!(idx.get_box(rec.box_id).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn duplicate_live_file_name_is_conflict() {
        let idx = Index::open_in_memory().unwrap();
        let b = sample_box();
        idx.with_tx(|tx| ops::insert_box(tx, &b)).unwrap();
        let mk = |name: &str| FileRecord {
            file_id: FileId::new(),
            box_id: b.box_id,
            name: name.into(),
            description: String::new(),
            current_version_id: None,
            created_at_ms: 1,
            updated_at_ms: 1,
            soft_deleted: false,
        };
        idx.with_tx(|tx| ops::insert_file(tx, &mk("a.txt"))).unwrap();
        let err = idx.with_tx(|tx| ops::insert_file(tx, &mk("a.txt"))).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn search_matches_token_prefixes() {
        let idx = Index::open_in_memory().unwrap();
        let b = sample_box();
        let f = FileRecord {
            file_id: FileId::new(),
            box_id: b.box_id,
            name: "vacation-photos.zip".into(),
            description: "summer island trip".into(),
            current_version_id: None,
            created_at_ms: 1,
            updated_at_ms: 1,
            soft_deleted: false,
        };
        idx.with_tx(|tx| {
            ops::insert_box(tx, &b)?;
            ops::insert_file(tx, &f)?;
            ops::set_tags(tx, f.file_id, &["Travel".into(), "beach".into()])?;
            ops::fts_upsert(tx, &f, &["travel".into(), "beach".into()])
        })
        .unwrap();

        assert_eq!(idx.search(b.box_id, "vaca").unwrap(), vec![f.file_id]);
        assert_eq!(idx.search(b.box_id, "summer isl").unwrap(), vec![f.file_id]);
        assert_eq!(idx.search(b.box_id, "trav").unwrap(), vec![f.file_id]);
        assert!(idx.search(b.box_id, "winter").unwrap().is_empty());
        assert!(idx.search(b.box_id, "").unwrap().is_empty());
        // other box sees nothing
        assert!(idx.search(BoxId::new(), "vaca").unwrap().is_empty());
    }

    #[test]
    fn tag_filter_is_case_insensitive() {
        let idx = Index::open_in_memory().unwrap();
        let b = sample_box();
        let f = FileRecord {
            file_id: FileId::new(),
            box_id: b.box_id,
            name: "r.txt".into(),
            description: String::new(),
            current_version_id: None,
            created_at_ms: 1,
            updated_at_ms: 1,
            soft_deleted: false,
        };
        idx.with_tx(|tx| {
            ops::insert_box(tx, &b)?;
            ops::insert_file(tx, &f)?;
            ops::set_tags(tx, f.file_id, &["Work".into(), "work".into(), "IMPORTANT".into()])
        })
        .unwrap();
        assert_eq!(idx.tags_for(f.file_id).unwrap(), vec!["important", "work"]);
        assert_eq!(idx.files_with_tag(b.box_id, "WORK").unwrap().len(), 1);
        assert_eq!(idx.files_with_tag(b.box_id, "important").unwrap().len(), 1);
        assert!(idx.files_with_tag(b.box_id, "missing").unwrap().is_empty());
    }

    #[test]
    fn version_sequence_and_ordering() {
        let idx = Index::open_in_memory().unwrap();
        let b = sample_box();
        let f = FileRecord {
            file_id: FileId::new(),
            box_id: b.box_id,
            name: "v.bin".into(),
            description: String::new(),
            current_version_id: None,
            created_at_ms: 1,
            updated_at_ms: 1,
            soft_deleted: false,
        };
        idx.with_tx(|tx| {
            ops::insert_box(tx, &b)?;
            ops::insert_file(tx, &f)?;
            for seq in 1..=3 {
                assert_eq!(ops::next_seq(tx, f.file_id)?, seq);
                ops::insert_version(
                    tx,
                    &VersionRecord {
                        version_id: VersionId::new(),
                        file_id: f.file_id,
                        blob_hash: "ab".repeat(32),
                        size: seq,
                        mime: "application/octet-stream".into(),
                        created_at_ms: seq,
                        seq,
                    },
                )?;
            }
            Ok(())
        })
        .unwrap();
        let versions = idx.list_versions(f.file_id).unwrap();
        assert_eq!(versions.iter().map(|v| v.seq).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn blob_refcount_lifecycle() {
        let idx = Index::open_in_memory().unwrap();
        let b = sample_box();
        let hash = "cd".repeat(32);
        idx.with_tx(|tx| {
            ops::insert_box(tx, &b)?;
            ops::insert_blob(
                tx,
                &BlobRecord {
                    blob_hash: hash.clone(),
                    box_id: b.box_id,
                    ref_count: 1,
                    nonce: [1u8; 12],
                    tag: [2u8; 16],
                    ct_size: 10,
                    path_on_disk: "p".into(),
                },
            )
        })
        .unwrap();
        let n = idx.with_tx(|tx| ops::bump_blob_ref(tx, b.box_id, &hash, 1)).unwrap();
        assert_eq!(n, 2);
        let n = idx.with_tx(|tx| ops::bump_blob_ref(tx, b.box_id, &hash, -2)).unwrap();
        assert_eq!(n, 0);
        idx.with_tx(|tx| ops::delete_blob_row(tx, b.box_id, &hash)).unwrap();
        assert!(idx.get_blob(b.box_id, &hash).unwrap().is_none());
    }
}
