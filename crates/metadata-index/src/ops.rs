//! Row-level operations. Every function takes a plain connection so the
//! box engine can run several of them inside one transaction scope.

use std::collections::BTreeSet;
use std::io;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use shadowbox_core::entity::{BlobRecord, BoxRecord, FileRecord, VersionRecord};
use shadowbox_core::ids::{BoxId, FileId, VersionId};
use shadowbox_core::{Error, Result};

use crate::SEARCH_LIMIT;

/// Map a database failure into the core taxonomy: constraint violations
/// are conflicts, everything else is I/O.
pub fn db_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(e.to_string())
        }
        _ => Error::Io(io::Error::other(e.to_string())),
    }
}

fn conversion(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn id_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = uuid::Error>,
{
    let s: String = row.get(idx)?;
    T::from_str(&s).map_err(|e| conversion(idx, e))
}

fn bytes_col<const N: usize>(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; N]> {
    let v: Vec<u8> = row.get(idx)?;
    v.try_into().map_err(|_| {
        conversion(idx, io::Error::new(io::ErrorKind::InvalidData, "bad blob column length"))
    })
}

// ---- boxes ----------------------------------------------------------------

fn box_from_row(row: &Row<'_>) -> rusqlite::Result<BoxRecord> {
    Ok(BoxRecord {
        box_id: id_col(row, 0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        created_at_ms: row.get(3)?,
        is_public: row.get(4)?,
        kdf_salt: bytes_col(row, 5)?,
        wrapped_dek: row.get(6)?,
        soft_deleted: row.get(7)?,
    })
}

const BOX_COLS: &str =
    "box_id, name, owner, created_at, is_public, kdf_salt, wrapped_dek, soft_deleted";

/// Insert a new box row.
pub fn insert_box(conn: &Connection, rec: &BoxRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO boxes (box_id, name, owner, created_at, is_public, kdf_salt, wrapped_dek, soft_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            rec.box_id.to_string(),
            rec.name,
            rec.owner,
            rec.created_at_ms,
            rec.is_public,
            rec.kdf_salt.as_slice(),
            rec.wrapped_dek,
            rec.soft_deleted,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Fetch one box row or `NotFound`.
pub fn get_box(conn: &Connection, box_id: BoxId) -> Result<BoxRecord> {
    conn.query_row(
        &format!("SELECT {BOX_COLS} FROM boxes WHERE box_id = ?1"),
        params![box_id.to_string()],
        box_from_row,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Error::NotFound(format!("box {box_id}")))
}

/// Non-deleted boxes of `owner`, name order.
pub fn list_boxes(conn: &Connection, owner: &str) -> Result<Vec<BoxRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {BOX_COLS} FROM boxes WHERE owner = ?1 AND soft_deleted = 0 ORDER BY name ASC"
        ))
        .map_err(db_err)?;
    let rows = stmt.query_map(params![owner], box_from_row).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

// ---- files ----------------------------------------------------------------

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let current: Option<String> = row.get(4)?;
    Ok(FileRecord {
        file_id: id_col(row, 0)?,
        box_id: id_col(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        current_version_id: current
            .map(|s| VersionId::from_str(&s).map_err(|e| conversion(4, e)))
            .transpose()?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
        soft_deleted: row.get(7)?,
    })
}

const FILE_COLS: &str =
    "file_id, box_id, name, description, current_version_id, created_at, updated_at, soft_deleted";

/// Insert a new file row. A live duplicate `(box_id, name)` is `Conflict`.
pub fn insert_file(conn: &Connection, rec: &FileRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO files (file_id, box_id, name, description, current_version_id, created_at, updated_at, soft_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            rec.file_id.to_string(),
            rec.box_id.to_string(),
            rec.name,
            rec.description,
            rec.current_version_id.map(|v| v.to_string()),
            rec.created_at_ms,
            rec.updated_at_ms,
            rec.soft_deleted,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Fetch one file row or `NotFound`.
pub fn get_file(conn: &Connection, file_id: FileId) -> Result<FileRecord> {
    conn.query_row(
        &format!("SELECT {FILE_COLS} FROM files WHERE file_id = ?1"),
        params![file_id.to_string()],
        file_from_row,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
}

/// Look up a live file by name within a box.
pub fn find_file_by_name(conn: &Connection, box_id: BoxId, name: &str) -> Result<Option<FileRecord>> {
    conn.query_row(
        &format!(
            "SELECT {FILE_COLS} FROM files WHERE box_id = ?1 AND name = ?2 AND soft_deleted = 0"
        ),
        params![box_id.to_string(), name],
        file_from_row,
    )
    .optional()
    .map_err(db_err)
}

/// Non-deleted files of a box, `updated_at DESC, name ASC`.
pub fn list_files(conn: &Connection, box_id: BoxId) -> Result<Vec<FileRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {FILE_COLS} FROM files WHERE box_id = ?1 AND soft_deleted = 0
             ORDER BY updated_at DESC, name ASC"
        ))
        .map_err(db_err)?;
    let rows = stmt.query_map(params![box_id.to_string()], file_from_row).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

/// Point a file at a version and refresh `updated_at`.
pub fn set_current_version(
    conn: &Connection,
    file_id: FileId,
    version_id: VersionId,
    updated_at_ms: u64,
) -> Result<()> {
    let n = conn
        .execute(
            "UPDATE files SET current_version_id = ?2, updated_at = ?3 WHERE file_id = ?1",
            params![file_id.to_string(), version_id.to_string(), updated_at_ms],
        )
        .map_err(db_err)?;
    if n == 0 {
        return Err(Error::NotFound(format!("file {file_id}")));
    }
    Ok(())
}

/// Refresh a file's mutable metadata (description) and `updated_at`.
pub fn update_file_meta(
    conn: &Connection,
    file_id: FileId,
    description: &str,
    updated_at_ms: u64,
) -> Result<()> {
    let n = conn
        .execute(
            "UPDATE files SET description = ?2, updated_at = ?3 WHERE file_id = ?1",
            params![file_id.to_string(), description, updated_at_ms],
        )
        .map_err(db_err)?;
    if n == 0 {
        return Err(Error::NotFound(format!("file {file_id}")));
    }
    Ok(())
}

/// Flip the soft-deletion flag.
pub fn set_file_soft_deleted(
    conn: &Connection,
    file_id: FileId,
    deleted: bool,
    updated_at_ms: u64,
) -> Result<()> {
    let n = conn
        .execute(
            "UPDATE files SET soft_deleted = ?2, updated_at = ?3 WHERE file_id = ?1",
            params![file_id.to_string(), deleted, updated_at_ms],
        )
        .map_err(db_err)?;
    if n == 0 {
        return Err(Error::NotFound(format!("file {file_id}")));
    }
    Ok(())
}

/// Remove a file row entirely (hard delete path).
pub fn delete_file_row(conn: &Connection, file_id: FileId) -> Result<()> {
    conn.execute("DELETE FROM files WHERE file_id = ?1", params![file_id.to_string()])
        .map_err(db_err)?;
    Ok(())
}

// ---- versions -------------------------------------------------------------

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        version_id: id_col(row, 0)?,
        file_id: id_col(row, 1)?,
        blob_hash: row.get(2)?,
        size: row.get(3)?,
        mime: row.get(4)?,
        created_at_ms: row.get(5)?,
        seq: row.get(6)?,
    })
}

const VERSION_COLS: &str = "version_id, file_id, blob_hash, size, mime, created_at, seq";

/// Insert a version row.
pub fn insert_version(conn: &Connection, rec: &VersionRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO versions (version_id, file_id, blob_hash, size, mime, created_at, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rec.version_id.to_string(),
            rec.file_id.to_string(),
            rec.blob_hash,
            rec.size,
            rec.mime,
            rec.created_at_ms,
            rec.seq,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Fetch one version row or `NotFound`.
pub fn get_version(conn: &Connection, version_id: VersionId) -> Result<VersionRecord> {
    conn.query_row(
        &format!("SELECT {VERSION_COLS} FROM versions WHERE version_id = ?1"),
        params![version_id.to_string()],
        version_from_row,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Error::NotFound(format!("version {version_id}")))
}

/// Versions of a file, newest first.
pub fn list_versions(conn: &Connection, file_id: FileId) -> Result<Vec<VersionRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {VERSION_COLS} FROM versions WHERE file_id = ?1 ORDER BY seq DESC"
        ))
        .map_err(db_err)?;
    let rows = stmt.query_map(params![file_id.to_string()], version_from_row).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

/// Next sequence number for a file (1 for the first version).
pub fn next_seq(conn: &Connection, file_id: FileId) -> Result<u64> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM versions WHERE file_id = ?1",
        params![file_id.to_string()],
        |r| r.get(0),
    )
    .map_err(db_err)
}

/// Remove every version row of a file, returning them for blob accounting.
pub fn delete_versions_of(conn: &Connection, file_id: FileId) -> Result<Vec<VersionRecord>> {
    let versions = list_versions(conn, file_id)?;
    conn.execute("DELETE FROM versions WHERE file_id = ?1", params![file_id.to_string()])
        .map_err(db_err)?;
    Ok(versions)
}

// ---- blobs ----------------------------------------------------------------

fn blob_from_row(row: &Row<'_>) -> rusqlite::Result<BlobRecord> {
    Ok(BlobRecord {
        blob_hash: row.get(0)?,
        box_id: id_col(row, 1)?,
        ref_count: row.get(2)?,
        nonce: bytes_col(row, 3)?,
        tag: bytes_col(row, 4)?,
        ct_size: row.get(5)?,
        path_on_disk: row.get(6)?,
    })
}

const BLOB_COLS: &str = "blob_hash, box_id, ref_count, nonce, tag, ct_size, path_on_disk";

/// Insert a blob row.
pub fn insert_blob(conn: &Connection, rec: &BlobRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO blobs (blob_hash, box_id, ref_count, nonce, tag, ct_size, path_on_disk)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rec.blob_hash,
            rec.box_id.to_string(),
            rec.ref_count,
            rec.nonce.as_slice(),
            rec.tag.as_slice(),
            rec.ct_size,
            rec.path_on_disk,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Fetch a blob row if present.
pub fn get_blob(conn: &Connection, box_id: BoxId, blob_hash: &str) -> Result<Option<BlobRecord>> {
    conn.query_row(
        &format!("SELECT {BLOB_COLS} FROM blobs WHERE box_id = ?1 AND blob_hash = ?2"),
        params![box_id.to_string(), blob_hash],
        blob_from_row,
    )
    .optional()
    .map_err(db_err)
}

/// Adjust a blob's reference count by `delta`, returning the new count.
pub fn bump_blob_ref(conn: &Connection, box_id: BoxId, blob_hash: &str, delta: i64) -> Result<u64> {
    conn.query_row(
        "UPDATE blobs SET ref_count = ref_count + ?3
         WHERE box_id = ?1 AND blob_hash = ?2 RETURNING ref_count",
        params![box_id.to_string(), blob_hash, delta],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map_err(db_err)?
    .map(|n| u64::try_from(n).unwrap_or(0))
    .ok_or_else(|| Error::NotFound(format!("blob {blob_hash}")))
}

/// Remove a blob row (only once its refcount reached zero).
pub fn delete_blob_row(conn: &Connection, box_id: BoxId, blob_hash: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM blobs WHERE box_id = ?1 AND blob_hash = ?2",
        params![box_id.to_string(), blob_hash],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Hashes of every blob row of a box.
pub fn list_blob_hashes(conn: &Connection, box_id: BoxId) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT blob_hash FROM blobs WHERE box_id = ?1 ORDER BY blob_hash")
        .map_err(db_err)?;
    let rows = stmt.query_map(params![box_id.to_string()], |r| r.get(0)).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

// ---- tags -----------------------------------------------------------------

/// Normalize a tag set: lowercase, trimmed, deduped, empties dropped.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Replace the tag set of a file with the normalized form of `tags`.
pub fn set_tags(conn: &Connection, file_id: FileId, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM tags WHERE file_id = ?1", params![file_id.to_string()])
        .map_err(db_err)?;
    for tag in normalize_tags(tags) {
        conn.execute(
            "INSERT INTO tags (file_id, tag) VALUES (?1, ?2)",
            params![file_id.to_string(), tag],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

/// Tags of a file, sorted.
pub fn tags_for(conn: &Connection, file_id: FileId) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT tag FROM tags WHERE file_id = ?1 ORDER BY tag")
        .map_err(db_err)?;
    let rows = stmt.query_map(params![file_id.to_string()], |r| r.get(0)).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

/// Drop every tag row of a file.
pub fn delete_tags(conn: &Connection, file_id: FileId) -> Result<()> {
    conn.execute("DELETE FROM tags WHERE file_id = ?1", params![file_id.to_string()])
        .map_err(db_err)?;
    Ok(())
}

/// Live files of a box carrying `tag`, case-insensitively.
pub fn files_with_tag(conn: &Connection, box_id: BoxId, tag: &str) -> Result<Vec<FileRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT files.file_id, files.box_id, files.name, files.description, files.current_version_id, files.created_at, files.updated_at, files.soft_deleted FROM files
             JOIN tags ON tags.file_id = files.file_id
             WHERE files.box_id = ?1 AND files.soft_deleted = 0 AND tags.tag = lower(?2)
             ORDER BY files.updated_at DESC, files.name ASC"
        ))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![box_id.to_string(), tag], file_from_row)
        .map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

// ---- full-text ------------------------------------------------------------

/// Refresh the full-text row for a file.
pub fn fts_upsert(conn: &Connection, file: &FileRecord, tags: &[String]) -> Result<()> {
    fts_delete(conn, file.file_id)?;
    conn.execute(
        "INSERT INTO files_fts (file_id, name, description, tags) VALUES (?1, ?2, ?3, ?4)",
        params![file.file_id.to_string(), file.name, file.description, tags.join(" ")],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Drop the full-text row for a file.
pub fn fts_delete(conn: &Connection, file_id: FileId) -> Result<()> {
    conn.execute("DELETE FROM files_fts WHERE file_id = ?1", params![file_id.to_string()])
        .map_err(db_err)?;
    Ok(())
}

// Query tokens become quoted prefix terms: `foo` matches `foobar`.
fn fts_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// Relevance-ranked full-text search within one box.
pub fn search(conn: &Connection, box_id: BoxId, query: &str) -> Result<Vec<FileId>> {
    let Some(expr) = fts_expr(query) else {
        return Ok(Vec::new());
    };
    let mut stmt = conn
        .prepare(
            "SELECT f.file_id FROM files_fts
             JOIN files f ON f.file_id = files_fts.file_id
             WHERE files_fts MATCH ?1 AND f.box_id = ?2 AND f.soft_deleted = 0
             ORDER BY rank LIMIT ?3",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![expr, box_id.to_string(), SEARCH_LIMIT as i64], |r| id_col(r, 0))
        .map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_normalization() {
        let tags = vec!["  Work ".to_string(), "work".into(), String::new(), "B".into()];
        assert_eq!(normalize_tags(&tags), vec!["b", "work"]);
    }

    #[test]
    fn fts_expr_prefixes_and_lowercases() {
        assert_eq!(fts_expr("Foo bar-baz"), Some("\"foo\"* AND \"bar\"* AND \"baz\"*".into()));
        assert_eq!(fts_expr("  ,;  "), None);
    }
}
