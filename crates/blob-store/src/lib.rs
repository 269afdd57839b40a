//! Content-addressed blob store.
//!
//! Stores ciphertext payloads under
//! `storage_root/<box_id>/<first-2-of-hash>/<rest-of-hash>`, keyed by the
//! SHA-256 of the *plaintext*. The store never sees keys or plaintext: the
//! box engine encrypts before `put` and decrypts after `get`; the AEAD
//! nonce and tag travel with the metadata index row, not with the file.
//!
//! Durability: write to a `.incomplete` sibling, fsync, atomic rename, then
//! fsync the parent directory. A crash can leave `.incomplete` artifacts or
//! orphaned finals; `cleanup_incomplete` and `list_hashes` support the
//! engine's reaper pass.

#![deny(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use shadowbox_core::ids::BoxId;
use shadowbox_core::{Error, Result};
use tracing::{debug, warn};

/// Hex length of a SHA-256 blob hash.
pub const HASH_HEX_LEN: usize = 64;

const INCOMPLETE_EXT: &str = "incomplete";

/// Hex SHA-256 of `bytes`. This is the blob address of a plaintext.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn check_hash(hash: &str) -> Result<()> {
    if hash.len() == HASH_HEX_LEN
        && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        Ok(())
    } else {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("malformed blob hash: {hash:?}"),
        )))
    }
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// On-disk ciphertext store, one shard tree per box.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of a blob: `<root>/<box_id>/<2>/<62>`.
    pub fn path_for(&self, box_id: BoxId, hash: &str) -> PathBuf {
        self.root.join(box_id.to_string()).join(&hash[..2]).join(&hash[2..])
    }

    /// Store path of a blob relative to the root, recorded in the index.
    pub fn rel_path(box_id: BoxId, hash: &str) -> String {
        format!("{box_id}/{}/{}", &hash[..2], &hash[2..])
    }

    /// Whether the final file for this blob exists.
    pub fn exists(&self, box_id: BoxId, hash: &str) -> bool {
        check_hash(hash).is_ok() && self.path_for(box_id, hash).exists()
    }

    /// Write a ciphertext atomically. Idempotent: an existing final file of
    /// the same size is left untouched.
    pub fn put(&self, box_id: BoxId, hash: &str, ciphertext: &[u8]) -> Result<()> {
        check_hash(hash)?;
        let final_path = self.path_for(box_id, hash);
        if let Ok(meta) = fs::metadata(&final_path) {
            if meta.len() == ciphertext.len() as u64 {
                debug!(%box_id, hash, "blob already present");
                return Ok(());
            }
        }
        let parent = final_path.parent().expect("blob path always has a parent");
        fs::create_dir_all(parent)?;
        let tmp_path = final_path.with_extension(INCOMPLETE_EXT);
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(ciphertext)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        fsync_dir(parent)?;
        debug!(%box_id, hash, bytes = ciphertext.len(), "blob stored");
        Ok(())
    }

    /// Read a ciphertext back. `expected_ct_size` is the size recorded in
    /// the index row; a mismatch means the file was truncated or replaced.
    pub fn get(&self, box_id: BoxId, hash: &str, expected_ct_size: u64) -> Result<Vec<u8>> {
        check_hash(hash)?;
        let path = self.path_for(box_id, hash);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("blob {hash}")));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if bytes.len() as u64 != expected_ct_size {
            return Err(Error::IntegrityFailure(format!(
                "ciphertext size mismatch for {hash}: disk {} != recorded {expected_ct_size}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Unlink a blob file. The engine calls this only after the index row
    /// is gone. Missing files are tolerated (a prior crash may have won).
    pub fn delete(&self, box_id: BoxId, hash: &str) -> Result<()> {
        check_hash(hash)?;
        match fs::remove_file(self.path_for(box_id, hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(%box_id, hash, "blob file already gone");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Remove `.incomplete` leftovers under one box. Returns how many were
    /// unlinked.
    pub fn cleanup_incomplete(&self, box_id: BoxId) -> Result<u64> {
        let mut cleaned = 0;
        for entry in self.walk_box(box_id)? {
            let path = entry?;
            if path.extension().is_some_and(|e| e == INCOMPLETE_EXT) {
                fs::remove_file(&path)?;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            warn!(%box_id, cleaned, "removed incomplete blob artifacts");
        }
        Ok(cleaned)
    }

    /// Enumerate the hashes of every final blob file stored for a box.
    pub fn list_hashes(&self, box_id: BoxId) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in self.walk_box(box_id)? {
            let path = entry?;
            if path.extension().is_some() {
                continue;
            }
            let shard = path
                .parent()
                .and_then(Path::file_name)
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let rest = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            let hash = format!("{shard}{rest}");
            if check_hash(&hash).is_ok() {
                out.push(hash);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn walk_box(&self, box_id: BoxId) -> Result<impl Iterator<Item = Result<PathBuf>>> {
        let box_dir = self.root.join(box_id.to_string());
        let mut files = Vec::new();
        if box_dir.exists() {
            for shard in fs::read_dir(&box_dir)? {
                let shard = shard?.path();
                if !shard.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&shard)? {
                    files.push(entry.map(|e| e.path()).map_err(Error::Io));
                }
            }
        }
        Ok(files.into_iter())
    }
}
