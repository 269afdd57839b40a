//! Value records for the persisted entities. No in-memory object graph:
//! rows are resolved through the metadata index on demand and keyed by id.

use crate::ids::{BoxId, FileId, VersionId};

/// Byte length of a KDF salt.
pub const KDF_SALT_LEN: usize = 16;
/// Byte length of an AEAD nonce.
pub const NONCE_LEN: usize = 12;
/// Byte length of an AEAD authentication tag.
pub const TAG_LEN: usize = 16;

/// A Box row: one isolated, independently encrypted container.
#[derive(Debug, Clone)]
pub struct BoxRecord {
    /// Box identifier.
    pub box_id: BoxId,
    /// Display name.
    pub name: String,
    /// Owning username (the single writer).
    pub owner: String,
    /// Creation timestamp, ms since epoch.
    pub created_at_ms: u64,
    /// Whether the box is shared without a code gate.
    pub is_public: bool,
    /// Per-box Argon2id salt.
    pub kdf_salt: [u8; KDF_SALT_LEN],
    /// DEK wrapped under the owner's master key. A box with `None` here is
    /// irrecoverable.
    pub wrapped_dek: Option<Vec<u8>>,
    /// Soft-deletion flag.
    pub soft_deleted: bool,
}

/// A File row: named, tagged handle into a Box. Metadata is mutable;
/// content accretes as Versions.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// File identifier.
    pub file_id: FileId,
    /// Owning box.
    pub box_id: BoxId,
    /// Name, unique among non-deleted files of the box.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// The version served by default.
    pub current_version_id: Option<VersionId>,
    /// Creation timestamp, ms since epoch.
    pub created_at_ms: u64,
    /// Last metadata or content change, ms since epoch.
    pub updated_at_ms: u64,
    /// Soft-deletion flag.
    pub soft_deleted: bool,
}

/// A Version row: one immutable content snapshot.
#[derive(Debug, Clone)]
pub struct VersionRecord {
    /// Version identifier.
    pub version_id: VersionId,
    /// Owning file.
    pub file_id: FileId,
    /// Hex SHA-256 of the plaintext.
    pub blob_hash: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime: String,
    /// Creation timestamp, ms since epoch.
    pub created_at_ms: u64,
    /// Monotonic per-file sequence number, starting at 1.
    pub seq: u64,
}

/// A Blob row: one stored ciphertext, scoped to a box.
#[derive(Debug, Clone)]
pub struct BlobRecord {
    /// Hex SHA-256 of the plaintext.
    pub blob_hash: String,
    /// Owning box. The same plaintext in two boxes is two blobs.
    pub box_id: BoxId,
    /// Number of versions referencing this blob.
    pub ref_count: u64,
    /// AEAD nonce used for this ciphertext.
    pub nonce: [u8; NONCE_LEN],
    /// AEAD authentication tag.
    pub tag: [u8; TAG_LEN],
    /// On-disk ciphertext size in bytes.
    pub ct_size: u64,
    /// Path of the ciphertext file relative to the storage root.
    pub path_on_disk: String,
}
