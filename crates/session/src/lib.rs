//! Session manager: which boxes are unlocked right now.
//!
//! The only component allowed to hold unwrapped DEKs. Entries live in a
//! concurrent map; key material is zeroize-on-drop, so every removal path
//! (explicit lock, re-unlock replacement, idle sweep) overwrites the bytes.
//! The manager never touches the metadata index: the box engine fetches
//! the box row and hands the salt and wrapped DEK in.

#![deny(unsafe_code)]

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crypto::{derive_master_key, unwrap_dek, CryptoError, Dek};
use dashmap::DashMap;
use shadowbox_core::ids::{now_ms, BoxId};
use shadowbox_core::{Error, Result};
use tracing::{debug, info, warn};

struct SessionEntry {
    dek: Dek,
    unlocked_at_ms: u64,
    last_access_ms: u64,
}

/// Process-wide unlocked-box registry.
pub struct SessionManager {
    sessions: DashMap<BoxId, SessionEntry>,
    auto_lock_ms: AtomicU64,
}

impl SessionManager {
    /// Create a manager. `auto_lock_minutes = 0` disables idle locking.
    pub fn new(auto_lock_minutes: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            auto_lock_ms: AtomicU64::new(auto_lock_minutes * 60_000),
        }
    }

    /// Derive the master key from `password` and the box salt, unwrap the
    /// DEK, and cache it. A tag mismatch (wrong password or tampered row)
    /// is `AuthFailure`.
    pub fn unlock_with(
        &self,
        box_id: BoxId,
        kdf_salt: &[u8; crypto::SALT_LEN],
        wrapped_dek: &[u8],
        password: &str,
    ) -> Result<()> {
        let master = derive_master_key(password.as_bytes(), kdf_salt).map_err(internal)?;
        let dek = match unwrap_dek(&master, wrapped_dek) {
            Ok(dek) => dek,
            Err(CryptoError::Decrypt) => {
                warn!(%box_id, "unlock rejected");
                return Err(Error::AuthFailure);
            }
            Err(e) => return Err(internal(e)),
        };
        let now = now_ms();
        self.sessions.insert(
            box_id,
            SessionEntry { dek, unlocked_at_ms: now, last_access_ms: now },
        );
        info!(%box_id, "box unlocked");
        Ok(())
    }

    /// Cache a DEK the caller already holds (box creation hands the fresh
    /// DEK straight to its creator's session).
    pub fn adopt(&self, box_id: BoxId, dek: Dek) {
        let now = now_ms();
        self.sessions.insert(
            box_id,
            SessionEntry { dek, unlocked_at_ms: now, last_access_ms: now },
        );
        info!(%box_id, "box unlocked (creation)");
    }

    /// The cached DEK, or `Locked`. Refreshes the idle clock: every caller
    /// is about to perform a crypto operation.
    pub fn dek_for(&self, box_id: BoxId) -> Result<Dek> {
        match self.sessions.get_mut(&box_id) {
            Some(mut entry) => {
                entry.last_access_ms = now_ms();
                Ok(entry.dek.clone())
            }
            None => Err(Error::Locked(box_id.to_string())),
        }
    }

    /// Refresh the idle clock after a successful crypto operation.
    pub fn touch(&self, box_id: BoxId) {
        if let Some(mut entry) = self.sessions.get_mut(&box_id) {
            entry.last_access_ms = now_ms();
        }
    }

    /// Whether the box is currently unlocked.
    pub fn is_unlocked(&self, box_id: BoxId) -> bool {
        self.sessions.contains_key(&box_id)
    }

    /// Drop (and zeroize) the DEK for one box. Returns whether it was
    /// unlocked.
    pub fn lock(&self, box_id: BoxId) -> bool {
        let removed = self.sessions.remove(&box_id).is_some();
        if removed {
            info!(%box_id, "box locked");
        }
        removed
    }

    /// Drop every cached DEK.
    pub fn lock_all(&self) {
        let n = self.sessions.len();
        self.sessions.clear();
        if n > 0 {
            info!(locked = n, "all boxes locked");
        }
    }

    /// Change the idle window; takes effect at the next sweep.
    pub fn set_auto_lock(&self, minutes: u64) {
        self.auto_lock_ms.store(minutes * 60_000, Ordering::Relaxed);
    }

    /// Lock every box idle past the auto-lock window. Returns the ids that
    /// were locked. Called periodically by the auto-lock timer task.
    pub fn sweep_idle(&self, now: u64) -> Vec<BoxId> {
        let window = self.auto_lock_ms.load(Ordering::Relaxed);
        if window == 0 {
            return Vec::new();
        }
        let expired: Vec<BoxId> = self
            .sessions
            .iter()
            .filter(|e| now.saturating_sub(e.last_access_ms) >= window)
            .map(|e| *e.key())
            .collect();
        for box_id in &expired {
            self.sessions.remove(box_id);
            debug!(%box_id, "auto-locked idle box");
        }
        expired
    }

    /// How long ago the box was unlocked, if it is.
    pub fn unlocked_since_ms(&self, box_id: BoxId) -> Option<u64> {
        self.sessions.get(&box_id).map(|e| e.unlocked_at_ms)
    }
}

fn internal(e: CryptoError) -> Error {
    Error::Io(io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::{generate_dek, wrap_dek};

    fn wrapped(password: &str, salt: &[u8; crypto::SALT_LEN]) -> (Dek, Vec<u8>) {
        let master = derive_master_key(password.as_bytes(), salt).unwrap();
        let dek = generate_dek().unwrap();
        let wrapped = wrap_dek(&master, &dek).unwrap();
        (dek, wrapped)
    }

    #[test]
    fn unlock_then_dek_for() {
        let mgr = SessionManager::new(15);
        let box_id = BoxId::new();
        let salt = [1u8; crypto::SALT_LEN];
        let (dek, wrapped) = wrapped("p@ss", &salt);
        mgr.unlock_with(box_id, &salt, &wrapped, "p@ss").unwrap();
        assert_eq!(mgr.dek_for(box_id).unwrap().as_bytes(), dek.as_bytes());
    }

    #[test]
    fn wrong_password_is_auth_failure() {
        let mgr = SessionManager::new(15);
        let box_id = BoxId::new();
        let salt = [2u8; crypto::SALT_LEN];
        let (_, wrapped) = wrapped("right", &salt);
        let err = mgr.unlock_with(box_id, &salt, &wrapped, "wrong").unwrap_err();
        assert_eq!(err.kind(), "auth_failure");
        assert!(!mgr.is_unlocked(box_id));
    }

    #[test]
    fn lock_makes_dek_unavailable() {
        let mgr = SessionManager::new(15);
        let box_id = BoxId::new();
        let salt = [3u8; crypto::SALT_LEN];
        let (_, wrapped) = wrapped("p", &salt);
        mgr.unlock_with(box_id, &salt, &wrapped, "p").unwrap();
        assert!(mgr.lock(box_id));
        assert_eq!(mgr.dek_for(box_id).unwrap_err().kind(), "locked");
        assert!(!mgr.lock(box_id));
    }

    #[test]
    fn lock_all_clears_everything() {
        let mgr = SessionManager::new(15);
        let salt = [4u8; crypto::SALT_LEN];
        let ids: Vec<BoxId> = (0..3).map(|_| BoxId::new()).collect();
        for id in &ids {
            let (_, wrapped) = wrapped("p", &salt);
            mgr.unlock_with(*id, &salt, &wrapped, "p").unwrap();
        }
        mgr.lock_all();
        for id in &ids {
            assert!(!mgr.is_unlocked(*id));
        }
    }

    #[test]
    fn sweep_locks_only_idle_boxes() {
        let mgr = SessionManager::new(1); // 1 minute window
        let salt = [5u8; crypto::SALT_LEN];
        let idle = BoxId::new();
        let active = BoxId::new();
        for id in [idle, active] {
            let (_, wrapped) = wrapped("p", &salt);
            mgr.unlock_with(id, &salt, &wrapped, "p").unwrap();
        }
        // Pretend a sweep happens two minutes from now, with `active`
        // touched in between.
        let later = now_ms() + 2 * 60_000;
        mgr.touch(active);
        if let Some(mut e) = mgr.sessions.get_mut(&active) {
            e.last_access_ms = later;
        }
        let locked = mgr.sweep_idle(later);
        assert_eq!(locked, vec![idle]);
        assert!(mgr.is_unlocked(active));
        assert!(!mgr.is_unlocked(idle));
    }

    #[test]
    fn zero_window_disables_sweeping() {
        let mgr = SessionManager::new(0);
        let salt = [6u8; crypto::SALT_LEN];
        let box_id = BoxId::new();
        let (_, wrapped) = wrapped("p", &salt);
        mgr.unlock_with(box_id, &salt, &wrapped, "p").unwrap();
        assert!(mgr.sweep_idle(now_ms() + u64::MAX / 2).is_empty());
        assert!(mgr.is_unlocked(box_id));
    }
}
