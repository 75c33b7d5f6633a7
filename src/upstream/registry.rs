//! Process-wide registry of active sessions per credential
//!
//! The upstream service allows one live stream per credential. Within this
//! process the registry enforces the same rule so a second daemon activation
//! deterministically evicts the first instead of racing it upstream.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of attempting to claim a credential
#[derive(Debug)]
pub enum RegisterOutcome {
    /// The credential was free and is now held by the caller
    Registered,
    /// Another session holds it; its identifier is returned so the caller
    /// can decide to evict
    Held {
        /// Session currently holding the credential
        holder: Uuid,
    },
}

#[derive(Debug)]
struct Entry {
    session_id: Uuid,
    cancel: CancellationToken,
}

/// Tracks which session currently owns each credential
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `credential` for `session_id`.
    ///
    /// If another session holds it, nothing changes and the holder is
    /// reported. Re-registering the same session is a no-op success.
    pub fn try_register(
        &self,
        credential: &str,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> RegisterOutcome {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(credential) {
            if entry.session_id == session_id {
                return RegisterOutcome::Registered;
            }
            return RegisterOutcome::Held {
                holder: entry.session_id,
            };
        }
        entries.insert(credential.to_string(), Entry { session_id, cancel });
        RegisterOutcome::Registered
    }

    /// Cancel and remove whichever session holds `credential`.
    ///
    /// Returns the evicted session's identifier, or `None` if the
    /// credential was free.
    pub fn evict(&self, credential: &str) -> Option<Uuid> {
        let entry = self.lock().remove(credential)?;
        entry.cancel.cancel();
        tracing::info!(
            session = %entry.session_id,
            "evicted previous session holding credential"
        );
        Some(entry.session_id)
    }

    /// Release `credential` if (and only if) `session_id` holds it.
    ///
    /// A session that was evicted must not release its successor's claim.
    pub fn release(&self, credential: &str, session_id: Uuid) -> bool {
        let mut entries = self.lock();
        match entries.get(credential) {
            Some(entry) if entry.session_id == session_id => {
                entries.remove(credential);
                true
            }
            _ => false,
        }
    }

    /// Session currently holding `credential`, if any
    #[must_use]
    pub fn holder(&self, credential: &str) -> Option<Uuid> {
        self.lock().get(credential).map(|e| e.session_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
