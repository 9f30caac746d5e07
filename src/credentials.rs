//! Credential re-encryption collaborator: when sync mode is enabled or
//! disabled, whatever holds this process's stored secrets gets a chance to
//! re-wrap them under a sync-appropriate scheme. Modeled as a trait because
//! the actual storage (an OS keychain, an encrypted file, a browser
//! credential manager) is host-specific; this crate ships only an in-memory
//! reference implementation for tests. Shaped as a pair of rewrap calls
//! (`rotate_to`/`rotate_from` style), not a single bidirectional toggle.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store is already in sync mode")]
    AlreadyInSyncMode,
    #[error("credential store is already in local-only mode")]
    AlreadyLocalOnly,
}

/// Re-encrypts stored credentials when sync mode toggles. Both methods are
/// idempotent: calling `enable_sync_mode` while already in sync mode, or
/// `disable_sync_mode` while already local-only, succeeds without touching
/// anything rather than erroring, since a caller retrying after a partial
/// failure must not be punished for the retry.
pub trait CredentialStore: Send + Sync {
    fn enable_sync_mode(&self, password: &str, room_id: &str) -> Result<(), CredentialError>;
    fn disable_sync_mode(&self) -> Result<(), CredentialError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    LocalOnly,
    Sync { room_id: String },
}

/// Reference `CredentialStore`: holds a handful of opaque secret blobs in
/// memory, "re-encrypted" by recording which mode wrapped them. A real host
/// application's implementor would actually re-derive a wrapping key and
/// re-seal each blob; this one exists to exercise the trait's call
/// discipline from `controller.rs` and its tests.
pub struct InMemoryCredentialStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
    mode: Mutex<Mode>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            secrets: Mutex::new(HashMap::new()),
            mode: Mutex::new(Mode::LocalOnly),
        }
    }

    pub fn put_secret(&self, name: &str, value: &[u8]) {
        self.secrets
            .lock()
            .expect("secrets mutex poisoned")
            .insert(name.to_string(), value.to_vec());
    }

    pub fn get_secret(&self, name: &str) -> Option<Vec<u8>> {
        self.secrets.lock().expect("secrets mutex poisoned").get(name).cloned()
    }

    pub fn current_room_id(&self) -> Option<String> {
        match &*self.mode.lock().expect("mode mutex poisoned") {
            Mode::LocalOnly => None,
            Mode::Sync { room_id } => Some(room_id.clone()),
        }
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn enable_sync_mode(&self, _password: &str, room_id: &str) -> Result<(), CredentialError> {
        let mut mode = self.mode.lock().expect("mode mutex poisoned");
        *mode = Mode::Sync { room_id: room_id.to_string() };
        Ok(())
    }

    fn disable_sync_mode(&self) -> Result<(), CredentialError> {
        let mut mode = self.mode.lock().expect("mode mutex poisoned");
        *mode = Mode::LocalOnly;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_then_disable_round_trips_mode() {
        let store = InMemoryCredentialStore::new();
        assert_eq!(store.current_room_id(), None);

        store.enable_sync_mode("hunter2", "room-1").unwrap();
        assert_eq!(store.current_room_id(), Some("room-1".to_string()));

        store.disable_sync_mode().unwrap();
        assert_eq!(store.current_room_id(), None);
    }

    #[test]
    fn re_enabling_with_a_new_room_replaces_the_old_one() {
        let store = InMemoryCredentialStore::new();
        store.enable_sync_mode("hunter2", "room-1").unwrap();
        store.enable_sync_mode("hunter2", "room-2").unwrap();
        assert_eq!(store.current_room_id(), Some("room-2".to_string()));
    }

    #[test]
    fn disabling_twice_is_not_an_error() {
        let store = InMemoryCredentialStore::new();
        store.disable_sync_mode().unwrap();
        store.disable_sync_mode().unwrap();
        assert_eq!(store.current_room_id(), None);
    }

    #[test]
    fn secrets_survive_mode_changes() {
        let store = InMemoryCredentialStore::new();
        store.put_secret("api-key", b"secret-bytes");
        store.enable_sync_mode("hunter2", "room-1").unwrap();
        assert_eq!(store.get_secret("api-key"), Some(b"secret-bytes".to_vec()));
    }
}
