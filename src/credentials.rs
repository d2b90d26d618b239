//! Durable credential slot
//!
//! Holds the last issued token pair across process restarts. All operations
//! are synchronous and infallible from the caller's point of view: a missing,
//! unreadable or corrupt slot reads as absent, and write failures are logged.
//! There is no cross-process locking.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::TokenPair;

/// Storage for the durable copy of the token pair.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<TokenPair>;
    fn set(&self, tokens: &TokenPair);
    fn clear(&self);
}

/// JSON file holding `access_token`, `refresh_token` and optional `expires_at`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/ats-client/credentials.json`, falling back to the working
    /// directory when the platform has no data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ats-client")
            .join("credentials.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, tokens: &TokenPair) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(tokens)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<TokenPair> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read credential file");
                return None;
            }
        };
        match serde_json::from_slice::<TokenPair>(&bytes) {
            Ok(tokens) if !tokens.access.is_empty() => Some(tokens),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt credential file");
                None
            }
        }
    }

    fn set(&self, tokens: &TokenPair) {
        match self.write(tokens) {
            Ok(()) => debug!(path = %self.path.display(), "Credentials persisted"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to persist credentials"),
        }
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Credentials cleared"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to clear credentials"),
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<TokenPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            slot: Mutex::new(Some(tokens)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<TokenPair> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    fn set(&self, tokens: &TokenPair) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(tokens.clone());
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}
