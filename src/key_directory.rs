//! Participant-id → public-key resolution with caching.
//!
//! Lookup order: in-memory cache → local roster (contacts already held by
//! the caller) → remote single-user lookup through the `RemoteKeyLookup`
//! seam. A remotely resolved key is validated (44 base64 chars decoding to
//! exactly 32 bytes) before caching; invalid format surfaces `InvalidKey`
//! without caching, and failed resolutions are never cached.
//!
//! The directory is shared read-mostly across all sessions of one local
//! user. The mutex is held across the whole resolve, so concurrent callers
//! observe at most one remote call per id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::codec::KEY_LEN;

// ── Constants ───────────────────────────────────────────────

/// Base64 length of a 32-byte key.
const KEY_B64_LEN: usize = 44;

// ── Types ───────────────────────────────────────────────────

/// Where a cached key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Cache,
    Roster,
    Remote,
}

/// One resolved key. Lives for the process lifetime once cached.
#[derive(Debug, Clone)]
pub struct PublicKeyCacheEntry {
    pub participant_id: String,
    pub public_key: String,
    pub source: KeySource,
}

/// Seam to the out-of-scope REST layer: fetch one participant's key.
/// `Ok(None)` means the participant is unknown remotely. The directory is
/// shared behind an `Arc` across threads, so implementations must be
/// `Sync` as well as `Send`.
pub trait RemoteKeyLookup: Send + Sync {
    fn fetch(&self, participant_id: &str) -> Result<Option<String>, String>;
}

// ── Error type ──────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum DirectoryError {
    /// No key anywhere: cache, roster, or remote.
    NotFound,
    /// Remote returned a key that is not 44 base64 chars / 32 bytes.
    InvalidKey(String),
    /// Remote lookup failed (transport-level). Not cached; retryable.
    RemoteUnavailable(String),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryError::NotFound => write!(f, "no public key known for participant"),
            DirectoryError::InvalidKey(detail) => {
                write!(f, "remote key has invalid format: {}", detail)
            }
            DirectoryError::RemoteUnavailable(detail) => {
                write!(f, "remote key lookup failed: {}", detail)
            }
        }
    }
}

impl std::error::Error for DirectoryError {}

// ── Directory ───────────────────────────────────────────────

struct DirectoryInner {
    cache: HashMap<String, PublicKeyCacheEntry>,
    roster: HashMap<String, String>,
}

/// Key directory for one local user.
pub struct KeyDirectory {
    inner: Mutex<DirectoryInner>,
    remote: Box<dyn RemoteKeyLookup>,
}

impl KeyDirectory {
    pub fn new(remote: Box<dyn RemoteKeyLookup>) -> Self {
        Self {
            inner: Mutex::new(DirectoryInner {
                cache: HashMap::new(),
                roster: HashMap::new(),
            }),
            remote,
        }
    }

    /// Record a locally known contact key (contacts list, search results).
    /// Roster entries are consulted after the cache and before the remote.
    pub fn add_roster_entry(&self, participant_id: &str, public_key_b64: &str) {
        let mut inner = self.inner.lock().expect("key directory lock poisoned");
        inner
            .roster
            .insert(participant_id.to_string(), public_key_b64.to_string());
    }

    /// Key rotation invalidates any cached copy for that participant.
    pub fn invalidate(&self, participant_id: &str) {
        let mut inner = self.inner.lock().expect("key directory lock poisoned");
        inner.cache.remove(participant_id);
        inner.roster.remove(participant_id);
    }

    /// The key if it is already in the cache or the roster. Never calls
    /// the remote lookup, so it cannot block on network I/O.
    pub fn peek(&self, participant_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("key directory lock poisoned");
        inner
            .cache
            .get(participant_id)
            .map(|e| e.public_key.clone())
            .or_else(|| inner.roster.get(participant_id).cloned())
    }

    /// Resolve a participant id to their base64 public key.
    pub fn resolve(&self, participant_id: &str) -> Result<String, DirectoryError> {
        let mut inner = self.inner.lock().expect("key directory lock poisoned");

        if let Some(entry) = inner.cache.get(participant_id) {
            return Ok(entry.public_key.clone());
        }

        if let Some(key) = inner.roster.get(participant_id).cloned() {
            inner.cache.insert(
                participant_id.to_string(),
                PublicKeyCacheEntry {
                    participant_id: participant_id.to_string(),
                    public_key: key.clone(),
                    source: KeySource::Roster,
                },
            );
            return Ok(key);
        }

        // Lock is held across the remote call: later callers hit the cache.
        let key = self
            .remote
            .fetch(participant_id)
            .map_err(DirectoryError::RemoteUnavailable)?
            .ok_or(DirectoryError::NotFound)?;

        validate_key_format(&key)?;

        inner.cache.insert(
            participant_id.to_string(),
            PublicKeyCacheEntry {
                participant_id: participant_id.to_string(),
                public_key: key.clone(),
                source: KeySource::Remote,
            },
        );
        Ok(key)
    }

    /// Resolve to raw key bytes, decoding the cached base64.
    pub fn resolve_bytes(&self, participant_id: &str) -> Result<Vec<u8>, DirectoryError> {
        let b64 = self.resolve(participant_id)?;
        BASE64
            .decode(&b64)
            .map_err(|e| DirectoryError::InvalidKey(format!("base64: {}", e)))
    }

    /// Source recorded for a cached id (diagnostics and tests).
    pub fn cached_source(&self, participant_id: &str) -> Option<KeySource> {
        let inner = self.inner.lock().expect("key directory lock poisoned");
        inner.cache.get(participant_id).map(|e| e.source)
    }
}

/// Validate a remotely fetched key: 44 base64 chars, 32 decoded bytes.
fn validate_key_format(key_b64: &str) -> Result<(), DirectoryError> {
    if key_b64.len() != KEY_B64_LEN {
        return Err(DirectoryError::InvalidKey(format!(
            "{} chars (expected {})",
            key_b64.len(),
            KEY_B64_LEN
        )));
    }
    let decoded = BASE64
        .decode(key_b64)
        .map_err(|e| DirectoryError::InvalidKey(format!("base64: {}", e)))?;
    if decoded.len() != KEY_LEN {
        return Err(DirectoryError::InvalidKey(format!(
            "{} bytes (expected {})",
            decoded.len(),
            KEY_LEN
        )));
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────
