//! On-disk identity: the local long-term X25519 key pair.
//!
//! One 64-byte file, `public_key (32) || secret_key (32)`, found via
//! `COURIER_IDENTITY_PATH` or at `$HOME/.courier/identity.key`. Loading
//! is fail-closed: a file of the wrong length, or one readable by group
//! or world, stops the daemon instead of silently minting a fresh
//! identity. First run creates the directory 0700 and the file 0600.
//! Secret bytes stay out of the logs, and scratch buffers are zeroized.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use zeroize::Zeroize;

use crate::codec::{generate_keypair, KeyPair, KEY_LEN};

// ── Constants ───────────────────────────────────────────────

/// Identity file length: two raw 32-byte keys.
const KEY_FILE_LEN: usize = 2 * KEY_LEN;

/// Only mode the identity file may carry.
const KEY_FILE_MODE: u32 = 0o600;

/// Mode given to the identity directory when this module creates it.
const KEY_DIR_MODE: u32 = 0o700;

/// Loosest acceptable mode for an existing identity directory.
const KEY_DIR_MAX_MODE: u32 = 0o700;

/// Env override for the identity file path.
const ENV_IDENTITY_PATH: &str = "COURIER_IDENTITY_PATH";

/// Default subdirectory under $HOME.
const DEFAULT_DIR_NAME: &str = ".courier";

/// Default key file name.
const DEFAULT_FILE_NAME: &str = "identity.key";

// ── Error type ──────────────────────────────────────────────

/// Why an identity could not be located, read, or minted.
#[derive(Debug)]
pub enum KeyStoreError {
    /// No path to work with: neither the env override nor HOME is set.
    NoHomePath,
    /// The identity directory grants group or world access.
    DirTooPermissive { path: PathBuf, mode: u32 },
    /// The identity file is not mode 0600.
    FileTooPermissive { path: PathBuf, mode: u32 },
    /// The identity file is not exactly 64 bytes.
    CorruptKeyFile { path: PathBuf, actual_len: usize },
    /// Filesystem I/O error.
    Io(io::Error),
}

impl fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHomePath => write!(
                f,
                "cannot locate the identity file: set {} or HOME",
                ENV_IDENTITY_PATH
            ),
            Self::DirTooPermissive { path, mode } => write!(
                f,
                "identity directory {:?} is mode {:04o}; only owner access (at most {:04o}) is allowed",
                path, mode, KEY_DIR_MAX_MODE
            ),
            Self::FileTooPermissive { path, mode } => write!(
                f,
                "identity file {:?} must be mode {:04o}, found {:04o}",
                path, KEY_FILE_MODE, mode
            ),
            Self::CorruptKeyFile { path, actual_len } => write!(
                f,
                "identity file {:?} holds {} bytes instead of {}; refusing to start on possible corruption",
                path, actual_len, KEY_FILE_LEN
            ),
            Self::Io(e) => write!(f, "identity store I/O: {}", e),
        }
    }
}

impl std::error::Error for KeyStoreError {}

impl From<io::Error> for KeyStoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ── Public API ──────────────────────────────────────────────

/// Where the identity file lives: the env override wins, otherwise
/// `$HOME/.courier/identity.key`.
pub fn resolve_key_path() -> Result<PathBuf, KeyStoreError> {
    if let Ok(custom) = std::env::var(ENV_IDENTITY_PATH) {
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => Ok(PathBuf::from(home)
            .join(DEFAULT_DIR_NAME)
            .join(DEFAULT_FILE_NAME)),
        _ => Err(KeyStoreError::NoHomePath),
    }
}

/// Create the identity directory 0700 if missing; reject an existing one
/// that grants group or world access.
pub fn ensure_parent_dir_secure(path: &Path) -> Result<(), KeyStoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => {
            return Err(KeyStoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "key path has no parent directory",
            )))
        }
    };

    if parent.exists() {
        let meta = fs::metadata(parent)?;
        let mode = meta.permissions().mode() & 0o777;
        if mode & !KEY_DIR_MAX_MODE != 0 {
            return Err(KeyStoreError::DirTooPermissive {
                path: parent.to_path_buf(),
                mode,
            });
        }
        Ok(())
    } else {
        fs::create_dir_all(parent)?;
        fs::set_permissions(parent, fs::Permissions::from_mode(KEY_DIR_MODE))?;
        eprintln!("[keystore] new identity directory {:?}", parent);
        Ok(())
    }
}

/// The identity file must be exactly mode 0600.
pub fn validate_file_mode_0600(path: &Path) -> Result<(), KeyStoreError> {
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != KEY_FILE_MODE {
        return Err(KeyStoreError::FileTooPermissive {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// Load the identity, or mint one on first run. An existing file is
/// validated for length and mode and is never overwritten; corruption and
/// permission violations are hard errors.
pub fn load_or_create_keypair(path: &Path) -> Result<KeyPair, KeyStoreError> {
    ensure_parent_dir_secure(path)?;

    if path.exists() {
        load_keypair(path)
    } else {
        create_keypair(path)
    }
}

// ── Internal helpers ────────────────────────────────────────

/// Read and validate an existing identity file.
fn load_keypair(path: &Path) -> Result<KeyPair, KeyStoreError> {
    validate_file_mode_0600(path)?;

    let mut data = fs::read(path)?;
    if data.len() != KEY_FILE_LEN {
        let actual_len = data.len();
        data.zeroize();
        return Err(KeyStoreError::CorruptKeyFile {
            path: path.to_path_buf(),
            actual_len,
        });
    }

    let mut public_key = [0u8; KEY_LEN];
    let mut secret_key = [0u8; KEY_LEN];
    public_key.copy_from_slice(&data[..KEY_LEN]);
    secret_key.copy_from_slice(&data[KEY_LEN..]);
    data.zeroize();

    eprintln!("[keystore] identity loaded from {:?}", path);

    Ok(KeyPair {
        public_key,
        secret_key,
    })
}

/// Mint a fresh key pair and write it atomically: temp file, chmod,
/// rename.
fn create_keypair(path: &Path) -> Result<KeyPair, KeyStoreError> {
    let kp = generate_keypair();

    // 64-byte payload: public_key || secret_key
    let mut buf = [0u8; KEY_FILE_LEN];
    buf[..KEY_LEN].copy_from_slice(&kp.public_key);
    buf[KEY_LEN..].copy_from_slice(&kp.secret_key);

    let parent = path.parent().ok_or_else(|| {
        KeyStoreError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "key path has no parent directory",
        ))
    })?;

    let tmp_name = format!("{}.tmp.{}", DEFAULT_FILE_NAME, std::process::id());
    let tmp_path = parent.join(&tmp_name);

    fs::write(&tmp_path, buf)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
    fs::rename(&tmp_path, path)?;

    buf.zeroize();

    validate_file_mode_0600(path)?;

    eprintln!("[keystore] minted identity at {:?}", path);

    Ok(kp)
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "courier-keystore-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn resolve_path_uses_env_override() {
        let orig = std::env::var(ENV_IDENTITY_PATH).ok();
        std::env::set_var(ENV_IDENTITY_PATH, "/tmp/test-courier-key");

        let path = resolve_key_path();
        assert_eq!(path.unwrap(), PathBuf::from("/tmp/test-courier-key"));

        match orig {
            Some(v) => std::env::set_var(ENV_IDENTITY_PATH, v),
            None => std::env::remove_var(ENV_IDENTITY_PATH),
        }
    }

    #[test]
    fn create_then_load_roundtrip() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("identity.key");

        let created = load_or_create_keypair(&path).unwrap();
        assert!(path.exists());

        let loaded = load_or_create_keypair(&path).unwrap();
        assert_eq!(loaded.public_key, created.public_key);
        assert_eq!(loaded.secret_key, created.secret_key);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn created_file_has_mode_0600() {
        let dir = temp_dir("mode");
        let path = dir.join("identity.key");
        load_or_create_keypair(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_FILE_MODE);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_is_rejected_not_regenerated() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(KEY_DIR_MODE)).unwrap();
        let path = dir.join("identity.key");
        fs::write(&path, [0u8; 32]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(KEY_FILE_MODE)).unwrap();

        let result = load_or_create_keypair(&path);
        assert!(matches!(
            result,
            Err(KeyStoreError::CorruptKeyFile { actual_len: 32, .. })
        ));
        // The corrupt file must still be there, untouched.
        assert_eq!(fs::read(&path).unwrap().len(), 32);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn permissive_file_is_rejected() {
        let dir = temp_dir("perm");
        fs::create_dir_all(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(KEY_DIR_MODE)).unwrap();
        let path = dir.join("identity.key");
        fs::write(&path, [0u8; KEY_FILE_LEN]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let result = load_or_create_keypair(&path);
        assert!(matches!(
            result,
            Err(KeyStoreError::FileTooPermissive { mode: 0o644, .. })
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn error_display_corrupt() {
        let err = KeyStoreError::CorruptKeyFile {
            path: PathBuf::from("/tmp/test"),
            actual_len: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("32"));
        assert!(msg.contains("64"));
        assert!(msg.contains("corruption"));
    }
}
