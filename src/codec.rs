//! Authenticated-encryption codec for message payloads.
//!
//! Wire format: ASCII prefix `"enc:"` followed by base64 of
//! `nonce(24) ‖ ciphertext`. A string without the prefix is treated as
//! already-plaintext and returned unchanged by `decrypt` — a deliberate
//! backward-compatibility escape hatch, not silent failure.
//!
//! Cipher: X25519 static-static agreement → HKDF-SHA256 → XChaCha20-Poly1305
//! with a fresh random 192-bit nonce per call. Pure transform over provided
//! key material; no I/O.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

// ── Constants ───────────────────────────────────────────────

/// Sentinel marking an encrypted payload on the wire.
pub const CIPHERTEXT_PREFIX: &str = "enc:";

/// X25519 public/secret key length in bytes.
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// HKDF info string binding derived keys to this protocol.
const KDF_INFO: &[u8] = b"courier.box.v1";

// ── Error type ──────────────────────────────────────────────

/// Codec errors. `InvalidKey` is local and never retried; decryption
/// failure is localized to the message that carried the ciphertext.
#[derive(Debug, PartialEq)]
pub enum CodecError {
    /// Public key is not 32 bytes (after stripping a recognized
    /// one-byte 0x00/0x01 format prefix from a 33-byte input).
    InvalidKey(String),
    /// The AEAD primitive produced no output.
    EncryptionFailed,
    /// Authentication failed: tampered data, wrong key, or malformed
    /// nonce/ciphertext.
    DecryptionFailed(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidKey(detail) => write!(f, "invalid public key: {}", detail),
            CodecError::EncryptionFailed => write!(f, "encryption produced no output"),
            CodecError::DecryptionFailed(detail) => write!(f, "decryption failed: {}", detail),
        }
    }
}

impl std::error::Error for CodecError {}

// ── Key pair ────────────────────────────────────────────────

/// Local long-term X25519 key pair. Exactly one per installation;
/// the secret key never leaves the process boundary.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: [u8; KEY_LEN],
    pub secret_key: [u8; KEY_LEN],
}

impl KeyPair {
    /// Base64 of the public key, the form published to the relay.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// Generate a fresh X25519 key pair from OS entropy.
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        public_key: *public.as_bytes(),
        secret_key: secret.to_bytes(),
    }
}

// ── Key normalization ───────────────────────────────────────

/// Normalize a public key to exactly 32 bytes.
///
/// A 33-byte key with a recognized one-byte format prefix (0x00 or 0x01)
/// is stripped to 32; any other length or prefix is `InvalidKey`.
pub fn normalize_public_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], CodecError> {
    match bytes.len() {
        KEY_LEN => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(bytes);
            Ok(key)
        }
        33 if bytes[0] == 0x00 || bytes[0] == 0x01 => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes[1..]);
            Ok(key)
        }
        33 => Err(CodecError::InvalidKey(format!(
            "33 bytes with unrecognized prefix 0x{:02x}",
            bytes[0]
        ))),
        other => Err(CodecError::InvalidKey(format!(
            "{} bytes (expected {})",
            other, KEY_LEN
        ))),
    }
}

// ── Key derivation ──────────────────────────────────────────

/// Derive the symmetric AEAD key from the X25519 shared secret.
/// Symmetric in the two parties: DH(a_sk, b_pk) == DH(b_sk, a_pk).
fn derive_shared_key(remote_public: &[u8; KEY_LEN], local: &KeyPair) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(local.secret_key);
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    // 32-byte output is always within HKDF-SHA256 bounds.
    hk.expand(KDF_INFO, &mut okm)
        .expect("BUG: HKDF expand to 32 bytes is within bounds");
    okm
}

// ── Encrypt / Decrypt ───────────────────────────────────────

/// Encrypt `plaintext` for `recipient_public_key`, producing the wire
/// string `"enc:" + base64(nonce ‖ ciphertext)`.
pub fn encrypt(
    plaintext: &str,
    recipient_public_key: &[u8],
    local: &KeyPair,
) -> Result<String, CodecError> {
    let remote = normalize_public_key(recipient_public_key)?;
    let mut key = derive_shared_key(&remote, local);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CodecError::EncryptionFailed)?;
    key.zeroize();

    if ciphertext.is_empty() {
        return Err(CodecError::EncryptionFailed);
    }

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(format!("{}{}", CIPHERTEXT_PREFIX, BASE64.encode(&out)))
}

/// Decrypt a wire string produced by `encrypt`.
///
/// A string without the ciphertext prefix is returned unchanged
/// (legacy/plaintext escape hatch).
pub fn decrypt(
    wire: &str,
    sender_public_key: &[u8],
    local: &KeyPair,
) -> Result<String, CodecError> {
    let encoded = match wire.strip_prefix(CIPHERTEXT_PREFIX) {
        Some(rest) => rest,
        None => return Ok(wire.to_string()),
    };

    let remote = normalize_public_key(sender_public_key)?;

    let raw = BASE64
        .decode(encoded)
        .map_err(|e| CodecError::DecryptionFailed(format!("base64: {}", e)))?;
    if raw.len() <= NONCE_LEN {
        return Err(CodecError::DecryptionFailed(format!(
            "payload too short: {} bytes",
            raw.len()
        )));
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

    let mut key = derive_shared_key(&remote, local);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CodecError::DecryptionFailed("authentication failed".to_string()));
    key.zeroize();

    let plaintext = plaintext?;
    String::from_utf8(plaintext)
        .map_err(|_| CodecError::DecryptionFailed("plaintext is not UTF-8".to_string()))
}

// ── Tests ───────────────────────────────────────────────────
