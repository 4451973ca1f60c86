//! Password-at-rest encryption (§6, supplemented from
//! `original_source/deployment/encryption.py`). The original derives a key via
//! PBKDF2-HMAC-SHA256 and encrypts with Fernet (AES-128-CBC + HMAC); no Fernet
//! crate is available here, so the key derivation is kept identical and the
//! cipher is swapped for AES-256-GCM, an AEAD construction that is a strict
//! upgrade in the properties that matter (authenticated encryption) while
//! giving up Fernet's self-describing token format. This is a deliberate
//! behavior change, recorded in DESIGN.md, not an oversight: ciphertext
//! produced by the original deployment tool cannot be read back by this one.
//! The shared-passphrase / ssh-agent key exchange flow is out of scope.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{DeployError, Result};

const PBKDF2_ITERATIONS: u32 = 480_000;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Salts are versioned (leading byte) the same way the original's
/// `current_key_derivation_version` tags its salts, so a future KDF change
/// doesn't silently break decryption of passwords encrypted under this one.
const KEY_DERIVATION_VERSION: u8 = 1;

/// Derives a 32-byte key from `passphrase` and `salt` (hex-encoded, version-prefixed).
pub fn derive_key(passphrase: &str, salt_hex: &str) -> Result<[u8; KEY_LEN]> {
    let salt = hex::decode(salt_hex)
        .map_err(|e| DeployError::config(format!("invalid password_salt: {e}")))?;
    let body = match salt.split_first() {
        Some((&KEY_DERIVATION_VERSION, rest)) => rest,
        Some((other, _)) => {
            return Err(DeployError::config(format!("unsupported key derivation version: {other}")))
        }
        None => return Err(DeployError::config("password_salt is empty")),
    };
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), body, PBKDF2_ITERATIONS, &mut key);
    Ok(key)
}

pub fn generate_salt() -> String {
    let mut salt = vec![KEY_DERIVATION_VERSION];
    let mut body = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut body);
    salt.extend_from_slice(&body);
    hex::encode(salt)
}

/// Encrypts `plaintext` with a key derived from `passphrase`/`salt_hex`.
/// Returns a base64 string of `nonce || ciphertext`.
pub fn encrypt(plaintext: &str, passphrase: &str, salt_hex: &str) -> Result<String> {
    let key = derive_key(passphrase, salt_hex)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| DeployError::message(format!("cipher init failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| DeployError::message(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Decrypts a string produced by [`encrypt`].
pub fn decrypt(encoded: &str, passphrase: &str, salt_hex: &str) -> Result<String> {
    let key = derive_key(passphrase, salt_hex)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| DeployError::message(format!("cipher init failed: {e}")))?;

    let raw = BASE64
        .decode(encoded)
        .map_err(|e| DeployError::DecryptionFailed(format!("invalid base64: {e}")))?;
    if raw.len() < NONCE_LEN {
        return Err(DeployError::DecryptionFailed("ciphertext too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| DeployError::DecryptionFailed("wrong passphrase or corrupted data".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|e| DeployError::DecryptionFailed(format!("decrypted data is not valid utf-8: {e}")))
}

/// Resolves the effective plaintext password from a `Config`: if
/// `password_encryption` is set and both `password_encrypted`/`password_salt`
/// are present, decrypts using `passphrase`; otherwise returns the plaintext
/// `password` field unchanged.
pub fn resolve_password(
    password: &str,
    password_encrypted: Option<&str>,
    password_salt: Option<&str>,
    password_encryption: bool,
    passphrase: &str,
) -> Result<String> {
    if !password_encryption {
        return Ok(password.to_string());
    }
    let (encrypted, salt) = match (password_encrypted, password_salt) {
        (Some(e), Some(s)) => (e, s),
        _ => return Err(DeployError::config("password_encryption is set but password_encrypted/password_salt are missing")),
    };
    decrypt(encrypted, passphrase, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let salt = generate_salt();
        let ciphertext = encrypt("hunter2", "my passphrase", &salt).unwrap();
        let plaintext = decrypt(&ciphertext, "my passphrase", &salt).unwrap();
        assert_eq!(plaintext, "hunter2");
    }

    #[test]
    fn wrong_passphrase_fails_to_decrypt() {
        let salt = generate_salt();
        let ciphertext = encrypt("hunter2", "correct horse", &salt).unwrap();
        let err = decrypt(&ciphertext, "incorrect horse", &salt).unwrap_err();
        assert!(matches!(err, DeployError::DecryptionFailed(_)));
    }

    #[test]
    fn same_plaintext_encrypts_differently_each_time() {
        let salt = generate_salt();
        let a = encrypt("hunter2", "pass", &salt).unwrap();
        let b = encrypt("hunter2", "pass", &salt).unwrap();
        assert_ne!(a, b, "nonce should be randomized per call");
    }

    #[test]
    fn resolve_password_passes_through_plaintext_when_encryption_disabled() {
        let resolved = resolve_password("plain", None, None, false, "unused").unwrap();
        assert_eq!(resolved, "plain");
    }

    #[test]
    fn resolve_password_requires_both_fields_when_encryption_enabled() {
        let err = resolve_password("", None, None, true, "pass").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }
}
