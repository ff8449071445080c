//! AES-256-GCM encryption of credential secrets.
//!
//! Stored values have the form `hex(iv):hex(auth_tag):hex(ciphertext)` with a
//! 12-byte IV and a 16-byte authentication tag.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::Rng;
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Errors from encrypting or decrypting secrets.
///
/// None of the variants carry the secret or the stored payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: expected 32 hex-encoded bytes")]
    InvalidKey,

    #[error("stored value is not in iv:tag:ciphertext form")]
    Format,

    #[error("authentication failed")]
    Authentication,

    #[error("decrypted value is not valid UTF-8")]
    Utf8,

    #[error("encryption failed")]
    Encryption,
}

/// Symmetric cipher bound to one key.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn from_hex_key(key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(key.trim()).map_err(|_| CryptoError::InvalidKey)?;
        Self::new(&bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let iv: [u8; IV_LEN] = rand::thread_rng().r#gen();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        // aes-gcm appends the tag to the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let (iv, tag, ciphertext) = split_stored(stored)?;

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }

    /// Decrypt, treating a value that is not in the stored format as plaintext.
    ///
    /// Only for stores that still hold values written before encryption was
    /// enabled. Values that look encrypted but fail authentication are still
    /// rejected.
    pub fn decrypt_legacy(&self, stored: &str) -> Result<String, CryptoError> {
        match self.decrypt(stored) {
            Err(CryptoError::Format) => {
                tracing::warn!(
                    "Credential value is not encrypted; re-save it to migrate to encrypted storage"
                );
                Ok(stored.to_string())
            }
            other => other,
        }
    }
}

/// Whether a stored value has the encrypted shape, without decrypting it.
pub fn is_encrypted(stored: &str) -> bool {
    split_stored(stored).is_ok()
}

fn split_stored(stored: &str) -> Result<([u8; IV_LEN], [u8; TAG_LEN], Vec<u8>), CryptoError> {
    let mut parts = stored.split(':');
    let (Some(iv), Some(tag), Some(ciphertext), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::Format);
    };

    let mut iv_bytes = [0u8; IV_LEN];
    hex::decode_to_slice(iv, &mut iv_bytes).map_err(|_| CryptoError::Format)?;
    let mut tag_bytes = [0u8; TAG_LEN];
    hex::decode_to_slice(tag, &mut tag_bytes).map_err(|_| CryptoError::Format)?;
    let ciphertext = hex::decode(ciphertext).map_err(|_| CryptoError::Format)?;

    Ok((iv_bytes, tag_bytes, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn cipher() -> SecretCipher {
        SecretCipher::from_hex_key(KEY).unwrap()
    }

    #[test]
    fn test_stored_format() {
        let stored = cipher().encrypt("hunter2").unwrap();
        let parts: Vec<&str> = stored.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), IV_LEN * 2);
        assert_eq!(parts[1].len(), TAG_LEN * 2);
        assert_eq!(parts[2].len(), "hunter2".len() * 2);
        assert!(is_encrypted(&stored));
        assert_eq!(cipher().decrypt(&stored).unwrap(), "hunter2");
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let c = cipher();
        assert_ne!(c.encrypt("same").unwrap(), c.encrypt("same").unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let stored = cipher().encrypt("hunter2").unwrap();
        let mut parts: Vec<String> = stored.split(':').map(String::from).collect();
        let flipped = if parts[2].starts_with('0') { "1" } else { "0" };
        parts[2].replace_range(0..1, flipped);
        let tampered = parts.join(":");
        assert_eq!(cipher().decrypt(&tampered), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let stored = cipher().encrypt("hunter2").unwrap();
        let other = SecretCipher::new(&[7u8; 32]).unwrap();
        assert_eq!(other.decrypt(&stored), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_malformed_rejected() {
        assert_eq!(cipher().decrypt("plain-password"), Err(CryptoError::Format));
        assert_eq!(cipher().decrypt("aa:bb"), Err(CryptoError::Format));
        assert_eq!(cipher().decrypt("zz:zz:zz"), Err(CryptoError::Format));
    }

    #[test]
    fn test_legacy_plaintext_opt_in() {
        let c = cipher();
        assert_eq!(c.decrypt_legacy("plain-password").unwrap(), "plain-password");

        let stored = c.encrypt("hunter2").unwrap();
        assert_eq!(c.decrypt_legacy(&stored).unwrap(), "hunter2");
    }

    #[test]
    fn test_invalid_key() {
        assert!(SecretCipher::from_hex_key("abcd").is_err());
        assert!(SecretCipher::from_hex_key("not hex").is_err());
    }
}
