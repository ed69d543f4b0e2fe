//! Credential cipher.
//!
//! AES-256-GCM over a process-wide key supplied as base64 in
//! `ENCRYPTION_KEY`. Account app-passwords are stored as
//! base64(nonce || ciphertext) and decrypted only when the fetcher opens
//! an IMAP session. Rotating the key makes existing ciphertexts
//! unreadable; that is the documented operator contract.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{Error, Result};

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build the cipher from a base64-encoded 32-byte key.
    pub fn from_key(encoded_key: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(encoded_key.trim())
            .map_err(|e| Error::Config(format!("ENCRYPTION_KEY is not valid base64: {}", e)))?;

        if key_bytes.len() != 32 {
            return Err(Error::Config(format!(
                "ENCRYPTION_KEY must decode to 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let key: [u8; 32] = key_bytes.try_into().expect("length checked above");
        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
        })
    }

    /// Encrypt a plaintext string into base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// Decrypt base64(nonce || ciphertext) back into the plaintext.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let combined = BASE64
            .decode(encrypted)
            .map_err(|e| Error::Encryption(format!("invalid base64: {}", e)))?;

        if combined.len() < NONCE_SIZE {
            return Err(Error::Encryption(format!(
                "ciphertext too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self.cipher.decrypt(nonce, ciphertext).map_err(|e| {
            Error::Encryption(format!(
                "AES-GCM decryption failed (wrong key or corrupted data): {}",
                e
            ))
        })?;

        String::from_utf8(plaintext_bytes)
            .map_err(|e| Error::Encryption(format!("decrypted data is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        SecretCipher::from_key(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn round_trip() {
        let cipher = test_cipher();
        let encrypted = cipher.encrypt("my_app_password_123!").unwrap();
        assert_ne!(encrypted, "my_app_password_123!");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "my_app_password_123!");
    }

    #[test]
    fn same_plaintext_different_ciphertext() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "same");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same");
    }

    #[test]
    fn wrong_key_rejected() {
        let a = test_cipher();
        let b = SecretCipher::from_key(&BASE64.encode([9u8; 32])).unwrap();
        let encrypted = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn malformed_input_rejected() {
        let cipher = test_cipher();
        assert!(cipher.decrypt("not_base64!@#$%").is_err());
        assert!(cipher.decrypt(&BASE64.encode("short")).is_err());
        assert!(cipher.decrypt(&BASE64.encode([0u8; 32])).is_err());
    }

    #[test]
    fn bad_key_length_rejected() {
        assert!(SecretCipher::from_key(&BASE64.encode([1u8; 16])).is_err());
        assert!(SecretCipher::from_key("***").is_err());
    }
}
