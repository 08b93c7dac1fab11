//! Enterprise name obfuscation.
//!
//! Token format (hex encoded): `nonce (12 bytes) || AES-256-GCM ciphertext+tag`.
//! The AES key is SHA-256 of the enterprise key; the enterprise id is bound as
//! associated data, so a token only opens under the same id/key pair.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::error::CipherError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct NameCipher {
    id: u32,
    cipher: Aes256Gcm,
}

impl NameCipher {
    pub fn new(id: u32, key: &str) -> Result<Self, CipherError> {
        if key.is_empty() {
            return Err(CipherError::EmptyKey);
        }
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest).map_err(|_| CipherError::EmptyKey)?;
        Ok(Self { id, cipher })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn encrypt(&self, name: &str) -> Result<String, CipherError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let aad = self.id.to_be_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: name.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, CipherError> {
        let raw = hex::decode(token.trim()).map_err(|_| CipherError::Encoding)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let aad = self.id.to_be_bytes();
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CipherError::Authentication)?;
        String::from_utf8(plain).map_err(|_| CipherError::Authentication)
    }
}

impl std::fmt::Debug for NameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCipher").field("id", &self.id).finish_non_exhaustive()
    }
}

pub fn encrypt(name: &str, id: u32, key: &str) -> Result<String, CipherError> {
    NameCipher::new(id, key)?.encrypt(name)
}

pub fn decrypt(token: &str, id: u32, key: &str) -> Result<String, CipherError> {
    NameCipher::new(id, key)?.decrypt(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_restores_name() {
        for name in ["secret.test", "a.b.c.example.com", "Mixed.Case.Test", "xn--bcher-kva.test"] {
            let token = encrypt(name, 12, "enterprise-key").expect("encrypt");
            assert!(!token.contains(name));
            assert_eq!(decrypt(&token, 12, "enterprise-key").expect("decrypt"), name);
        }
    }

    #[test]
    fn tokens_are_not_deterministic() {
        let a = encrypt("secret.test", 1, "k").unwrap();
        let b = encrypt("secret.test", 1, "k").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mismatched_key_or_id_fails() {
        let token = encrypt("secret.test", 12, "right").unwrap();
        assert_eq!(decrypt(&token, 12, "wrong"), Err(CipherError::Authentication));
        assert_eq!(decrypt(&token, 13, "right"), Err(CipherError::Authentication));
    }

    #[test]
    fn corrupt_tokens_fail() {
        assert_eq!(decrypt("zz", 1, "k"), Err(CipherError::Encoding));
        assert_eq!(decrypt("00ff", 1, "k"), Err(CipherError::Truncated));

        let mut token = encrypt("secret.test", 1, "k").unwrap().into_bytes();
        let last = token.len() - 1;
        token[last] = if token[last] == b'0' { b'1' } else { b'0' };
        let token = String::from_utf8(token).unwrap();
        assert_eq!(decrypt(&token, 1, "k"), Err(CipherError::Authentication));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(encrypt("a.test", 1, "").unwrap_err(), CipherError::EmptyKey);
    }
}
