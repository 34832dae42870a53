//! Opaque, URL-safe revocation handles.
//!
//! A handle is `base64url(nonce || ChaCha20-Poly1305(email))`, so it can be
//! placed in a link path and cannot be forged or altered without the key.

use base64ct::{Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const AAD: &[u8] = b"revoke-link:v1";

#[derive(Debug, thiserror::Error)]
pub enum RevocationError {
    #[error("malformed revocation handle")]
    Malformed,
    #[error("revocation handle failed authentication")]
    Forged,
    #[error("revocation handle encryption failed")]
    Seal,
}

#[derive(Clone)]
pub struct RevocationCodec {
    key: [u8; 32],
}

impl RevocationCodec {
    /// Derive the 32-byte key from a shared secret of any length.
    pub fn new(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    pub fn seal(&self, email: &str) -> Result<String, RevocationError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: email.as_bytes(),
                    aad: AAD,
                },
            )
            .map_err(|_| RevocationError::Seal)?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        Ok(Base64UrlUnpadded::encode_string(&raw))
    }

    pub fn open(&self, handle: &str) -> Result<String, RevocationError> {
        let raw = Base64UrlUnpadded::decode_vec(handle).map_err(|_| RevocationError::Malformed)?;
        if raw.len() <= NONCE_LEN {
            return Err(RevocationError::Malformed);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: AAD,
                },
            )
            .map_err(|_| RevocationError::Forged)?;
        String::from_utf8(plain).map_err(|_| RevocationError::Malformed)
    }
}
