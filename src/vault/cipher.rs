//! AES-256-GCM envelope used for credentials at rest.
//!
//! Envelope layout: base64(nonce[12] || ciphertext || tag[16]).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{OrraError, Result};

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

pub struct MasterKey {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey(***)")
    }
}

impl MasterKey {
    /// Parse a base64 encoded 32 byte key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|_| {
            OrraError::Configuration("vault master key is not valid base64".into())
        })?);
        if bytes.len() != KEY_LEN {
            return Err(OrraError::Configuration(format!(
                "vault master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes)
            .map_err(|_| OrraError::Configuration("vault master key rejected".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn seal(&self, aad: &str, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| OrraError::Encryption("nonce generation failed".into()))?;

        let mut in_out = Zeroizing::new(plaintext.to_vec());
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad.as_bytes()),
                &mut *in_out,
            )
            .map_err(|_| OrraError::Encryption("seal failed".into()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);
        Ok(STANDARD.encode(envelope))
    }

    /// Returns `None` for any envelope that does not authenticate under this
    /// key and associated data.
    pub fn open(&self, aad: &str, envelope: &str) -> Option<Zeroizing<Vec<u8>>> {
        let raw = STANDARD.decode(envelope).ok()?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).ok()?;

        let mut in_out = Zeroizing::new(sealed.to_vec());
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad.as_bytes()), &mut *in_out)
            .ok()?;
        Some(Zeroizing::new(plaintext.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> MasterKey {
        MasterKey::from_base64(&STANDARD.encode([fill; KEY_LEN])).unwrap()
    }

    #[test]
    fn test_seal_open() {
        let k = key(7);
        let envelope = k.seal("t:kite", b"hello").unwrap();
        assert_eq!(k.open("t:kite", &envelope).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let k = key(7);
        assert_ne!(k.seal("a", b"x").unwrap(), k.seal("a", b"x").unwrap());
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        let envelope = key(1).seal("t1:kite", b"secret").unwrap();
        assert!(key(2).open("t1:kite", &envelope).is_none());
        assert!(key(1).open("t2:kite", &envelope).is_none());
        assert!(key(1).open("t1:kite", "not-base64!").is_none());
        assert!(key(1).open("t1:kite", &STANDARD.encode([0u8; 8])).is_none());
    }

    #[test]
    fn test_key_length_enforced() {
        let err = MasterKey::from_base64(&STANDARD.encode([0u8; 16])).unwrap_err();
        assert!(err.is_fatal_at_boot());
        assert!(MasterKey::from_base64("%%%").unwrap_err().is_fatal_at_boot());
    }
}
