//! Room encryption.
//!
//! A room key is derived from the shared passphrase with PBKDF2-HMAC-SHA256,
//! salted with the room name, so every participant that knows the secret
//! arrives at the same AES-256-GCM key with no key exchange. Signals are
//! sealed into a [`Sealed`] envelope with a fresh random 96-bit nonce.

use crate::error::CryptoError;
use meshsync_proto::Sealed;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_PREFIX: &[u8] = b"meshsync-room:";
const KEY_LEN: usize = 32;

/// AES-256-GCM key bound to one room.
pub struct RoomKey {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKey").finish_non_exhaustive()
    }
}

impl RoomKey {
    /// Derive the key for `room` from `secret`.
    pub fn derive(secret: &str, room: &str) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(CryptoError::KeySetup)?;
        let mut salt = Vec::with_capacity(SALT_PREFIX.len() + room.len());
        salt.extend_from_slice(SALT_PREFIX);
        salt.extend_from_slice(room.as_bytes());

        let mut raw = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &salt,
            secret.as_bytes(),
            &mut raw,
        );
        let unbound = UnboundKey::new(&AES_256_GCM, &raw).map_err(|_| CryptoError::KeySetup)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt `plaintext` under a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let mut iv = [0u8; NONCE_LEN];
        self.rng.fill(&mut iv).map_err(|_| CryptoError::Seal)?;
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;
        Ok(Sealed::new(&iv, &in_out))
    }

    /// Decrypt an envelope. Any failure (bad base64, wrong key, tampering)
    /// yields `None`.
    pub fn decrypt(&self, sealed: &Sealed) -> Option<Vec<u8>> {
        let iv = sealed.iv_bytes().ok()?;
        let nonce = Nonce::try_assume_unique_for_key(&iv).ok()?;
        let mut in_out = sealed.data_bytes().ok()?;
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .ok()?;
        Some(plain.to_vec())
    }
}
