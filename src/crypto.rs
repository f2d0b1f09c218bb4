// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Authenticated encryption of bucket payloads.
//!
//! Ciphertexts are laid out as `nonce || sealed plaintext || tag`, with a fresh random
//! 96-bit nonce per call, so equal plaintexts never produce equal ciphertexts.

use crate::OramError;
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key as AesKey, Nonce, Tag,
};
use rand::{CryptoRng, RngCore};
use std::fmt;

/// Size of an [`EncryptionKey`] in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the per-ciphertext nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A 256-bit AES-GCM key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Samples a fresh key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// The length of the ciphertext produced for a plaintext of `plaintext_len` bytes.
///
/// This is the plaintext plus a 12-byte nonce and a 16-byte tag. It is not the padded
/// `IV || AES-CBC` size of an unauthenticated CBC layout, so stores written with that layout
/// cannot be read back.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    NONCE_SIZE + plaintext_len + TAG_SIZE
}

/// Encrypts `plaintext` under `key`, replacing the contents of `out` with the ciphertext.
///
/// # Errors
///
/// Returns an `EncryptionError` if the AEAD refuses the input.
pub fn encrypt_into<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    key: &EncryptionKey,
    rng: &mut R,
    out: &mut Vec<u8>,
) -> Result<(), OramError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    out.clear();
    out.extend_from_slice(&nonce);
    out.extend_from_slice(plaintext);
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut out[NONCE_SIZE..])
        .map_err(|_| OramError::EncryptionError)?;
    out.extend_from_slice(&tag);
    Ok(())
}

/// Decrypts `ciphertext` under `key`, replacing the contents of `out` with the plaintext.
/// Returns the plaintext length.
///
/// # Errors
///
/// Returns a `DecryptionError` if `ciphertext` is too short or fails authentication.
pub fn decrypt_into(
    ciphertext: &[u8],
    key: &EncryptionKey,
    out: &mut Vec<u8>,
) -> Result<usize, OramError> {
    if ciphertext.len() < ciphertext_len(0) {
        return Err(OramError::DecryptionError);
    }
    let (nonce, rest) = ciphertext.split_at(NONCE_SIZE);
    let (sealed, tag) = rest.split_at(rest.len() - TAG_SIZE);

    out.clear();
    out.extend_from_slice(sealed);
    key.cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            out.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| OramError::DecryptionError)?;
    Ok(out.len())
}
