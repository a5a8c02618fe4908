// hsmcore is the cryptographic core shared by the HSM dispatcher and the
// static channel backup engine of a Lightning-style payment node.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::SeedError;

use std::ops::{Deref, DerefMut};

use argon2::Argon2;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use zeroize::Zeroize;

/// Provides a `Vec<u8>` of `n` random bytes. Uses the thread-local generator
/// of the `rand` crate.
pub fn random_bytes(n: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(n)
        .collect()
}

/// Performs an HMAC-SHA256 hash computation.
pub fn hash_hmac(secret: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac: Hmac<Sha256> =
        Hmac::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(data);

    mac.finalize().into_bytes().into()
}

/// XORs `data` in place with the ChaCha20 keystream generated under `key`
/// and the all-zero nonce. Self-inverse: calling this twice with the same
/// key restores the original bytes.
///
/// Uses the original (non-IETF) ChaCha20 construction with an 8-byte nonce
/// and 64-bit block counter, matching the `crypto_stream_chacha20` variant
/// the Sphinx reply construction is specified against rather than the
/// 12-byte-nonce IETF variant.
pub fn chacha20_xor(key: &[u8; 32], data: &mut [u8]) {
    let nonce = [0u8; 8];
    let mut cipher = ChaCha20Legacy::new(key.into(), &nonce.into());
    cipher.apply_keystream(data);
}

/// Performs an Argon2id hash computation, writing `okm.len()` bytes of
/// output key material derived from `passphrase` and `salt`.
pub fn hash_argon2id<P: AsRef<[u8]>>(
    okm: &mut [u8],
    salt: &[u8],
    passphrase: P,
) -> Result<(), SeedError> {
    Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::default(),
        argon2::Params::new(524288, 32, 128, Some(okm.len()))?,
    )
    .hash_password_into(passphrase.as_ref(), salt, okm)?;

    Ok(())
}

/// Converts the provided verifier (salt) and passphrase into a 32-byte key
/// suitable for seed blob encryption.
pub fn derive_key<P: AsRef<[u8]>>(verifier: &[u8], passphrase: P) -> Result<[u8; 32], SeedError> {
    let mut key = [0u8; 32];
    hash_argon2id(&mut key, verifier, passphrase)?;
    Ok(key)
}

/// A fixed-size buffer holding secret material.
///
/// The backing memory is locked with `mlock(2)` for the lifetime of the
/// value (best-effort: a failure to lock is not fatal, since unprivileged
/// containers commonly cap `RLIMIT_MEMLOCK`) and zeroized on drop.
pub struct Secret<const N: usize> {
    bytes: Box<[u8; N]>,
    locked: bool,
}

impl<const N: usize> Secret<N> {
    /// Allocates a zeroed, memory-locked secret buffer.
    pub fn new() -> Self {
        let bytes = Box::new([0u8; N]);
        let locked = lock_memory(bytes.as_ptr(), N);

        Self { bytes, locked }
    }

    /// Allocates a memory-locked secret buffer initialized from `data`.
    pub fn from_bytes(data: [u8; N]) -> Self {
        let mut secret = Self::new();
        secret.bytes.copy_from_slice(&data);
        secret
    }
}

impl<const N: usize> Default for Secret<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for Secret<N> {
    type Target = [u8; N];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl<const N: usize> DerefMut for Secret<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl<const N: usize> Drop for Secret<N> {
    fn drop(&mut self) {
        self.bytes.zeroize();

        if self.locked {
            unlock_memory(self.bytes.as_ptr(), N);
        }
    }
}

#[cfg(unix)]
fn lock_memory(ptr: *const u8, len: usize) -> bool {
    // SAFETY: `ptr` points at `len` bytes owned by the caller for the
    // duration of this call; mlock/munlock never invalidate the mapping.
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn unlock_memory(ptr: *const u8, len: usize) {
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn lock_memory(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_memory(_ptr: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_deterministic() {
        let a = hash_hmac(b"secret", b"data");
        let b = hash_hmac(b"secret", b"data");
        assert_eq!(a, b);
    }

    #[test]
    fn chacha20_xor_is_self_inverse() {
        let key = [7u8; 32];
        let mut data = b"hop shared secret payload".to_vec();
        let original = data.clone();

        chacha20_xor(&key, &mut data);
        assert_ne!(data, original);

        chacha20_xor(&key, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn secret_round_trips_bytes() {
        let secret = Secret::<32>::from_bytes([9u8; 32]);
        assert_eq!(*secret, [9u8; 32]);
    }
}
