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

//! The root seed's on-disk lifecycle: creation, loading, and the
//! plaintext-to-encrypted upgrade path.
//!
//! Grounded on `hsmd.c`'s `maybe_create_new_hsm` and `load_hsm`: a 32-byte
//! root seed lives at `hsm_secret`, either as 32 raw bytes or, if a
//! passphrase was ever provided, as an Argon2id-derived-key-encrypted blob.
//! The file is written exclusively on first creation and is never rewritten
//! in place afterwards except to encrypt a previously plaintext seed.

use crate::fsio;
use crate::system::{self, Secret};
use crate::SeedError;

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

/// Size in bytes of the raw root seed.
pub const SEED_LEN: usize = 32;
/// Size in bytes of the random header prefixed to an encrypted seed blob;
/// doubles as the XChaCha20-Poly1305 nonce.
pub const HEADER_LEN: usize = 24;
/// Size in bytes of the Poly1305 authentication tag appended to the
/// ciphertext.
pub const TAG_LEN: usize = 16;
/// Total size in bytes of an encrypted seed file: header, ciphertext (equal
/// in length to the plaintext seed), and tag.
pub const ENCRYPTED_SEED_LEN: usize = HEADER_LEN + SEED_LEN + TAG_LEN;

const FILE_MODE: u32 = 0o400;

/// A loaded root seed, held in memory-locked, zeroize-on-drop storage.
pub struct SeedStore {
    seed: Secret<SEED_LEN>,
}

impl SeedStore {
    /// Creates a new seed file at `path` if none exists yet, generating a
    /// fresh random seed. Does nothing and returns `Ok(None)` if a seed
    /// file is already present (mirrors `maybe_create_new_hsm`'s
    /// EEXIST-silent-return — an existing seed is never regenerated).
    ///
    /// If `passphrase` is given, the seed is written pre-encrypted rather
    /// than created plaintext and upgraded later.
    pub fn maybe_create_new(
        path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<Option<Self>, SeedError> {
        let path = path.as_ref();

        let seed = Secret::<SEED_LEN>::from_bytes(
            system::random_bytes(SEED_LEN)
                .try_into()
                .expect("random_bytes(32) returns exactly 32 bytes"),
        );

        let contents = match passphrase {
            None => seed.to_vec(),
            Some(p) => encrypt_seed(&seed, p)?,
        };

        if !fsio::create_new_exclusive(path, FILE_MODE, &contents)? {
            return Ok(None);
        }

        Ok(Some(Self { seed }))
    }

    /// Loads the seed file at `path`, transparently decrypting it if it is
    /// an encrypted blob. Upgrades a plaintext seed file to an encrypted
    /// one in place (atomically) if `passphrase` is given and the file was
    /// still plaintext.
    pub fn load(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self, SeedError> {
        let path = path.as_ref();
        let contents = std::fs::read(path)?;

        let (seed, was_plaintext) = match contents.len() {
            SEED_LEN => {
                let bytes: [u8; SEED_LEN] = contents
                    .try_into()
                    .expect("length already checked against SEED_LEN");
                (Secret::from_bytes(bytes), true)
            }
            ENCRYPTED_SEED_LEN => {
                let passphrase = passphrase.ok_or(SeedError::PassphraseRequired)?;
                (decrypt_seed(&contents, passphrase)?, false)
            }
            _ => return Err(SeedError::CorruptSeedFile),
        };

        if was_plaintext {
            if let Some(p) = passphrase {
                let encrypted = encrypt_seed(&seed, p)?;
                let tmp_path = path.with_extension("tmp");
                fsio::atomic_replace(path, &tmp_path, FILE_MODE, &encrypted)?;
            }
        }

        Ok(Self { seed })
    }

    /// Returns the raw 32-byte root seed.
    pub fn seed_bytes(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }

    /// Derives a labeled 32-byte secret from the root seed via
    /// HMAC-SHA256, the same construction `hsmd.c`'s `handle_make_secret`
    /// uses to derive every non-BIP32 per-purpose key (the SCB encryption
    /// key, the peer-storage key, node aliases, and so on) from one root.
    pub fn derive_secret(&self, label: &[u8]) -> [u8; 32] {
        system::hash_hmac(&*self.seed, label)
    }
}

fn encrypt_seed(seed: &[u8; SEED_LEN], passphrase: &str) -> Result<Vec<u8>, SeedError> {
    let verifier = system::random_bytes(HEADER_LEN);
    let key = system::derive_key(&verifier, passphrase)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = XNonce::from_slice(&verifier);
    let ciphertext = cipher.encrypt(nonce, seed.as_slice())?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&verifier);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_seed(contents: &[u8], passphrase: &str) -> Result<Secret<SEED_LEN>, SeedError> {
    let (header, ciphertext) = contents.split_at(HEADER_LEN);
    let key = system::derive_key(header, passphrase)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = XNonce::from_slice(header);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SeedError::SeedDecryptFailed)?;

    let bytes: [u8; SEED_LEN] = plaintext
        .try_into()
        .map_err(|_| SeedError::CorruptSeedFile)?;
    Ok(Secret::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut dir = env::temp_dir();
        dir.push(format!("hsmcore-seed-test-{}-{}", std::process::id(), name));
        dir
    }

    #[test]
    fn plaintext_round_trip() {
        let path = tmp_path("plaintext");
        fs::remove_file(&path).ok();

        let created = SeedStore::maybe_create_new(&path, None).unwrap().unwrap();
        let loaded = SeedStore::load(&path, None).unwrap();
        assert_eq!(created.seed_bytes(), loaded.seed_bytes());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn encrypted_round_trip() {
        let path = tmp_path("encrypted");
        fs::remove_file(&path).ok();

        let created = SeedStore::maybe_create_new(&path, Some("hunter2"))
            .unwrap()
            .unwrap();
        let loaded = SeedStore::load(&path, Some("hunter2")).unwrap();
        assert_eq!(created.seed_bytes(), loaded.seed_bytes());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn wrong_passphrase_fails_to_decrypt() {
        let path = tmp_path("wrong-pass");
        fs::remove_file(&path).ok();

        SeedStore::maybe_create_new(&path, Some("correct-horse"))
            .unwrap()
            .unwrap();

        let err = SeedStore::load(&path, Some("wrong-guess")).unwrap_err();
        assert!(matches!(err, SeedError::SeedDecryptFailed));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_passphrase_on_encrypted_file_is_rejected() {
        let path = tmp_path("missing-pass");
        fs::remove_file(&path).ok();

        SeedStore::maybe_create_new(&path, Some("hunter2"))
            .unwrap()
            .unwrap();

        let err = SeedStore::load(&path, None).unwrap_err();
        assert!(matches!(err, SeedError::PassphraseRequired));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn existing_seed_file_is_not_recreated() {
        let path = tmp_path("no-clobber");
        fs::remove_file(&path).ok();

        let first = SeedStore::maybe_create_new(&path, None).unwrap().unwrap();
        let second = SeedStore::maybe_create_new(&path, None).unwrap();
        assert!(second.is_none());

        let loaded = SeedStore::load(&path, None).unwrap();
        assert_eq!(first.seed_bytes(), loaded.seed_bytes());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn loading_a_plaintext_seed_with_a_passphrase_upgrades_it_in_place() {
        let path = tmp_path("upgrade");
        fs::remove_file(&path).ok();

        let created = SeedStore::maybe_create_new(&path, None).unwrap().unwrap();
        let upgraded = SeedStore::load(&path, Some("new-passphrase")).unwrap();
        assert_eq!(created.seed_bytes(), upgraded.seed_bytes());

        assert_eq!(fs::metadata(&path).unwrap().len() as usize, ENCRYPTED_SEED_LEN);

        let reloaded = SeedStore::load(&path, Some("new-passphrase")).unwrap();
        assert_eq!(created.seed_bytes(), reloaded.seed_bytes());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn derive_secret_is_deterministic_and_label_sensitive() {
        let path = tmp_path("derive");
        fs::remove_file(&path).ok();

        let store = SeedStore::maybe_create_new(&path, None).unwrap().unwrap();
        let a = store.derive_secret(b"scb");
        let b = store.derive_secret(b"scb");
        let c = store.derive_secret(b"peer-storage");
        assert_eq!(a, b);
        assert_ne!(a, c);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn corrupt_length_is_rejected() {
        let path = tmp_path("corrupt");
        fs::write(&path, b"not a valid seed file length").unwrap();

        let err = SeedStore::load(&path, None).unwrap_err();
        assert!(matches!(err, SeedError::CorruptSeedFile));

        fs::remove_file(&path).ok();
    }
}
