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

//! The Static Channel Backup engine, grounded on `chanbackup.c`: every
//! channel's recovery data is re-encoded and re-encrypted to
//! `emergency.recover` whenever anything changes, the plaintext format is
//! `u64 version ‖ u32 unix timestamp ‖ length-prefixed channel records`,
//! and the write is crash-atomic (`scb.tmp`, `fsync`, `fsync` the
//! directory, `rename`). The ciphertext is also handed to channel peers
//! via `PEER_STORAGE` so a lost backup can be recovered from them, and a
//! tampered `YOUR_PEER_STORAGE` reply fails closed and silently.

use crate::fsio;
use crate::seed::SeedStore;
use crate::ScbError;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};

/// The only SCB file version this engine understands.
pub const VERSION: u64 = 1;

const FILE_MODE: u32 = 0o400;
const HEADER_LEN: usize = 24;

/// A single channel's static recovery record: enough to drive
/// `emergencyrecover` without the channel's live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: [u8; 32],
    pub peer_node_id: [u8; 33],
    pub funding_txid: [u8; 32],
    pub funding_outnum: u32,
}

/// The decoded plaintext contents of an SCB file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticChannelBackup {
    pub version: u64,
    pub timestamp: u32,
    pub channels: Vec<ChannelRecord>,
}

impl StaticChannelBackup {
    pub fn new(channels: Vec<ChannelRecord>) -> Self {
        Self {
            version: VERSION,
            timestamp: unix_timestamp_now(),
            channels,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, ScbError> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ScbError> {
        let scb: Self = bincode::deserialize(bytes)?;
        if scb.version != VERSION {
            return Err(ScbError::IncompatibleVersion);
        }
        Ok(scb)
    }
}

fn unix_timestamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set after 1970")
        .as_secs() as u32
}

/// Derives the 32-byte key used to encrypt the SCB file and peer-storage
/// payloads from the root seed, via the fixed label `"scb secret"`
/// (`chanbackup.c`'s `get_secret`, `info = "scb secret"`).
fn scb_key(seed: &SeedStore) -> [u8; 32] {
    seed.derive_secret(b"scb secret")
}

fn encrypt(seed: &SeedStore, plaintext: &[u8]) -> Result<Vec<u8>, ScbError> {
    let key = scb_key(seed);
    let header = crate::system::random_bytes(HEADER_LEN);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = XNonce::from_slice(&header);
    let ciphertext = cipher.encrypt(nonce, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(seed: &SeedStore, contents: &[u8]) -> Result<Vec<u8>, ScbError> {
    if contents.len() < HEADER_LEN {
        return Err(ScbError::PeerStorageAuthFail);
    }
    let (header, ciphertext) = contents.split_at(HEADER_LEN);
    let key = scb_key(seed);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = XNonce::from_slice(header);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| ScbError::PeerStorageAuthFail)
}

/// Encrypts and atomically writes `backup` to `path` (typically
/// `emergency.recover`), replacing whatever was there before.
pub fn write(seed: &SeedStore, path: impl AsRef<Path>, backup: &StaticChannelBackup) -> Result<(), ScbError> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp");

    let ciphertext = encrypt(seed, &backup.encode()?)?;
    fsio::atomic_replace(path, &tmp_path, FILE_MODE, &ciphertext)?;

    Ok(())
}

/// Reads and decrypts the SCB file at `path`.
pub fn read(seed: &SeedStore, path: impl AsRef<Path>) -> Result<StaticChannelBackup, ScbError> {
    let contents = std::fs::read(path)?;
    let plaintext = decrypt(seed, &contents)?;
    StaticChannelBackup::decode(&plaintext)
}

/// Removes any `scb.tmp` left behind by a crash between writing and
/// renaming, mirroring `chanbackup.c`'s startup `unlink_noerr("scb.tmp")`.
pub fn cleanup_stale_tmp(path: impl AsRef<Path>) -> std::io::Result<()> {
    fsio::remove_if_exists(&path.as_ref().with_extension("tmp"))
}

/// Produces the ciphertext blob to hand a channel peer via `PEER_STORAGE`:
/// identical to the on-disk encrypted form, so either source can restore
/// the other.
pub fn to_peer_storage(seed: &SeedStore, backup: &StaticChannelBackup) -> Result<Vec<u8>, ScbError> {
    encrypt(seed, &backup.encode()?)
}

/// Decodes a `YOUR_PEER_STORAGE` payload returned by a peer. A failure to
/// authenticate returns [`ScbError::PeerStorageAuthFail`]; callers must
/// treat this as silent and non-fatal (debug-log only), since an
/// untrusted peer can return arbitrary bytes.
pub fn from_peer_storage(seed: &SeedStore, payload: &[u8]) -> Result<StaticChannelBackup, ScbError> {
    let plaintext = decrypt(seed, payload)?;
    StaticChannelBackup::decode(&plaintext)
}

/// The composite key under which this engine's own peer-storage blob is
/// persisted by the plugin, namespacing it from any other plugin's use of
/// the same peer's storage slot.
pub fn peer_storage_key(node_id: &[u8; 33]) -> (Vec<u8>, &'static str) {
    (node_id.to_vec(), "chanbackup")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut dir = env::temp_dir();
        dir.push(format!("hsmcore-scb-test-{}-{}", std::process::id(), name));
        dir
    }

    fn sample_backup() -> StaticChannelBackup {
        StaticChannelBackup::new(vec![ChannelRecord {
            channel_id: [1u8; 32],
            peer_node_id: [2u8; 33],
            funding_txid: [3u8; 32],
            funding_outnum: 0,
        }])
    }

    fn fresh_seed(path: &Path) -> SeedStore {
        fs::remove_file(path).ok();
        SeedStore::maybe_create_new(path, None).unwrap().unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let seed_path = tmp_path("seed-round-trip");
        let scb_path = tmp_path("scb-round-trip");
        let seed = fresh_seed(&seed_path);
        fs::remove_file(&scb_path).ok();

        let backup = sample_backup();
        write(&seed, &scb_path, &backup).unwrap();
        let loaded = read(&seed, &scb_path).unwrap();

        assert_eq!(backup, loaded);
        assert!(!scb_path.with_extension("tmp").exists());

        fs::remove_file(&seed_path).ok();
        fs::remove_file(&scb_path).ok();
    }

    #[test]
    fn wrong_seed_fails_to_decrypt() {
        let seed_path_a = tmp_path("seed-a");
        let seed_path_b = tmp_path("seed-b");
        let scb_path = tmp_path("scb-wrong-seed");
        let seed_a = fresh_seed(&seed_path_a);
        let seed_b = fresh_seed(&seed_path_b);
        fs::remove_file(&scb_path).ok();

        write(&seed_a, &scb_path, &sample_backup()).unwrap();
        let err = read(&seed_b, &scb_path).unwrap_err();
        assert!(matches!(err, ScbError::PeerStorageAuthFail));

        fs::remove_file(&seed_path_a).ok();
        fs::remove_file(&seed_path_b).ok();
        fs::remove_file(&scb_path).ok();
    }

    #[test]
    fn peer_storage_round_trips() {
        let seed_path = tmp_path("seed-peer");
        let seed = fresh_seed(&seed_path);

        let backup = sample_backup();
        let blob = to_peer_storage(&seed, &backup).unwrap();
        let restored = from_peer_storage(&seed, &blob).unwrap();
        assert_eq!(backup, restored);

        fs::remove_file(&seed_path).ok();
    }

    #[test]
    fn tampered_peer_storage_fails_closed() {
        let seed_path = tmp_path("seed-tamper");
        let seed = fresh_seed(&seed_path);

        let mut blob = to_peer_storage(&seed, &sample_backup()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;

        let err = from_peer_storage(&seed, &blob).unwrap_err();
        assert!(matches!(err, ScbError::PeerStorageAuthFail));

        fs::remove_file(&seed_path).ok();
    }

    #[test]
    fn incompatible_version_is_rejected() {
        let mut backup = sample_backup();
        backup.version = 2;
        let bytes = backup.encode().unwrap();
        let err = StaticChannelBackup::decode(&bytes).unwrap_err();
        assert!(matches!(err, ScbError::IncompatibleVersion));
    }

    #[test]
    fn peer_storage_key_namespaces_by_node_id() {
        let (key_bytes, ns) = peer_storage_key(&[9u8; 33]);
        assert_eq!(key_bytes, vec![9u8; 33]);
        assert_eq!(ns, "chanbackup");
    }
}
