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

use std::io;

use thiserror::Error;

/// A `SphinxError` indicates a failure processing a Sphinx reply packet.
#[derive(Debug, Error)]
pub enum SphinxError {
    /// No shared secret in the chain produced a verifying MAC, or the
    /// embedded payload length was out of bounds. The caller should treat
    /// the reply as unattributable rather than trusting any partial result.
    #[error("malformed Sphinx reply: no hop MAC verified")]
    MalformedReply,
}

/// A `SeedError` indicates a failure in the root seed's lifecycle.
#[derive(Debug, Error)]
pub enum SeedError {
    /// The seed file is neither plaintext (32 bytes) nor a validly sized
    /// encrypted blob.
    #[error("corrupt seed file: unexpected length")]
    CorruptSeedFile,
    /// The encrypted seed blob did not decrypt under the provided
    /// passphrase. The overwhelmingly likely cause is a typo; callers
    /// should exit with a user-facing message rather than a backtrace.
    #[error("seed decryption failed: wrong passphrase")]
    SeedDecryptFailed,
    /// A passphrase is required to load this seed file but none was given.
    #[error("seed file is encrypted but no passphrase was provided")]
    PassphraseRequired,
    /// Password-based key derivation using Argon2id failed.
    #[error("Argon2id key derivation failed: {0}")]
    Argon2(#[from] argon2::Error),
    /// The authenticated encryption or decryption of the seed blob failed.
    #[error("seed blob encryption or decryption failure")]
    ChaCha20Poly1305(#[from] chacha20poly1305::Error),
    /// A `std::io::Error` I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `DispatchError` indicates a failure in the HSM dispatcher's request
/// handling.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A malformed frame, a type forbidden by the session's capability
    /// bitmask, or an unrecognized type tag.
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    /// The master session's disconnection or replacement represents an
    /// unrecoverable dispatcher state.
    #[error("master session disconnected")]
    MasterGone,
    /// A lower-level seed store error occurred while servicing a request.
    #[error("seed store error: {0}")]
    Seed(#[from] SeedError),
    /// A bincode (de)serialization error occurred while framing a message.
    #[error("message framing error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    /// A `std::io::Error` I/O error occurred on a session's connection.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `ScbError` indicates a failure in the static channel backup engine.
#[derive(Debug, Error)]
pub enum ScbError {
    /// The on-disk or peer-returned SCB's version field is not the single
    /// version this engine understands.
    #[error("incompatible SCB file version on disk, contact the admin!")]
    IncompatibleVersion,
    /// A peer-returned `YOUR_PEER_STORAGE` payload failed to authenticate.
    /// Never surfaced to the user; logged at debug level only.
    #[error("peer altered our data")]
    PeerStorageAuthFail,
    /// A lower-level seed store error occurred while deriving the SCB key.
    #[error("seed store error: {0}")]
    Seed(#[from] SeedError),
    /// A bincode (de)serialization error occurred while encoding records.
    #[error("SCB encoding error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    /// The authenticated encryption or decryption of the SCB file failed.
    #[error("SCB encryption or decryption failure")]
    ChaCha20Poly1305(#[from] chacha20poly1305::Error),
    /// A `std::io::Error` I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `ConfigError` indicates a failure loading or saving the node
/// configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file's permissions allow group or world access.
    #[error("insecure config permissions (limit access to the owning user!)")]
    InsecurePerms,
    /// A `std::io::Error` I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A `toml::de::Error` TOML deserialization error occurred.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    /// A `toml::ser::Error` TOML serialization error occurred.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// A crate-wide `Error` composing every subsystem error, for callers that
/// cross subsystem boundaries (notably the two binaries).
#[derive(Debug, Error)]
pub enum Error {
    /// A Sphinx reply pipeline error occurred.
    #[error("{0}")]
    Sphinx(#[from] SphinxError),
    /// A seed store error occurred.
    #[error("{0}")]
    Seed(#[from] SeedError),
    /// An HSM dispatcher error occurred.
    #[error("{0}")]
    Dispatch(#[from] DispatchError),
    /// An SCB engine error occurred.
    #[error("{0}")]
    Scb(#[from] ScbError),
    /// A configuration error occurred.
    #[error("{0}")]
    Config(#[from] ConfigError),
    /// A `std::io::Error` I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
