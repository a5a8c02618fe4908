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

//! The HSM wire message envelope: a length-prefixed byte string beginning
//! with a big-endian `u16` type tag, as required by `SPEC_FULL.md` §6.
//!
//! Request and reply payloads are `serde`/`bincode`-encoded, the same
//! pattern the teacher uses for its `CryptoMessage`/`StreamMessage`
//! wire types (`hbak_common/src/message.rs`, `conn.rs`), generalized here
//! to a manual big-endian tag prefix instead of relying on bincode's
//! untagged-enum discriminant so the tag's width and byte order are a
//! committed wire detail rather than an implementation accident.

use crate::DispatchError;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Request type tags. Only the master session may send [`Tag::Init`] and
/// [`Tag::ClientHsmFd`] (enforced by the capability matrix in
/// [`crate::dispatch`], not by this module).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum Tag {
    Init = 0,
    InitReply = 1,
    ClientHsmFd = 2,
    ClientHsmFdReply = 3,
    SignCommitmentTx = 4,
    SignCommitmentTxReply = 5,
    Ecdh = 6,
    EcdhReply = 7,
    BadRequestReply = 8,
    PeerStorage = 100,
    YourPeerStorage = 101,
    #[cfg(feature = "dev")]
    DevMemleak = 9998,
}

impl Tag {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Tag::Init,
            1 => Tag::InitReply,
            2 => Tag::ClientHsmFd,
            3 => Tag::ClientHsmFdReply,
            4 => Tag::SignCommitmentTx,
            5 => Tag::SignCommitmentTxReply,
            6 => Tag::Ecdh,
            7 => Tag::EcdhReply,
            8 => Tag::BadRequestReply,
            100 => Tag::PeerStorage,
            101 => Tag::YourPeerStorage,
            #[cfg(feature = "dev")]
            9998 => Tag::DevMemleak,
            _ => return None,
        })
    }
}

/// A decoded wire frame: a recognized type tag plus its bincode-encoded
/// body, still opaque at this layer.
pub struct Frame {
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new<T: Serialize>(tag: Tag, body: &T) -> Result<Self, DispatchError> {
        Ok(Self {
            tag,
            body: bincode::serialize(body)?,
        })
    }

    pub fn decode_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, DispatchError> {
        Ok(bincode::deserialize(&self.body)?)
    }

    /// Writes `u32 BE total_len ‖ u16 BE tag ‖ body` to `w`.
    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        let total_len = 2 + self.body.len();
        w.write_all(&(total_len as u32).to_be_bytes())?;
        w.write_all(&(self.tag as u16).to_be_bytes())?;
        w.write_all(&self.body)?;
        w.flush()
    }

    /// Reads one frame from `r`. Returns `None` on clean EOF between
    /// frames (the connection was closed while idle between requests).
    pub fn read_from(mut r: impl Read) -> io::Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let total_len = u32::from_be_bytes(len_buf) as usize;

        if total_len < 2 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too short"));
        }

        let mut tag_buf = [0u8; 2];
        r.read_exact(&mut tag_buf)?;
        let tag = Tag::from_u16(u16::from_be_bytes(tag_buf))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unrecognized type tag"))?;

        let mut body = vec![0u8; total_len - 2];
        r.read_exact(&mut body)?;

        Ok(Some(Self { tag, body }))
    }
}

/// Payload of a [`Tag::Init`] request: the master's chain parameters,
/// optional seed passphrase, and development-mode forced keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub chain_params: String,
    pub passphrase: Option<String>,
    pub dev_force_privkey: Option<[u8; 32]>,
}

/// Payload of a [`Tag::InitReply`]: the derived public parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitReply {
    pub node_id: [u8; 33],
    pub bip32_ext_pubkey: Vec<u8>,
}

/// Payload of a [`Tag::ClientHsmFd`] request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHsmFdRequest {
    pub node_id: Option<[u8; 33]>,
    pub db_id: u64,
    pub capabilities: u32,
}

/// Payload of a [`Tag::ClientHsmFdReply`]: an acknowledgement. The
/// associated descriptor travels out-of-band, immediately after this
/// reply is written (`SPEC_FULL.md` §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHsmFdReply;

/// Generic black-box signing/ECDH request-reply bodies: this core passes
/// them through verbatim, see `SPEC_FULL.md` §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaqueRequest {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaqueReply {
    pub payload: Vec<u8>,
}

/// Payload of a [`Tag::BadRequestReply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadRequestReply {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_over_a_buffer() {
        let req = InitRequest {
            chain_params: "regtest".to_string(),
            passphrase: None,
            dev_force_privkey: None,
        };
        let frame = Frame::new(Tag::Init, &req).unwrap();

        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();

        let decoded = Frame::read_from(buf.as_slice()).unwrap().unwrap();
        assert_eq!(decoded.tag, Tag::Init);

        let decoded_req: InitRequest = decoded.decode_body().unwrap();
        assert_eq!(decoded_req.chain_params, "regtest");
    }

    #[test]
    fn read_from_empty_stream_is_clean_eof() {
        let buf: &[u8] = &[];
        assert!(Frame::read_from(buf).unwrap().is_none());
    }

    #[test]
    fn unrecognized_tag_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&0xffffu16.to_be_bytes());

        assert!(Frame::read_from(buf.as_slice()).is_err());
    }
}
