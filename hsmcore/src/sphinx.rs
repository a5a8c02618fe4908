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

//! The Sphinx failure-onion reply pipeline.
//!
//! Three pure, stateless operations over a caller-supplied shared-secret
//! chain: [`create_reply`] builds the packet at the failing hop,
//! [`wrap_reply`] is applied by every forwarding hop on the return path, and
//! [`unwrap_reply`] is run once by the payment originator to recover the
//! attributing hop and the cleartext payload.

use crate::system;
use crate::SphinxError;

use subtle::ConstantTimeEq;

/// The fixed wire size of an onion reply packet, in bytes.
///
/// Verified against the reference test vectors ([`tests::matches_test_vectors`]):
/// a 32-byte HMAC prefix plus a 132-byte inner block (2-byte length plus up
/// to 130 bytes of payload and padding).
pub const REPLY_LEN: usize = 164;

const MAC_LEN: usize = 32;
const INNER_LEN: usize = REPLY_LEN - MAC_LEN;

/// Derives the MAC key `um = HMAC(shared_secret, "um")`.
fn um_key(shared_secret: &[u8]) -> [u8; 32] {
    system::hash_hmac(shared_secret, b"um")
}

/// Derives the stream-cipher key `ammag = HMAC(shared_secret, "ammag")`.
fn ammag_key(shared_secret: &[u8]) -> [u8; 32] {
    system::hash_hmac(shared_secret, b"ammag")
}

/// Builds the reply packet at the hop that originates a failure message.
///
/// `raw_payload` must fit in the inner block: `raw_payload.len() <= INNER_LEN - 2`.
pub fn create_reply(last_shared_secret: &[u8], raw_payload: &[u8]) -> Result<Vec<u8>, SphinxError> {
    if raw_payload.len() > INNER_LEN - 2 {
        return Err(SphinxError::MalformedReply);
    }

    let mut inner = vec![0u8; INNER_LEN];
    inner[0..2].copy_from_slice(&(raw_payload.len() as u16).to_be_bytes());
    inner[2..2 + raw_payload.len()].copy_from_slice(raw_payload);

    let mac = system::hash_hmac(&um_key(last_shared_secret), &inner);

    let mut packet = Vec::with_capacity(REPLY_LEN);
    packet.extend_from_slice(&mac);
    packet.extend_from_slice(&inner);

    system::chacha20_xor(&ammag_key(last_shared_secret), &mut packet);

    Ok(packet)
}

/// Applies one forwarding hop's obfuscation. Length-preserving and
/// self-inverse under repeated application with the same shared secret.
pub fn wrap_reply(hop_shared_secret: &[u8], packet: &[u8]) -> Vec<u8> {
    let mut packet = packet.to_vec();
    system::chacha20_xor(&ammag_key(hop_shared_secret), &mut packet);
    packet
}

/// Unwraps a reply packet against the full forward-path shared-secret
/// chain, returning the originating hop's index and the recovered payload.
///
/// Returns [`SphinxError::MalformedReply`] if no hop's MAC verifies, or if
/// the verifying hop's embedded payload length is out of bounds. All MAC
/// comparisons are constant-time.
pub fn unwrap_reply(chain: &[Vec<u8>], packet: &[u8]) -> Result<(usize, Vec<u8>), SphinxError> {
    if packet.len() != REPLY_LEN {
        return Err(SphinxError::MalformedReply);
    }

    let mut packet = packet.to_vec();

    for (hop, shared_secret) in chain.iter().enumerate() {
        packet = wrap_reply(shared_secret, &packet);

        let expected_mac = system::hash_hmac(&um_key(shared_secret), &packet[MAC_LEN..]);
        let verifies: bool = expected_mac.ct_eq(&packet[..MAC_LEN]).into();

        if verifies {
            let len = u16::from_be_bytes([packet[MAC_LEN], packet[MAC_LEN + 1]]) as usize;
            let payload_start = MAC_LEN + 2;

            if len > REPLY_LEN - payload_start {
                return Err(SphinxError::MalformedReply);
            }

            return Ok((hop, packet[payload_start..payload_start + len].to_vec()));
        }
    }

    Err(SphinxError::MalformedReply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    const SECRETS: [&str; 5] = [
        "53eb63ea8a3fec3b3cd433b85cd62a4b145e1dda09391b348c4e1cd36a03ea66",
        "a6519e98832a0b179f62123b3567c106db99ee37bef036e783263602f3488fae",
        "3a6b412548762f0dbccce5c7ae7bb8147d1caf9b5471c34120b30bc9c04891cc",
        "21e13c2d7cfe7e18836df50872466117a295783ab8aab0e7ecc8c725503ad02d",
        "b5756b9b542727dbafc6765a49488b023a725d631af688fc031217e90770c328",
    ];

    const INTERMEDIATES: [&str; 5] = [
        "500d8596f76d3045bfdbf99914b98519fe76ea130dc22338c473ab68d74378b13a06a19f891145610741c83ad40b7712aefaddec8c6baf7325d92ea4ca4d1df8bce517f7e54554608bf2bd8071a4f52a7a2f7ffbb1413edad81eeea5785aa9d990f2865dc23b4bc3c301a94eec4eabebca66be5cf638f693ec256aec514620cc28ee4a94bd9565bc4d4962b9d3641d4278fb319ed2b84de5b665f307a2db0f7fbb757366",
        "669478a3ddf9ba4049df8fa51f73ac712b9c20380cda431696963a492713ebddb7dfadbb566c8dae8857add94e6702fb4c3a4de22e2e669e1ed926b04447fc73034bb730f4932acd62727b75348a648a1128744657ca6a4e713b9b646c3ca66cac02cdab44dd3439890ef3aaf61708714f7375349b8da541b2548d452d84de7084bb95b3ac2345201d624d31f4d52078aa0fa05a88b4e20202bd2b86ac5b52919ea305a8",
        "6984b0ccd86f37995857363df13670acd064bfd1a540e521cad4d71c07b1bc3dff9ac25f41addfb7466e74f81b3e545563cdd8f5524dae873de61d7bdfccd496af2584930d2b566b4f8d3881f8c043df92224f38cf094cfc09d92655989531524593ec6d6caec1863bdfaa79229b5020acc034cd6deeea1021c50586947b9b8e6faa83b81fbfa6133c0af5d6b07c017f7158fa94f0d206baf12dda6b68f785b773b360fd",
        "08cd44478211b8a4370ab1368b5ffe8c9c92fb830ff4ad6e3b0a316df9d24176a081bab161ea0011585323930fa5b9fae0c85770a2279ff59ec427ad1bbff9001c0cd1497004bd2a0f68b50704cf6d6a4bf3c8b6a0833399a24b3456961ba00736785112594f65b6b2d44d9f5ea4e49b5e1ec2af978cbe31c67114440ac51a62081df0ed46d4a3df295da0b0fe25c0115019f03f15ec86fabb4c852f83449e812f141a93",
        "69b1e5a3e05a7b5478e6529cd1749fdd8c66da6f6db42078ff8497ac4e117e91a8cb9168b58f2fd45edd73c1b0c8b33002df376801ff58aaa94000bf8a86f92620f343baef38a580102395ae3abf9128d1047a0736ff9b83d456740ebbb4aeb3aa9737f18fb4afb4aa074fb26c4d702f42968888550a3bded8c05247e045b866baef0499f079fdaeef6538f31d44deafffdfd3afa2fb4ca9082b8f1c465371a9894dd8c2",
    ];

    #[test]
    fn matches_test_vectors() {
        let secrets: Vec<Vec<u8>> = SECRETS.iter().map(|s| hex(s)).collect();
        let raw_payload = hex("2002");

        let mut reply = create_reply(&secrets[4], &raw_payload).unwrap();
        assert_eq!(reply.len(), REPLY_LEN);

        for i in (0..5).rev() {
            reply = wrap_reply(&secrets[i], &reply);
            assert_eq!(reply, hex(INTERMEDIATES[i]), "mismatch at hop {i}");
        }

        let (hop, payload) = unwrap_reply(&secrets, &reply).unwrap();
        assert_eq!(hop, 4);
        assert_eq!(payload, raw_payload);
    }

    #[test]
    fn length_is_preserved_by_wrap() {
        let secret = hex(SECRETS[0]);
        let packet = create_reply(&secret, &[0x20, 0x02]).unwrap();
        let wrapped = wrap_reply(&secret, &packet);
        assert_eq!(wrapped.len(), packet.len());
    }

    #[test]
    fn tampered_packet_fails_to_unwrap() {
        let secrets: Vec<Vec<u8>> = SECRETS.iter().map(|s| hex(s)).collect();
        let mut reply = create_reply(&secrets[4], &[0x20, 0x02]).unwrap();
        for i in (0..5).rev() {
            reply = wrap_reply(&secrets[i], &reply);
        }

        reply[100] ^= 0xff;

        assert!(matches!(
            unwrap_reply(&secrets, &reply),
            Err(SphinxError::MalformedReply)
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let secret = hex(SECRETS[0]);
        let too_long = vec![0u8; INNER_LEN];
        assert!(matches!(
            create_reply(&secret, &too_long),
            Err(SphinxError::MalformedReply)
        ));
    }

    #[test]
    fn wrong_length_packet_is_rejected() {
        let secrets: Vec<Vec<u8>> = SECRETS.iter().map(|s| hex(s)).collect();
        assert!(matches!(
            unwrap_reply(&secrets, &[0u8; REPLY_LEN - 1]),
            Err(SphinxError::MalformedReply)
        ));
    }
}
