//! Ephemeral key agreement: P-256 ECDH, one exchange of clear frames per
//! connection, session key derived from the shared point and both IV
//! contributions.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Marker byte opening an initiator's handshake payload.
pub const HANDSHAKE_INIT: u8 = 0xAB;
/// Marker byte opening a responder's handshake payload.
pub const HANDSHAKE_REPLY: u8 = 0xE0;

/// SEC1 uncompressed point length (tag byte + two 32-byte coordinates).
pub const POINT_LEN: usize = 65;
/// Per-side IV contribution length.
pub const IV_LEN: usize = 16;
/// Clear handshake payload: marker + point + IV contribution.
pub const HANDSHAKE_PAYLOAD_LEN: usize = 1 + POINT_LEN + IV_LEN;

const SEC1_UNCOMPRESSED: u8 = 0x04;
const KDF_LABEL: &[u8] = b"foblink-session-v1";

/// Fatal to the handshake; the link must be closed, never continued with a
/// null key.
#[derive(Debug, thiserror::Error)]
pub enum KeyExchangeError {
    /// Peer point has the wrong length, wrong tag byte, or is not on the
    /// curve.
    #[error("invalid peer public key")]
    InvalidPeerKey,
    #[error("unexpected handshake marker {0:#04x}")]
    UnexpectedMarker(u8),
    #[error("handshake payload has wrong shape")]
    Malformed,
}

/// One connection's ephemeral keypair. The secret never leaves this value
/// and is dropped with the handshake.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: EncodedPoint,
}

impl EphemeralKeypair {
    /// Fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        Self { secret, public }
    }

    /// Uncompressed SEC1 encoding of the public point.
    pub fn public_bytes(&self) -> [u8; POINT_LEN] {
        let mut out = [0u8; POINT_LEN];
        out.copy_from_slice(self.public.as_bytes());
        out
    }
}

/// Validate the peer's point and compute the raw ECDH shared secret.
pub fn derive_shared_secret(
    own: &EphemeralKeypair,
    peer_point: &[u8],
) -> Result<[u8; 32], KeyExchangeError> {
    if peer_point.len() != POINT_LEN || peer_point[0] != SEC1_UNCOMPRESSED {
        return Err(KeyExchangeError::InvalidPeerKey);
    }
    let peer =
        PublicKey::from_sec1_bytes(peer_point).map_err(|_| KeyExchangeError::InvalidPeerKey)?;
    let shared = own.secret.diffie_hellman(&peer);
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// Session key: SHA-256 over a domain label, the shared secret and both
/// sides' IV contributions, so either side changing its contribution changes
/// the key.
pub fn derive_session_key(shared: &[u8; 32], iv_init: &[u8; 16], iv_resp: &[u8; 16]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KDF_LABEL);
    hasher.update(shared);
    hasher.update(iv_init);
    hasher.update(iv_resp);
    hasher.finalize().into()
}

/// Transcript binding for this connection, used to scope unlock tokens to one
/// session. Public inputs only.
pub fn session_binding(iv_init: &[u8; 16], iv_resp: &[u8; 16]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"foblink-binding-v1");
    hasher.update(iv_init);
    hasher.update(iv_resp);
    hasher.finalize().into()
}

/// Fresh 16-byte IV contribution.
pub fn generate_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Build a clear handshake payload: `[marker][point][iv]`.
pub fn encode_handshake(marker: u8, point: &[u8; POINT_LEN], iv: &[u8; IV_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_PAYLOAD_LEN);
    out.push(marker);
    out.extend_from_slice(point);
    out.extend_from_slice(iv);
    out
}

/// Split a clear handshake payload, checking the expected marker. Length
/// errors are reported as a bad peer key: the only variable-length field is
/// the point.
pub fn parse_handshake(
    expected_marker: u8,
    payload: &[u8],
) -> Result<(Vec<u8>, [u8; IV_LEN]), KeyExchangeError> {
    let (&marker, rest) = payload.split_first().ok_or(KeyExchangeError::Malformed)?;
    if marker != expected_marker {
        return Err(KeyExchangeError::UnexpectedMarker(marker));
    }
    if rest.len() != POINT_LEN + IV_LEN {
        return Err(KeyExchangeError::InvalidPeerKey);
    }
    let point = rest[..POINT_LEN].to_vec();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&rest[POINT_LEN..]);
    Ok((point, iv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_converge_on_one_key() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let shared_a = derive_shared_secret(&a, &b.public_bytes()).unwrap();
        let shared_b = derive_shared_secret(&b, &a.public_bytes()).unwrap();
        assert_eq!(shared_a, shared_b);

        let iv_i = generate_iv();
        let iv_r = generate_iv();
        assert_eq!(
            derive_session_key(&shared_a, &iv_i, &iv_r),
            derive_session_key(&shared_b, &iv_i, &iv_r)
        );
    }

    #[test]
    fn fresh_keypairs_give_fresh_keys() {
        let a1 = EphemeralKeypair::generate();
        let a2 = EphemeralKeypair::generate();
        assert_ne!(a1.public_bytes(), a2.public_bytes());
    }

    #[test]
    fn wrong_length_point_rejected() {
        let own = EphemeralKeypair::generate();
        assert!(matches!(
            derive_shared_secret(&own, &[0x04; 48]),
            Err(KeyExchangeError::InvalidPeerKey)
        ));
    }

    #[test]
    fn wrong_tag_byte_rejected() {
        let own = EphemeralKeypair::generate();
        let mut point = EphemeralKeypair::generate().public_bytes();
        point[0] = 0x02;
        assert!(matches!(
            derive_shared_secret(&own, &point),
            Err(KeyExchangeError::InvalidPeerKey)
        ));
    }

    #[test]
    fn off_curve_point_rejected() {
        let own = EphemeralKeypair::generate();
        let mut point = [0u8; POINT_LEN];
        point[0] = 0x04;
        point[1] = 0xFF;
        assert!(matches!(
            derive_shared_secret(&own, &point),
            Err(KeyExchangeError::InvalidPeerKey)
        ));
    }

    #[test]
    fn handshake_payload_roundtrip() {
        let kp = EphemeralKeypair::generate();
        let iv = generate_iv();
        let payload = encode_handshake(HANDSHAKE_INIT, &kp.public_bytes(), &iv);
        assert_eq!(payload.len(), HANDSHAKE_PAYLOAD_LEN);
        let (point, parsed_iv) = parse_handshake(HANDSHAKE_INIT, &payload).unwrap();
        assert_eq!(point, kp.public_bytes());
        assert_eq!(parsed_iv, iv);
    }

    #[test]
    fn marker_mismatch_rejected() {
        let kp = EphemeralKeypair::generate();
        let iv = generate_iv();
        let payload = encode_handshake(HANDSHAKE_REPLY, &kp.public_bytes(), &iv);
        assert!(matches!(
            parse_handshake(HANDSHAKE_INIT, &payload),
            Err(KeyExchangeError::UnexpectedMarker(HANDSHAKE_REPLY))
        ));
    }

    #[test]
    fn short_payload_is_bad_peer_key() {
        let payload = [HANDSHAKE_INIT, 0x04, 0x01];
        assert!(matches!(
            parse_handshake(HANDSHAKE_INIT, &payload),
            Err(KeyExchangeError::InvalidPeerKey)
        ));
    }
}
