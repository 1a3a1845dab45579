//! Session encryption: ChaCha20-Poly1305 (authenticated) or AES-256-CBC with
//! framing CRC for integrity. One [`Session`] per link; key material is zeroed
//! on drop.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const BLOCK: usize = 16;

/// AEAD tag length in bytes.
pub const TAG_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Tag mismatch or malformed ciphertext. The frame is dropped whole; no
    /// partial plaintext is ever returned.
    #[error("authentication failed")]
    AuthFailed,
    #[error("invalid key material")]
    InvalidKey,
    #[error("ciphertext length {0} invalid for cipher mode")]
    InvalidLength(usize),
    /// The per-direction nonce counter ran out. Rekey via a fresh handshake.
    #[error("nonce counter exhausted")]
    CounterExhausted,
}

/// Wire cipher discipline, fixed per connection at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherMode {
    /// Authenticated encryption; tag mismatch rejects the whole frame.
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// AES-256-CBC with zero padding. Integrity comes from the frame CRC
    /// over the ciphertext only, which detects corruption but not forgery;
    /// lower-assurance, retained for compatibility with deployed links.
    #[serde(rename = "aes256-cbc")]
    Aes256Cbc,
}

/// Which side of the handshake this session belongs to. Selects the nonce
/// direction tags and which IV contribution seeds which CBC chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Initiator,
    Responder,
}

impl Direction {
    fn tag(self) -> u8 {
        match self {
            Direction::Initiator => 0x49,
            Direction::Responder => 0x52,
        }
    }

    fn peer(self) -> Direction {
        match self {
            Direction::Initiator => Direction::Responder,
            Direction::Responder => Direction::Initiator,
        }
    }
}

enum SealState {
    Aead { tag: u8, counter: u64 },
    Cbc(Aes256CbcEnc),
}

enum OpenState {
    Aead { tag: u8, counter: u64 },
    Cbc(Aes256CbcDec),
}

/// Negotiated symmetric state for one connection. Counters are implicit and
/// strictly monotonic per direction, so a nonce never repeats under one key;
/// exhaustion is rejected rather than wrapped.
pub struct Session {
    mode: CipherMode,
    key: Zeroizing<[u8; 32]>,
    /// Associated data binding ciphertexts to one vehicle identity.
    aad: [u8; 4],
    seal: SealState,
    open: OpenState,
}

impl Session {
    /// Build a session from a derived key and both sides' handshake IV
    /// contributions. `iv_init` seeds the initiator-to-responder CBC chain,
    /// `iv_resp` the reverse one.
    pub fn new(
        mode: CipherMode,
        key: [u8; 32],
        car_id: u32,
        role: Direction,
        iv_init: &[u8; 16],
        iv_resp: &[u8; 16],
    ) -> Result<Self, CryptoError> {
        let key = Zeroizing::new(key);
        let (send_iv, recv_iv) = match role {
            Direction::Initiator => (iv_init, iv_resp),
            Direction::Responder => (iv_resp, iv_init),
        };
        let (seal, open) = match mode {
            CipherMode::ChaCha20Poly1305 => (
                SealState::Aead {
                    tag: role.tag(),
                    counter: 0,
                },
                OpenState::Aead {
                    tag: role.peer().tag(),
                    counter: 0,
                },
            ),
            CipherMode::Aes256Cbc => (
                SealState::Cbc(
                    Aes256CbcEnc::new_from_slices(&key[..], send_iv)
                        .map_err(|_| CryptoError::InvalidKey)?,
                ),
                OpenState::Cbc(
                    Aes256CbcDec::new_from_slices(&key[..], recv_iv)
                        .map_err(|_| CryptoError::InvalidKey)?,
                ),
            ),
        };
        Ok(Self {
            mode,
            key,
            aad: car_id.to_le_bytes(),
            seal,
            open,
        })
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Largest plaintext that seals into a payload of `max_payload` bytes.
    pub fn max_plaintext(mode: CipherMode, max_payload: usize) -> usize {
        match mode {
            CipherMode::ChaCha20Poly1305 => max_payload.saturating_sub(TAG_LEN),
            CipherMode::Aes256Cbc => max_payload - (max_payload % BLOCK),
        }
    }

    /// Encrypt one command payload. AEAD output is `ciphertext || tag`; CBC
    /// output is the zero-padded ciphertext.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::InvalidLength(0));
        }
        match &mut self.seal {
            SealState::Aead { tag, counter } => {
                let nonce = aead_nonce(*tag, *counter)?;
                let cipher = ChaCha20Poly1305::new_from_slice(&self.key[..])
                    .map_err(|_| CryptoError::InvalidKey)?;
                let out = cipher
                    .encrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: plaintext,
                            aad: &self.aad,
                        },
                    )
                    .map_err(|_| CryptoError::AuthFailed)?;
                *counter += 1;
                Ok(out)
            }
            SealState::Cbc(enc) => {
                let mut buf = plaintext.to_vec();
                buf.resize(buf.len().div_ceil(BLOCK) * BLOCK, 0);
                for block in buf.chunks_exact_mut(BLOCK) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                Ok(buf)
            }
        }
    }

    /// Decrypt one command payload. Fails closed: any authentication or
    /// length problem discards the frame.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &mut self.open {
            OpenState::Aead { tag, counter } => {
                let nonce = aead_nonce(*tag, *counter)?;
                let cipher = ChaCha20Poly1305::new_from_slice(&self.key[..])
                    .map_err(|_| CryptoError::InvalidKey)?;
                let out = cipher
                    .decrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: ciphertext,
                            aad: &self.aad,
                        },
                    )
                    .map_err(|_| CryptoError::AuthFailed)?;
                // Only a verified frame advances the window; a forgery can
                // not desynchronize the counters.
                *counter += 1;
                Ok(out)
            }
            OpenState::Cbc(dec) => {
                if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
                    return Err(CryptoError::InvalidLength(ciphertext.len()));
                }
                let mut buf = ciphertext.to_vec();
                for block in buf.chunks_exact_mut(BLOCK) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                Ok(buf)
            }
        }
    }
}

/// 96-bit nonce: direction tag, three zero bytes, 64-bit LE counter.
fn aead_nonce(tag: u8, counter: u64) -> Result<[u8; 12], CryptoError> {
    if counter == u64::MAX {
        return Err(CryptoError::CounterExhausted);
    }
    let mut nonce = [0u8; 12];
    nonce[0] = tag;
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn session_pair(mode: CipherMode) -> (Session, Session) {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let iv_i = [0x11u8; 16];
        let iv_r = [0x22u8; 16];
        let a = Session::new(mode, key, 7, Direction::Initiator, &iv_i, &iv_r).unwrap();
        let b = Session::new(mode, key, 7, Direction::Responder, &iv_i, &iv_r).unwrap();
        (a, b)
    }

    #[test]
    fn aead_roundtrip() {
        let (mut a, mut b) = session_pair(CipherMode::ChaCha20Poly1305);
        let msg = b"\x55unlock token".to_vec();
        let sealed = a.seal(&msg).unwrap();
        assert_eq!(sealed.len(), msg.len() + TAG_LEN);
        assert_eq!(b.open(&sealed).unwrap(), msg);
    }

    #[test]
    fn aead_roundtrip_both_directions() {
        let (mut a, mut b) = session_pair(CipherMode::ChaCha20Poly1305);
        let fwd = a.seal(b"ping").unwrap();
        assert_eq!(b.open(&fwd).unwrap(), b"ping");
        let back = b.seal(b"pong").unwrap();
        assert_eq!(a.open(&back).unwrap(), b"pong");
    }

    #[test]
    fn aead_tamper_rejected() {
        let (mut a, mut b) = session_pair(CipherMode::ChaCha20Poly1305);
        let mut sealed = a.seal(b"feature 3").unwrap();
        for i in 0..sealed.len() {
            sealed[i] ^= 0x01;
            assert!(matches!(b.open(&sealed), Err(CryptoError::AuthFailed)));
            sealed[i] ^= 0x01;
        }
        // Untampered frame still opens: failed attempts did not advance the
        // receive counter.
        assert_eq!(b.open(&sealed).unwrap(), b"feature 3");
    }

    #[test]
    fn aead_wrong_identity_rejected() {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let iv = [0u8; 16];
        let mut a = Session::new(
            CipherMode::ChaCha20Poly1305,
            key,
            1,
            Direction::Initiator,
            &iv,
            &iv,
        )
        .unwrap();
        let mut b = Session::new(
            CipherMode::ChaCha20Poly1305,
            key,
            2,
            Direction::Responder,
            &iv,
            &iv,
        )
        .unwrap();
        let sealed = a.seal(b"hello").unwrap();
        assert!(matches!(b.open(&sealed), Err(CryptoError::AuthFailed)));
    }

    #[test]
    fn aead_replay_rejected() {
        let (mut a, mut b) = session_pair(CipherMode::ChaCha20Poly1305);
        let sealed = a.seal(b"once").unwrap();
        assert_eq!(b.open(&sealed).unwrap(), b"once");
        // Replaying the same ciphertext hits the advanced counter.
        assert!(matches!(b.open(&sealed), Err(CryptoError::AuthFailed)));
    }

    #[test]
    fn cbc_roundtrip_with_padding() {
        let (mut a, mut b) = session_pair(CipherMode::Aes256Cbc);
        let msg = b"\x45short".to_vec();
        let sealed = a.seal(&msg).unwrap();
        assert_eq!(sealed.len(), 16);
        let opened = b.open(&sealed).unwrap();
        assert_eq!(&opened[..msg.len()], &msg[..]);
        assert!(opened[msg.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn cbc_chain_survives_multiple_messages() {
        let (mut a, mut b) = session_pair(CipherMode::Aes256Cbc);
        for i in 0..5u8 {
            let msg = vec![i; 16];
            let sealed = a.seal(&msg).unwrap();
            assert_eq!(b.open(&sealed).unwrap(), msg);
        }
    }

    #[test]
    fn cbc_ragged_length_rejected() {
        let (_, mut b) = session_pair(CipherMode::Aes256Cbc);
        assert!(matches!(
            b.open(&[0u8; 17]),
            Err(CryptoError::InvalidLength(17))
        ));
    }

    #[test]
    fn empty_plaintext_rejected() {
        let (mut a, _) = session_pair(CipherMode::ChaCha20Poly1305);
        assert!(matches!(a.seal(&[]), Err(CryptoError::InvalidLength(0))));
    }

    #[test]
    fn max_plaintext_budgets() {
        assert_eq!(
            Session::max_plaintext(CipherMode::ChaCha20Poly1305, 80),
            64
        );
        assert_eq!(Session::max_plaintext(CipherMode::Aes256Cbc, 80), 80);
    }
}
