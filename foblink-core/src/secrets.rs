//! Provisioned secret material. The provisioning collaborator generates and
//! stores it; the protocol core only reads it through [`SecretSource`] and
//! never defines the at-rest layout.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("provisioned secrets unavailable: {0}")]
    Unavailable(String),
    #[error("provisioned secrets malformed: {0}")]
    Malformed(String),
}

/// Pre-shared material for one device, immutable for the protocol's
/// lifetime. Key fields are zeroed when the value is dropped.
#[derive(Clone)]
pub struct ProvisionedSecrets {
    /// Identity of the vehicle this device belongs to.
    pub car_id: u32,
    /// Keyed hash of the pairing PIN.
    pub pin_hash: [u8; 32],
    /// Per-device key for the PIN hash.
    pub pin_salt: [u8; 16],
    /// Shared key between paired fob and car; authorizes unlock.
    pub link_key: Zeroizing<[u8; 32]>,
    /// Key covering feature state handoff.
    pub feature_key: Zeroizing<[u8; 32]>,
    /// Manufacturer Ed25519 verifying key for feature packages.
    pub auth_pubkey: [u8; 32],
    /// Whether this device shipped already paired.
    pub paired: bool,
}

/// Read-only access to provisioned secrets, shared by every connection on a
/// device.
pub trait SecretSource {
    fn load(&self) -> Result<ProvisionedSecrets, SecretError>;
}

/// How the provisioning collaborator turns raw inputs into a 32-byte key.
/// A closed set: resolution is a match, never a name-to-function lookup.
#[derive(Debug, Clone)]
pub enum Derivation {
    /// Use the bytes as-is; must be exactly 32 bytes.
    Direct(Vec<u8>),
    /// SHA-256 of the input.
    HashOf(Vec<u8>),
    /// HMAC-SHA256 of `data` under `key`.
    Hmac { key: Vec<u8>, data: Vec<u8> },
}

impl Derivation {
    pub fn resolve(&self) -> Result<Zeroizing<[u8; 32]>, SecretError> {
        match self {
            Derivation::Direct(bytes) => {
                let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    SecretError::Malformed(format!("direct key must be 32 bytes, got {}", bytes.len()))
                })?;
                Ok(Zeroizing::new(arr))
            }
            Derivation::HashOf(bytes) => {
                let digest: [u8; 32] = Sha256::digest(bytes).into();
                Ok(Zeroizing::new(digest))
            }
            Derivation::Hmac { key, data } => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .map_err(|_| SecretError::Malformed("empty hmac key".into()))?;
                mac.update(data);
                let digest: [u8; 32] = mac.finalize().into_bytes().into();
                Ok(Zeroizing::new(digest))
            }
        }
    }
}

impl SecretSource for ProvisionedSecrets {
    fn load(&self) -> Result<ProvisionedSecrets, SecretError> {
        Ok(self.clone())
    }
}
