//! Provisioning collaborator: load device secrets from a JSON file into the
//! core's provisioned-secrets shape. The core never sees this layout.

use std::path::PathBuf;

use foblink_core::pairing::{pin_hash, Pin};
use foblink_core::secrets::{Derivation, ProvisionedSecrets, SecretError, SecretSource};
use serde::Deserialize;

#[derive(Deserialize)]
struct SecretsFile {
    car_id: u32,
    /// Pairing PIN; the keyed hash is computed at load time.
    pin: String,
    /// Hex-encoded 16-byte PIN salt key.
    pin_salt: String,
    /// Seed strings for derived keys.
    link_key_seed: String,
    feature_key_seed: String,
    /// Hex-encoded 32-byte Ed25519 manufacturer verifying key.
    auth_pubkey: String,
    #[serde(default)]
    paired: bool,
}

/// Secret source backed by a JSON file on disk.
pub struct FileSecretSource {
    path: PathBuf,
}

impl FileSecretSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SecretSource for FileSecretSource {
    fn load(&self) -> Result<ProvisionedSecrets, SecretError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| SecretError::Unavailable(format!("{}: {e}", self.path.display())))?;
        parse(&text)
    }
}

fn parse(text: &str) -> Result<ProvisionedSecrets, SecretError> {
    let raw: SecretsFile =
        serde_json::from_str(text).map_err(|e| SecretError::Malformed(e.to_string()))?;

    let pin_salt: [u8; 16] = hex_array(&raw.pin_salt, "pin_salt")?;
    let auth_pubkey: [u8; 32] = hex_array(&raw.auth_pubkey, "auth_pubkey")?;
    let pin = Pin::parse(&raw.pin).map_err(|e| SecretError::Malformed(e.to_string()))?;

    Ok(ProvisionedSecrets {
        car_id: raw.car_id,
        pin_hash: pin_hash(&pin_salt, &pin),
        pin_salt,
        link_key: Derivation::HashOf(raw.link_key_seed.into_bytes()).resolve()?,
        feature_key: Derivation::HashOf(raw.feature_key_seed.into_bytes()).resolve()?,
        auth_pubkey,
        paired: raw.paired,
    })
}

fn hex_array<const N: usize>(s: &str, field: &str) -> Result<[u8; N], SecretError> {
    let bytes = hex::decode(s)
        .map_err(|e| SecretError::Malformed(format!("{field}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SecretError::Malformed(format!("{field}: expected {N} bytes")))
}
