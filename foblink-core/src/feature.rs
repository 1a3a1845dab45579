//! Feature unlock: manufacturer-signed packages, applied at most once each.

use std::collections::HashSet;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

/// Feature numbers are 1-based bits of an 8-bit field.
pub const MAX_FEATURE: u8 = 8;

const CAR_ID_LEN: usize = 4;
const NONCE_LEN: usize = 8;
const SIG_LEN: usize = 64;
const BODY_LEN: usize = CAR_ID_LEN + 1 + NONCE_LEN;

/// Wire length of an encoded package.
pub const PACKAGE_LEN: usize = BODY_LEN + SIG_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("package is {0} bytes, expected {PACKAGE_LEN}")]
    Malformed(usize),
    #[error("package targets car {got}, this car is {expected}")]
    WrongCar { expected: u32, got: u32 },
    #[error("feature number {0} out of range")]
    InvalidFeature(u8),
    #[error("package signature invalid")]
    BadSignature,
    #[error("feature {0} already enabled")]
    AlreadyEnabled(u8),
    #[error("package already applied")]
    Replayed,
}

/// A signed authorization to enable one feature on one car:
/// `[car_id u32 LE][feature u8][nonce 8B][signature 64B]`, signature over
/// the first 13 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub car_id: u32,
    pub feature: u8,
    pub nonce: [u8; NONCE_LEN],
    pub signature: [u8; SIG_LEN],
}

impl Package {
    fn body(car_id: u32, feature: u8, nonce: &[u8; NONCE_LEN]) -> [u8; BODY_LEN] {
        let mut body = [0u8; BODY_LEN];
        body[..CAR_ID_LEN].copy_from_slice(&car_id.to_le_bytes());
        body[CAR_ID_LEN] = feature;
        body[CAR_ID_LEN + 1..].copy_from_slice(nonce);
        body
    }

    /// Build and sign a package. Used by the packaging collaborator and by
    /// tests; devices only verify.
    pub fn sign(key: &SigningKey, car_id: u32, feature: u8, nonce: [u8; NONCE_LEN]) -> Self {
        let body = Self::body(car_id, feature, &nonce);
        let signature = key.sign(&body);
        Self {
            car_id,
            feature,
            nonce,
            signature: signature.to_bytes(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKAGE_LEN);
        out.extend_from_slice(&Self::body(self.car_id, self.feature, &self.nonce));
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, FeatureError> {
        if data.len() != PACKAGE_LEN {
            return Err(FeatureError::Malformed(data.len()));
        }
        let car_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let feature = data[CAR_ID_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[CAR_ID_LEN + 1..BODY_LEN]);
        let mut signature = [0u8; SIG_LEN];
        signature.copy_from_slice(&data[BODY_LEN..]);
        Ok(Self {
            car_id,
            feature,
            nonce,
            signature,
        })
    }

    /// Verify the manufacturer signature over the package body.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), FeatureError> {
        let signature = Signature::from_bytes(&self.signature);
        let body = Self::body(self.car_id, self.feature, &self.nonce);
        key.verify_strict(&body, &signature)
            .map_err(|_| FeatureError::BadSignature)
    }
}

/// Per-car feature state: the enabled bitfield plus the set of applied
/// package nonces for replay rejection. Application is monotonic.
#[derive(Debug, Default)]
pub struct FeatureSet {
    enabled: u8,
    applied: HashSet<(u8, [u8; NONCE_LEN])>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, feature: u8) -> bool {
        (1..=MAX_FEATURE).contains(&feature) && self.enabled & (1 << (feature - 1)) != 0
    }

    /// Bitfield of enabled features, bit 0 = feature 1.
    pub fn mask(&self) -> u8 {
        self.enabled
    }

    /// Validate a package for this car and apply it. Signature and identity
    /// are checked before any state changes; a package is accepted exactly
    /// once.
    pub fn apply(
        &mut self,
        package: &Package,
        expected_car: u32,
        key: &VerifyingKey,
    ) -> Result<(), FeatureError> {
        if package.car_id != expected_car {
            return Err(FeatureError::WrongCar {
                expected: expected_car,
                got: package.car_id,
            });
        }
        if !(1..=MAX_FEATURE).contains(&package.feature) {
            return Err(FeatureError::InvalidFeature(package.feature));
        }
        package.verify(key)?;
        if self.applied.contains(&(package.feature, package.nonce)) {
            return Err(FeatureError::Replayed);
        }
        if self.is_enabled(package.feature) {
            return Err(FeatureError::AlreadyEnabled(package.feature));
        }
        self.applied.insert((package.feature, package.nonce));
        self.enabled |= 1 << (package.feature - 1);
        tracing::info!(feature = package.feature, "feature enabled");
        Ok(())
    }
}
