//! Pairing: PIN normalization and keyed hashing, attempt throttling, and the
//! per-attempt state machine. Time is injected by the caller; there is no
//! global clock.

use std::fmt;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::secrets::ProvisionedSecrets;

type HmacSha256 = Hmac<Sha256>;

/// PIN length in symbols.
pub const PIN_LEN: usize = 6;

/// Pairing failure. The one error class that is user-visible; messages are
/// written for the person holding the fob.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("PIN must be exactly 6 hexadecimal characters")]
    MalformedPin,
    #[error("incorrect PIN")]
    IncorrectPin,
    #[error("device is already paired")]
    AlreadyPaired,
    #[error("device is not paired")]
    NotPaired,
    #[error("too many attempts, retry in {retry_after:?}")]
    Throttled { retry_after: Duration },
    #[error("pairing locked after repeated failures")]
    LockedOut,
    #[error("pairing attempt timed out")]
    TimedOut,
    #[error("pairing step out of order")]
    InvalidState,
}

/// A candidate PIN, normalized to uppercase hex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pin([u8; PIN_LEN]);

impl Pin {
    /// Accepts exactly six hex symbols in either case.
    pub fn parse(s: &str) -> Result<Self, PairingError> {
        let t = s.trim();
        if t.len() != PIN_LEN || !t.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PairingError::MalformedPin);
        }
        let mut out = [0u8; PIN_LEN];
        for (slot, b) in out.iter_mut().zip(t.bytes()) {
            *slot = b.to_ascii_uppercase();
        }
        Ok(Pin(out))
    }

    pub fn as_bytes(&self) -> &[u8; PIN_LEN] {
        &self.0
    }
}

/// Keyed PIN hash: HMAC-SHA256 of the normalized PIN under the per-device
/// salt key. The provisioning collaborator computes the expected value the
/// same way.
pub fn pin_hash(salt: &[u8; 16], pin: &Pin) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(pin.as_bytes());
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of a candidate PIN against the expected keyed
/// hash. Verification cost does not depend on where the hashes first differ.
pub fn verify_pin(expected: &[u8; 32], salt: &[u8; 16], candidate: &Pin) -> bool {
    let actual = pin_hash(salt, candidate);
    actual.ct_eq(expected).into()
}

/// Brute-force throttling. A 6-symbol hex PIN has only 16^6 candidates, so
/// unthrottled guessing is feasible in hours; every deployment carries a
/// policy.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    /// Delay after the first failure; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Permanent lockout after this many consecutive failures, if set.
    pub max_failures: Option<u32>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_failures: None,
        }
    }
}

/// Attempt bookkeeping. Lives on the device, outliving individual pairing
/// attempts, so backoff cannot be reset by reconnecting.
#[derive(Debug)]
pub struct Throttle {
    policy: ThrottlePolicy,
    failures: u32,
    blocked_until: Option<Instant>,
    locked: bool,
}

impl Throttle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            failures: 0,
            blocked_until: None,
            locked: false,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// May an attempt proceed now?
    pub fn check(&self, now: Instant) -> Result<(), PairingError> {
        if self.locked {
            return Err(PairingError::LockedOut);
        }
        match self.blocked_until {
            Some(until) if now < until => Err(PairingError::Throttled {
                retry_after: until - now,
            }),
            _ => Ok(()),
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.policy.max_failures {
            if self.failures >= max {
                self.locked = true;
                return;
            }
        }
        let shift = (self.failures - 1).min(20);
        let delay = self
            .policy
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.policy.max_delay);
        self.blocked_until = Some(now + delay);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.blocked_until = None;
    }
}

/// Pairing attempt states. `Paired`, `Failed` and `TimedOut` are terminal;
/// the machine is discarded afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    AwaitingPin,
    VerifyingPin,
    Paired,
    Failed,
    TimedOut,
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairingState::Unpaired => "unpaired",
            PairingState::AwaitingPin => "awaiting-pin",
            PairingState::VerifyingPin => "verifying-pin",
            PairingState::Paired => "paired",
            PairingState::Failed => "failed",
            PairingState::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Secrets activated by a successful pairing, persisted by the caller
/// alongside the paired flag.
#[derive(Clone, Debug)]
pub struct PairingRecord {
    pub car_id: u32,
    pub link_key: Zeroizing<[u8; 32]>,
    pub feature_key: Zeroizing<[u8; 32]>,
}

/// Wire length of a pairing grant: car id + link key. The feature key is
/// provisioned per device and never leaves it.
pub const GRANT_LEN: usize = 4 + 32;

impl PairingRecord {
    pub(crate) fn from_secrets(secrets: &ProvisionedSecrets) -> Self {
        Self {
            car_id: secrets.car_id,
            link_key: secrets.link_key.clone(),
            feature_key: secrets.feature_key.clone(),
        }
    }

    /// Grant bytes for transfer to a newly paired device. Sent only inside
    /// an established session.
    pub fn encode_grant(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(GRANT_LEN);
        out.extend_from_slice(&self.car_id.to_le_bytes());
        out.extend_from_slice(&self.link_key[..]);
        out
    }

    /// Rebuild a record from a received grant, completing it with the
    /// receiver's provisioned feature key.
    pub fn from_grant(data: &[u8], secrets: &ProvisionedSecrets) -> Result<Self, PairingError> {
        if data.len() < GRANT_LEN {
            return Err(PairingError::InvalidState);
        }
        let car_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut link_key = Zeroizing::new([0u8; 32]);
        link_key.copy_from_slice(&data[4..GRANT_LEN]);
        Ok(Self {
            car_id,
            link_key,
            feature_key: secrets.feature_key.clone(),
        })
    }
}

/// One pairing attempt. Created when pairing begins, destroyed on any
/// terminal state; never outlives the attempt.
pub struct PairingMachine {
    state: PairingState,
    deadline: Instant,
}

impl PairingMachine {
    /// Start an attempt with a bounded window.
    pub fn begin(timeout: Duration, now: Instant) -> Self {
        Self {
            state: PairingState::Unpaired,
            deadline: now + timeout,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    fn goto(&mut self, next: PairingState) {
        tracing::debug!(from = %self.state, to = %next, "pairing transition");
        self.state = next;
    }

    fn expire_if_due(&mut self, now: Instant) -> Result<(), PairingError> {
        if now >= self.deadline {
            self.goto(PairingState::TimedOut);
            return Err(PairingError::TimedOut);
        }
        Ok(())
    }

    /// Check the attempt window; past the deadline the attempt moves to
    /// `TimedOut` and the context is released.
    pub fn tick(&mut self, now: Instant) -> PairingState {
        if !matches!(
            self.state,
            PairingState::Paired | PairingState::Failed | PairingState::TimedOut
        ) {
            let _ = self.expire_if_due(now);
        }
        self.state
    }

    /// Begin waiting for a candidate PIN.
    pub fn request_pair(&mut self, now: Instant) -> Result<(), PairingError> {
        self.expire_if_due(now)?;
        if self.state != PairingState::Unpaired {
            return Err(PairingError::InvalidState);
        }
        self.goto(PairingState::AwaitingPin);
        Ok(())
    }

    /// Verify a candidate PIN. On success the returned record holds the
    /// activated secrets; the caller persists it and sets the paired flag.
    pub fn submit_pin(
        &mut self,
        throttle: &mut Throttle,
        candidate: &str,
        secrets: &ProvisionedSecrets,
        now: Instant,
    ) -> Result<PairingRecord, PairingError> {
        self.expire_if_due(now)?;
        if self.state != PairingState::AwaitingPin {
            return Err(PairingError::InvalidState);
        }
        throttle.check(now)?;
        // Malformed input is rejected before it counts as a verification.
        let pin = Pin::parse(candidate)?;
        self.goto(PairingState::VerifyingPin);
        if verify_pin(&secrets.pin_hash, &secrets.pin_salt, &pin) {
            throttle.record_success();
            self.goto(PairingState::Paired);
            Ok(PairingRecord::from_secrets(secrets))
        } else {
            throttle.record_failure(now);
            self.goto(PairingState::Failed);
            Err(PairingError::IncorrectPin)
        }
    }
}
