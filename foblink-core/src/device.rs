//! Car and fob device endpoints: wire the dispatcher to per-device state and
//! drive client-side requests over a secure channel.

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::channel::{ChannelError, SecureChannel};
use crate::command::{Command, CommandCode};
use crate::crypto::Session;
use crate::dispatch::{Dispatcher, Response};
use crate::feature::{FeatureSet, Package, PACKAGE_LEN};
use crate::frame::FrameError;
use crate::link::Link;
use crate::pairing::{
    verify_pin, PairingError, PairingMachine, PairingRecord, PairingState, Pin, Throttle,
    ThrottlePolicy,
};
use crate::secrets::ProvisionedSecrets;
use crate::status::StatusCode;

use ed25519_dalek::VerifyingKey;

type HmacSha256 = Hmac<Sha256>;

/// Unlock token length on the wire.
pub const TOKEN_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("peer rejected request: {}", .0.describe())]
    Rejected(StatusCode),
    #[error("malformed reply from peer")]
    BadReply,
    #[error("provisioned verifying key is not a valid point")]
    BadAuthKey,
}

/// Session-scoped unlock token: HMAC-SHA256 over the car identity and the
/// handshake transcript binding, keyed with the provisioned link key. Never
/// valid on another connection, so capture and replay buys nothing.
pub fn unlock_token(link_key: &[u8; 32], car_id: u32, binding: &[u8; 32]) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(&link_key[..]).expect("hmac accepts any key length");
    mac.update(b"foblink-unlock-v1");
    mac.update(&car_id.to_le_bytes());
    mac.update(binding);
    mac.finalize().into_bytes().into()
}

// ---------------------------------------------------------------------------
// Car
// ---------------------------------------------------------------------------

/// Vehicle controller state shared across connections.
pub struct CarDevice {
    secrets: ProvisionedSecrets,
    auth_key: VerifyingKey,
    features: FeatureSet,
}

/// Per-connection car context handed to command handlers.
pub struct CarSession<'a> {
    device: &'a mut CarDevice,
    binding: [u8; 32],
    unlocked: bool,
    package_buf: Vec<u8>,
}

impl CarDevice {
    pub fn new(secrets: ProvisionedSecrets) -> Result<Self, DeviceError> {
        let auth_key = VerifyingKey::from_bytes(&secrets.auth_pubkey)
            .map_err(|_| DeviceError::BadAuthKey)?;
        Ok(Self {
            secrets,
            auth_key,
            features: FeatureSet::new(),
        })
    }

    pub fn car_id(&self) -> u32 {
        self.secrets.car_id
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    fn dispatcher<'a>() -> Dispatcher<CarSession<'a>> {
        let mut dispatcher = Dispatcher::new();
        // Registration of a closed, static command set cannot collide.
        let _ = dispatcher.register(CommandCode::Unlock, handle_unlock);
        let _ = dispatcher.register(CommandCode::Start, handle_start);
        let _ = dispatcher.register(CommandCode::EnableFeature, handle_enable_feature);
        dispatcher
    }

    /// Accept the handshake and serve commands until the peer goes away.
    /// Frame-level idle timeouts keep the loop alive; a broken stream ends
    /// it cleanly.
    pub fn serve_connection<L: Link>(
        &mut self,
        channel: &mut SecureChannel<L>,
    ) -> Result<(), ChannelError> {
        channel.establish_responder(self.secrets.car_id)?;
        let binding = *channel.binding().ok_or(ChannelError::NotEstablished)?;
        let mut dispatcher = Self::dispatcher();
        let mut ctx = CarSession {
            device: self,
            binding,
            unlocked: false,
            package_buf: Vec::new(),
        };
        loop {
            match channel.serve_one(&mut dispatcher, &mut ctx) {
                Ok(_) => {}
                Err(ChannelError::Frame(FrameError::Timeout)) => continue,
                Err(ChannelError::Frame(FrameError::Closed))
                | Err(ChannelError::Frame(FrameError::Truncated)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

fn handle_unlock(ctx: &mut CarSession<'_>, data: &[u8]) -> Response {
    if data.len() < TOKEN_LEN {
        return Response::Nack(StatusCode::UNLOCK_BAD_TOKEN);
    }
    let expected = unlock_token(
        &ctx.device.secrets.link_key,
        ctx.device.secrets.car_id,
        &ctx.binding,
    );
    // Trailing padding from block-mode frames is ignored; the comparison
    // itself is constant-time.
    if bool::from(data[..TOKEN_LEN].ct_eq(&expected)) {
        ctx.unlocked = true;
        tracing::info!(car_id = ctx.device.secrets.car_id, "car unlocked");
        Response::Ack(vec![ctx.device.features.mask()])
    } else {
        Response::Nack(StatusCode::UNLOCK_BAD_TOKEN)
    }
}

fn handle_start(ctx: &mut CarSession<'_>, data: &[u8]) -> Response {
    if !ctx.unlocked {
        return Response::Nack(StatusCode::START_NOT_UNLOCKED);
    }
    let feature = match data.first() {
        Some(&f) => f,
        None => return Response::Nack(StatusCode::COMMS_MALFORMED),
    };
    // Feature 0 is the bare engine start; anything else must be enabled.
    if feature == 0 || ctx.device.features.is_enabled(feature) {
        tracing::info!(feature, "car started");
        Response::Ack(vec![])
    } else {
        Response::Nack(StatusCode::START_FEATURE_DISABLED)
    }
}

fn handle_enable_feature(ctx: &mut CarSession<'_>, data: &[u8]) -> Response {
    // Chunked transfer: [more][len][bytes]; the explicit length keeps block
    // padding out of the reassembly buffer.
    let (more, len, chunk) = match data {
        [more, len, rest @ ..] if rest.len() >= *len as usize => {
            (*more, *len as usize, &rest[..*len as usize])
        }
        _ => return Response::Nack(StatusCode::COMMS_MALFORMED),
    };
    ctx.package_buf.extend_from_slice(&chunk[..len]);
    if ctx.package_buf.len() > PACKAGE_LEN {
        ctx.package_buf.clear();
        return Response::Nack(StatusCode::COMMS_MALFORMED);
    }
    if more != 0 {
        return Response::Ack(vec![]);
    }
    let bytes = std::mem::take(&mut ctx.package_buf);
    let package = match Package::parse(&bytes) {
        Ok(p) => p,
        Err(e) => return Response::Nack(StatusCode::from(&e)),
    };
    match ctx
        .device
        .features
        .apply(&package, ctx.device.secrets.car_id, &ctx.device.auth_key)
    {
        Ok(()) => Response::Ack(vec![ctx.device.features.mask()]),
        Err(e) => Response::Nack(StatusCode::from(&e)),
    }
}

// ---------------------------------------------------------------------------
// Fob
// ---------------------------------------------------------------------------

/// Key fob state. The throttle outlives individual pairing attempts so
/// reconnecting does not reset the backoff.
pub struct FobDevice {
    secrets: ProvisionedSecrets,
    throttle: Throttle,
    pairing: Option<PairingMachine>,
    record: Option<PairingRecord>,
    pairing_timeout: Duration,
}

/// Per-connection fob context for host-issued commands. `now` is refreshed
/// by the serve loop before each dispatch.
pub struct FobSession<'a> {
    pub device: &'a mut FobDevice,
    pub now: Instant,
}

impl FobDevice {
    pub fn new(
        secrets: ProvisionedSecrets,
        policy: ThrottlePolicy,
        pairing_timeout: Duration,
    ) -> Self {
        let record = secrets
            .paired
            .then(|| PairingRecord::from_secrets(&secrets));
        Self {
            secrets,
            throttle: Throttle::new(policy),
            pairing: None,
            record,
            pairing_timeout,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.record.is_some()
    }

    pub fn record(&self) -> Option<&PairingRecord> {
        self.record.as_ref()
    }

    /// State of the running pairing attempt, if one is active.
    pub fn pairing_state(&self) -> Option<PairingState> {
        self.pairing.as_ref().map(|m| m.state())
    }

    /// Start a pairing attempt and begin waiting for a candidate PIN.
    pub fn begin_pairing(&mut self, now: Instant) -> Result<(), PairingError> {
        if self.record.is_some() {
            return Err(PairingError::AlreadyPaired);
        }
        if self.pairing.is_some() {
            return Err(PairingError::InvalidState);
        }
        let mut machine = PairingMachine::begin(self.pairing_timeout, now);
        machine.request_pair(now)?;
        self.pairing = Some(machine);
        Ok(())
    }

    /// Feed the candidate PIN to the running attempt. Terminal outcomes
    /// release the attempt context either way.
    pub fn submit_pin(&mut self, candidate: &str, now: Instant) -> Result<u32, PairingError> {
        let machine = self.pairing.as_mut().ok_or(PairingError::InvalidState)?;
        let result = machine.submit_pin(&mut self.throttle, candidate, &self.secrets, now);
        if matches!(
            machine.state(),
            PairingState::Paired | PairingState::Failed | PairingState::TimedOut
        ) {
            self.pairing = None;
        }
        let record = result?;
        let car_id = record.car_id;
        self.record = Some(record);
        Ok(car_id)
    }

    /// Expire a stale pairing attempt.
    pub fn tick(&mut self, now: Instant) {
        if let Some(machine) = self.pairing.as_mut() {
            if machine.tick(now) == PairingState::TimedOut {
                self.pairing = None;
            }
        }
    }

    /// Produce a pairing grant for a peer fob that proved the PIN. Serves
    /// the delegation path on an already-paired fob.
    pub fn grant_for(&mut self, candidate: &str, now: Instant) -> Result<PairingRecord, PairingError> {
        if self.record.is_none() {
            return Err(PairingError::NotPaired);
        }
        self.throttle.check(now)?;
        let pin = Pin::parse(candidate)?;
        if verify_pin(&self.secrets.pin_hash, &self.secrets.pin_salt, &pin) {
            self.throttle.record_success();
            // Checked non-none above; clone under the borrow rules.
            self.record
                .clone()
                .ok_or(PairingError::NotPaired)
        } else {
            self.throttle.record_failure(now);
            Err(PairingError::IncorrectPin)
        }
    }

    /// Adopt a grant received from a paired peer over an established
    /// session.
    pub fn install_grant(&mut self, data: &[u8]) -> Result<u32, PairingError> {
        if self.record.is_some() {
            return Err(PairingError::AlreadyPaired);
        }
        let record = PairingRecord::from_grant(data, &self.secrets)?;
        let car_id = record.car_id;
        self.record = Some(record);
        tracing::info!(car_id, "pairing grant installed");
        Ok(car_id)
    }

    fn dispatcher<'a>() -> Dispatcher<FobSession<'a>> {
        let mut dispatcher = Dispatcher::new();
        let _ = dispatcher.register(CommandCode::PairRequest, handle_pair_request);
        let _ = dispatcher.register(CommandCode::SubmitPin, handle_submit_pin);
        let _ = dispatcher.register(CommandCode::PairDelegate, handle_pair_delegate);
        dispatcher
    }

    /// Accept a host or peer-fob connection and serve pairing commands.
    /// These links bind identity 0: the peer does not know the car id until
    /// pairing succeeds.
    pub fn serve_connection<L: Link>(
        &mut self,
        channel: &mut SecureChannel<L>,
    ) -> Result<(), ChannelError> {
        channel.establish_responder(0)?;
        let mut dispatcher = Self::dispatcher();
        let mut ctx = FobSession {
            device: self,
            now: Instant::now(),
        };
        loop {
            ctx.now = Instant::now();
            ctx.device.tick(ctx.now);
            match channel.serve_one(&mut dispatcher, &mut ctx) {
                Ok(_) => {}
                Err(ChannelError::Frame(FrameError::Timeout)) => continue,
                Err(ChannelError::Frame(FrameError::Closed))
                | Err(ChannelError::Frame(FrameError::Truncated)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the car to unlock over an established channel. Returns the
    /// enabled-feature bitfield.
    pub fn request_unlock<L: Link>(
        &self,
        channel: &mut SecureChannel<L>,
    ) -> Result<u8, DeviceError> {
        let record = self.record.as_ref().ok_or(PairingError::NotPaired)?;
        let binding = *channel.binding().ok_or(ChannelError::NotEstablished)?;
        let token = unlock_token(&record.link_key, record.car_id, &binding);
        let response = channel.request(&Command::new(CommandCode::Unlock, token.to_vec()))?;
        match response {
            Response::Ack(data) => data.first().copied().ok_or(DeviceError::BadReply),
            Response::Nack(status) => Err(DeviceError::Rejected(status)),
        }
    }
}

fn trim_padding(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    &data[..end]
}

fn handle_pair_request(ctx: &mut FobSession<'_>, _data: &[u8]) -> Response {
    match ctx.device.begin_pairing(ctx.now) {
        Ok(()) => Response::Ack(vec![]),
        Err(e) => Response::Nack(StatusCode::from(&e)),
    }
}

fn handle_submit_pin(ctx: &mut FobSession<'_>, data: &[u8]) -> Response {
    let candidate = match std::str::from_utf8(trim_padding(data)) {
        Ok(s) => s,
        Err(_) => return Response::Nack(StatusCode::PAIR_MALFORMED_PIN),
    };
    match ctx.device.submit_pin(candidate, ctx.now) {
        Ok(car_id) => Response::Ack(car_id.to_le_bytes().to_vec()),
        Err(e) => Response::Nack(StatusCode::from(&e)),
    }
}

fn handle_pair_delegate(ctx: &mut FobSession<'_>, data: &[u8]) -> Response {
    let candidate = match std::str::from_utf8(trim_padding(data)) {
        Ok(s) => s,
        Err(_) => return Response::Nack(StatusCode::PAIR_MALFORMED_PIN),
    };
    match ctx.device.grant_for(candidate, ctx.now) {
        Ok(record) => Response::Ack(record.encode_grant()),
        Err(e) => Response::Nack(StatusCode::from(&e)),
    }
}

// ---------------------------------------------------------------------------
// Host-side requests
// ---------------------------------------------------------------------------

/// Push a signed feature package to the car in chunks sized for the session
/// cipher. Returns the car's new feature bitfield.
pub fn enable_feature<L: Link>(
    channel: &mut SecureChannel<L>,
    package: &Package,
) -> Result<u8, DeviceError> {
    let budget = Session::max_plaintext(
        channel.config().cipher_mode,
        channel.config().max_payload,
    );
    // Command code, more flag and chunk length precede each chunk.
    let chunk_size = budget.saturating_sub(3).max(1);
    let bytes = package.encode();
    let mut chunks = bytes.chunks(chunk_size).peekable();
    while let Some(chunk) = chunks.next() {
        let more = chunks.peek().is_some();
        let mut data = Vec::with_capacity(2 + chunk.len());
        data.push(u8::from(more));
        data.push(chunk.len() as u8);
        data.extend_from_slice(chunk);
        let response = channel.request(&Command::new(CommandCode::EnableFeature, data))?;
        match response {
            Response::Ack(reply) => {
                if !more {
                    return reply.first().copied().ok_or(DeviceError::BadReply);
                }
            }
            Response::Nack(status) => return Err(DeviceError::Rejected(status)),
        }
    }
    Err(DeviceError::BadReply)
}

/// Ask an unlocked car to start, optionally with a feature engaged.
pub fn request_start<L: Link>(
    channel: &mut SecureChannel<L>,
    feature: u8,
) -> Result<(), DeviceError> {
    let response = channel.request(&Command::new(CommandCode::Start, vec![feature]))?;
    match response {
        Response::Ack(_) => Ok(()),
        Response::Nack(status) => Err(DeviceError::Rejected(status)),
    }
}

/// Host-side pairing driver: begin an attempt on the fob and submit a PIN.
pub fn pair_with_pin<L: Link>(
    channel: &mut SecureChannel<L>,
    pin: &str,
) -> Result<u32, DeviceError> {
    let response = channel.request(&Command::new(CommandCode::PairRequest, vec![]))?;
    if let Response::Nack(status) = response {
        return Err(DeviceError::Rejected(status));
    }
    let response =
        channel.request(&Command::new(CommandCode::SubmitPin, pin.as_bytes().to_vec()))?;
    match response {
        Response::Ack(data) => {
            if data.len() < 4 {
                return Err(DeviceError::BadReply);
            }
            Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
        }
        Response::Nack(status) => Err(DeviceError::Rejected(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ProtocolConfig;
    use crate::crypto::CipherMode;
    use crate::link::{memory_pair, MemoryLink};
    use crate::pairing::pin_hash;
    use ed25519_dalek::SigningKey;
    use rand::RngCore;
    use zeroize::Zeroizing;

    struct Fixture {
        signer: SigningKey,
        car_secrets: ProvisionedSecrets,
        fob_secrets: ProvisionedSecrets,
    }

    fn fixture(car_id: u32, pin: &str) -> Fixture {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let signer = SigningKey::from_bytes(&seed);
        let salt = [0x5A; 16];
        let hash = pin_hash(&salt, &Pin::parse(pin).unwrap());
        let base = ProvisionedSecrets {
            car_id,
            pin_hash: hash,
            pin_salt: salt,
            link_key: Zeroizing::new([0x31; 32]),
            feature_key: Zeroizing::new([0x32; 32]),
            auth_pubkey: signer.verifying_key().to_bytes(),
            paired: false,
        };
        Fixture {
            signer,
            car_secrets: base.clone(),
            fob_secrets: base,
        }
    }

    fn throttle_off() -> ThrottlePolicy {
        ThrottlePolicy {
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
            max_failures: None,
        }
    }

    fn test_config(mode: CipherMode) -> ProtocolConfig {
        ProtocolConfig {
            cipher_mode: mode,
            read_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(2),
            ..ProtocolConfig::default()
        }
    }

    /// Spawn a car serving one connection; return the fob-side channel.
    /// Both ends bind the car identity into the session.
    fn car_link(
        mut car: CarDevice,
        mode: CipherMode,
    ) -> (
        SecureChannel<MemoryLink>,
        std::thread::JoinHandle<CarDevice>,
    ) {
        let car_id = car.car_id();
        let (fob_end, car_end) = memory_pair();
        let cfg = test_config(mode);
        let handle = std::thread::spawn(move || {
            let mut channel = SecureChannel::new(car_end, cfg);
            car.serve_connection(&mut channel).unwrap();
            car
        });
        let mut channel = SecureChannel::new(fob_end, cfg);
        channel.establish_initiator(car_id).unwrap();
        (channel, handle)
    }

    #[test]
    fn wrong_pin_fails_pairing() {
        let fx = fixture(42, "ABCDEF");
        let mut fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let now = Instant::now();
        fob.begin_pairing(now).unwrap();
        assert_eq!(fob.pairing_state(), Some(PairingState::AwaitingPin));
        let err = fob.submit_pin("123456", now).unwrap_err();
        assert_eq!(err, PairingError::IncorrectPin);
        assert!(!fob.is_paired());
        // Terminal outcome released the attempt.
        assert_eq!(fob.pairing_state(), None);
    }

    #[test]
    fn correct_pin_pairs_case_insensitively() {
        let fx = fixture(42, "ABCDEF");
        let mut fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let now = Instant::now();
        fob.begin_pairing(now).unwrap();
        let car_id = fob.submit_pin("abcdef", now).unwrap();
        assert_eq!(car_id, 42);
        assert!(fob.is_paired());
        // A second attempt on a paired fob is refused.
        assert_eq!(
            fob.begin_pairing(now).unwrap_err(),
            PairingError::AlreadyPaired
        );
    }

    #[test]
    fn repeated_wrong_pins_get_throttled() {
        let fx = fixture(42, "ABCDEF");
        let mut fob = FobDevice::new(
            fx.fob_secrets,
            ThrottlePolicy::default(),
            Duration::from_secs(30),
        );
        let now = Instant::now();
        fob.begin_pairing(now).unwrap();
        assert_eq!(
            fob.submit_pin("000000", now).unwrap_err(),
            PairingError::IncorrectPin
        );
        fob.begin_pairing(now).unwrap();
        match fob.submit_pin("000001", now).unwrap_err() {
            PairingError::Throttled { retry_after } => {
                assert!(retry_after > Duration::from_millis(0));
            }
            other => panic!("expected throttled, got {other:?}"),
        }
    }

    #[test]
    fn pairing_attempt_times_out() {
        let fx = fixture(42, "ABCDEF");
        let mut fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(5));
        let now = Instant::now();
        fob.begin_pairing(now).unwrap();
        fob.tick(now + Duration::from_secs(6));
        assert_eq!(fob.pairing_state(), None);
        assert!(!fob.is_paired());
    }

    #[test]
    fn unpaired_fob_cannot_unlock() {
        let fx = fixture(7, "ABCDEF");
        let fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let car = CarDevice::new(fx.car_secrets).unwrap();
        let (mut channel, handle) = car_link(car, CipherMode::ChaCha20Poly1305);
        let err = fob.request_unlock(&mut channel).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Pairing(PairingError::NotPaired)
        ));
        channel.close();
        handle.join().unwrap();
    }

    #[test]
    fn end_to_end_unlock_enable_start() {
        let fx = fixture(7, "ABCDEF");
        let mut fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let now = Instant::now();
        fob.begin_pairing(now).unwrap();
        fob.submit_pin("ABCDEF", now).unwrap();

        let car = CarDevice::new(fx.car_secrets).unwrap();
        let (mut channel, handle) = car_link(car, CipherMode::ChaCha20Poly1305);

        // Nothing enabled yet.
        let mask = fob.request_unlock(&mut channel).unwrap();
        assert_eq!(mask, 0);

        // Signed package for feature 3 is accepted exactly once.
        let package = Package::sign(&fx.signer, 7, 3, [0xC4; 8]);
        let mask = enable_feature(&mut channel, &package).unwrap();
        assert_eq!(mask, 0b100);
        let err = enable_feature(&mut channel, &package).unwrap_err();
        match err {
            DeviceError::Rejected(status) => {
                assert_eq!(status, StatusCode::FEATURE_REPLAYED);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        request_start(&mut channel, 3).unwrap();
        request_start(&mut channel, 0).unwrap();
        let err = request_start(&mut channel, 5).unwrap_err();
        match err {
            DeviceError::Rejected(status) => {
                assert_eq!(status, StatusCode::START_FEATURE_DISABLED);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        channel.close();
        let car = handle.join().unwrap();
        assert!(car.features().is_enabled(3));
    }

    #[test]
    fn start_requires_unlock_first() {
        let fx = fixture(7, "ABCDEF");
        let car = CarDevice::new(fx.car_secrets).unwrap();
        let (mut channel, handle) = car_link(car, CipherMode::ChaCha20Poly1305);
        let err = request_start(&mut channel, 0).unwrap_err();
        match err {
            DeviceError::Rejected(status) => {
                assert_eq!(status, StatusCode::START_NOT_UNLOCKED);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        channel.close();
        handle.join().unwrap();
    }

    #[test]
    fn wrong_car_package_rejected() {
        let fx = fixture(7, "ABCDEF");
        let car = CarDevice::new(fx.car_secrets).unwrap();
        let (mut channel, handle) = car_link(car, CipherMode::ChaCha20Poly1305);
        let package = Package::sign(&fx.signer, 8, 1, [0; 8]);
        let err = enable_feature(&mut channel, &package).unwrap_err();
        match err {
            DeviceError::Rejected(status) => {
                assert_eq!(status, StatusCode::FEATURE_WRONG_CAR);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        channel.close();
        handle.join().unwrap();
    }

    #[test]
    fn end_to_end_over_cbc() {
        let fx = fixture(9, "1A2B3C");
        let mut fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let now = Instant::now();
        fob.begin_pairing(now).unwrap();
        fob.submit_pin("1a2b3c", now).unwrap();

        let car = CarDevice::new(fx.car_secrets).unwrap();
        let (mut channel, handle) = car_link(car, CipherMode::Aes256Cbc);

        let package = Package::sign(&fx.signer, 9, 1, [0x01; 8]);
        let mask = enable_feature(&mut channel, &package).unwrap();
        assert_eq!(mask, 0b1);
        let mask = fob.request_unlock(&mut channel).unwrap();
        assert_eq!(mask, 0b1);
        request_start(&mut channel, 1).unwrap();

        channel.close();
        handle.join().unwrap();
    }

    #[test]
    fn host_pairs_fob_over_link() {
        let fx = fixture(42, "ABCDEF");
        let mut fob = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let (host_end, fob_end) = memory_pair();
        let cfg = test_config(CipherMode::ChaCha20Poly1305);
        let handle = std::thread::spawn(move || {
            let mut channel = SecureChannel::new(fob_end, cfg);
            fob.serve_connection(&mut channel).unwrap();
            fob
        });
        let mut channel = SecureChannel::new(host_end, cfg);
        channel.establish_initiator(0).unwrap();

        // Wrong PIN first: user-visible rejection, fob stays unpaired.
        let err = pair_with_pin(&mut channel, "123456").unwrap_err();
        match err {
            DeviceError::Rejected(status) => {
                assert_eq!(status, StatusCode::PAIR_INCORRECT_PIN);
                assert!(status.user_visible());
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let car_id = pair_with_pin(&mut channel, "ABCDEF").unwrap();
        assert_eq!(car_id, 42);

        channel.close();
        let fob = handle.join().unwrap();
        assert!(fob.is_paired());
    }

    #[test]
    fn delegation_transfers_grant() {
        let fx = fixture(42, "ABCDEF");
        let mut paired = FobDevice::new(
            fx.fob_secrets.clone(),
            throttle_off(),
            Duration::from_secs(30),
        );
        let now = Instant::now();
        paired.begin_pairing(now).unwrap();
        paired.submit_pin("ABCDEF", now).unwrap();

        let mut unpaired =
            FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));

        // Unpaired side drives the paired fob over a link.
        let (requester_end, paired_end) = memory_pair();
        let cfg = test_config(CipherMode::ChaCha20Poly1305);
        let handle = std::thread::spawn(move || {
            let mut channel = SecureChannel::new(paired_end, cfg);
            paired.serve_connection(&mut channel).unwrap();
        });
        let mut channel = SecureChannel::new(requester_end, cfg);
        channel.establish_initiator(0).unwrap();

        let response = channel
            .request(&Command::new(
                CommandCode::PairDelegate,
                b"ABCDEF".to_vec(),
            ))
            .unwrap();
        let grant = match response {
            Response::Ack(data) => data,
            Response::Nack(status) => panic!("delegation refused: {}", status.describe()),
        };
        let car_id = unpaired.install_grant(&grant).unwrap();
        assert_eq!(car_id, 42);
        assert!(unpaired.is_paired());

        channel.close();
        handle.join().unwrap();
    }

    #[test]
    fn delegation_requires_correct_pin() {
        let fx = fixture(42, "ABCDEF");
        let mut paired = FobDevice::new(fx.fob_secrets, throttle_off(), Duration::from_secs(30));
        let now = Instant::now();
        paired.begin_pairing(now).unwrap();
        paired.submit_pin("ABCDEF", now).unwrap();
        assert_eq!(
            paired.grant_for("FFFFFF", now).unwrap_err(),
            PairingError::IncorrectPin
        );
    }
}
