//! FobLink protocol reference implementation: framed, encrypted
//! command/response link between a key fob and a vehicle controller, with
//! PIN-gated pairing and signed feature unlock.
//! The core owns no I/O policy; hosts supply a [`link::Link`] and drive it.

pub mod channel;
pub mod command;
pub mod crypto;
pub mod device;
pub mod dispatch;
pub mod feature;
pub mod frame;
pub mod handshake;
pub mod link;
pub mod pairing;
pub mod secrets;
pub mod status;

pub use channel::{ChannelError, ProtocolConfig, SecureChannel};
pub use command::{Command, CommandCode};
pub use crypto::{CipherMode, CryptoError, Session};
pub use device::{CarDevice, DeviceError, FobDevice};
pub use dispatch::{DispatchError, Dispatcher, Handler, Response};
pub use feature::{FeatureError, FeatureSet, Package};
pub use frame::{FlowControl, FrameError, FRAME_ACK, MAX_PAYLOAD};
pub use handshake::{EphemeralKeypair, KeyExchangeError};
pub use link::{Link, LinkError, MemoryLink};
pub use pairing::{PairingError, PairingMachine, PairingState, Pin, Throttle, ThrottlePolicy};
pub use secrets::{Derivation, ProvisionedSecrets, SecretError, SecretSource};
pub use status::StatusCode;
