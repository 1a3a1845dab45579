//! Status codes returned to the host side, grouped by subsystem. Host
//! tooling matches on these values; the table is a stable contract.
//!
//! Only the pairing group is meant for end users; the rest stay opaque so a
//! probing peer learns nothing about internal protocol state beyond
//! "rejected".

use crate::crypto::CryptoError;
use crate::dispatch::DispatchError;
use crate::feature::FeatureError;
use crate::frame::FrameError;
use crate::handshake::KeyExchangeError;
use crate::pairing::PairingError;

/// 16-bit status word, `0x0000` on success. High byte selects the subsystem:
/// `0x10` communications, `0x30` feature enable, `0x40` pairing, `0x50`
/// unlock, `0x60` start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0x0000);

    // Communications.
    pub const COMMS_CRC_MISMATCH: StatusCode = StatusCode(0x1001);
    pub const COMMS_FRAME_TOO_LONG: StatusCode = StatusCode(0x1002);
    pub const COMMS_TIMEOUT: StatusCode = StatusCode(0x1003);
    pub const COMMS_TRUNCATED: StatusCode = StatusCode(0x1004);
    pub const COMMS_FLOW_VIOLATION: StatusCode = StatusCode(0x1005);
    pub const COMMS_AUTH_FAILED: StatusCode = StatusCode(0x1006);
    pub const COMMS_BAD_KEY: StatusCode = StatusCode(0x1007);
    pub const COMMS_HANDSHAKE_FAILED: StatusCode = StatusCode(0x1008);
    pub const COMMS_UNKNOWN_COMMAND: StatusCode = StatusCode(0x1009);
    pub const COMMS_MALFORMED: StatusCode = StatusCode(0x100A);

    // Feature enable.
    pub const FEATURE_WRONG_CAR: StatusCode = StatusCode(0x3001);
    pub const FEATURE_ALREADY_ENABLED: StatusCode = StatusCode(0x3002);
    pub const FEATURE_BAD_SIGNATURE: StatusCode = StatusCode(0x3003);
    pub const FEATURE_REPLAYED: StatusCode = StatusCode(0x3004);
    pub const FEATURE_INVALID_NUMBER: StatusCode = StatusCode(0x3005);

    // Pairing.
    pub const PAIR_MALFORMED_PIN: StatusCode = StatusCode(0x4001);
    pub const PAIR_INCORRECT_PIN: StatusCode = StatusCode(0x4002);
    pub const PAIR_ALREADY_PAIRED: StatusCode = StatusCode(0x4003);
    pub const PAIR_NOT_PAIRED: StatusCode = StatusCode(0x4004);
    pub const PAIR_THROTTLED: StatusCode = StatusCode(0x4005);
    pub const PAIR_LOCKED_OUT: StatusCode = StatusCode(0x4006);
    pub const PAIR_TIMED_OUT: StatusCode = StatusCode(0x4007);
    pub const PAIR_OUT_OF_ORDER: StatusCode = StatusCode(0x4008);

    // Unlock.
    pub const UNLOCK_BAD_TOKEN: StatusCode = StatusCode(0x5001);
    pub const UNLOCK_NOT_PAIRED: StatusCode = StatusCode(0x5002);

    // Start.
    pub const START_FEATURE_DISABLED: StatusCode = StatusCode(0x6001);
    pub const START_NOT_UNLOCKED: StatusCode = StatusCode(0x6002);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// True for codes a user is shown verbatim (the pairing group).
    pub fn user_visible(self) -> bool {
        self.0 & 0xF000 == 0x4000
    }

    /// Human-readable translation for host tooling.
    pub fn describe(self) -> &'static str {
        match self {
            Self::SUCCESS => "success",
            Self::COMMS_CRC_MISMATCH => "frame checksum mismatch",
            Self::COMMS_FRAME_TOO_LONG => "frame exceeds length cap",
            Self::COMMS_TIMEOUT => "communication timed out",
            Self::COMMS_TRUNCATED => "stream ended mid-frame",
            Self::COMMS_FLOW_VIOLATION => "flow control violation",
            Self::COMMS_AUTH_FAILED => "message authentication failed",
            Self::COMMS_BAD_KEY => "invalid key material",
            Self::COMMS_HANDSHAKE_FAILED => "key exchange failed",
            Self::COMMS_UNKNOWN_COMMAND => "unknown command",
            Self::COMMS_MALFORMED => "malformed message",
            Self::FEATURE_WRONG_CAR => "feature package is for another car",
            Self::FEATURE_ALREADY_ENABLED => "feature already enabled",
            Self::FEATURE_BAD_SIGNATURE => "feature package signature invalid",
            Self::FEATURE_REPLAYED => "feature package already applied",
            Self::FEATURE_INVALID_NUMBER => "feature number out of range",
            Self::PAIR_MALFORMED_PIN => "PIN must be exactly 6 hexadecimal characters",
            Self::PAIR_INCORRECT_PIN => "incorrect PIN",
            Self::PAIR_ALREADY_PAIRED => "device is already paired",
            Self::PAIR_NOT_PAIRED => "device is not paired",
            Self::PAIR_THROTTLED => "too many attempts, wait before retrying",
            Self::PAIR_LOCKED_OUT => "pairing locked after repeated failures",
            Self::PAIR_TIMED_OUT => "pairing attempt timed out",
            Self::PAIR_OUT_OF_ORDER => "pairing step out of order",
            Self::UNLOCK_BAD_TOKEN => "unlock rejected",
            Self::UNLOCK_NOT_PAIRED => "fob is not paired with this car",
            Self::START_FEATURE_DISABLED => "feature is not enabled",
            Self::START_NOT_UNLOCKED => "car is not unlocked",
            _ => "unrecognized status",
        }
    }
}

impl From<&FrameError> for StatusCode {
    fn from(e: &FrameError) -> Self {
        match e {
            FrameError::CrcMismatch { .. } => Self::COMMS_CRC_MISMATCH,
            FrameError::TooLong { .. } => Self::COMMS_FRAME_TOO_LONG,
            FrameError::TooShort { .. } => Self::COMMS_MALFORMED,
            FrameError::Timeout => Self::COMMS_TIMEOUT,
            FrameError::Truncated | FrameError::Closed => Self::COMMS_TRUNCATED,
            FrameError::FlowViolation { .. } => Self::COMMS_FLOW_VIOLATION,
            FrameError::Transport(_) => Self::COMMS_TRUNCATED,
        }
    }
}

impl From<&CryptoError> for StatusCode {
    fn from(e: &CryptoError) -> Self {
        match e {
            CryptoError::AuthFailed => Self::COMMS_AUTH_FAILED,
            CryptoError::InvalidKey | CryptoError::CounterExhausted => Self::COMMS_BAD_KEY,
            CryptoError::InvalidLength(_) => Self::COMMS_MALFORMED,
        }
    }
}

impl From<&KeyExchangeError> for StatusCode {
    fn from(_: &KeyExchangeError) -> Self {
        // One opaque code for the whole handshake group.
        Self::COMMS_HANDSHAKE_FAILED
    }
}

impl From<&PairingError> for StatusCode {
    fn from(e: &PairingError) -> Self {
        match e {
            PairingError::MalformedPin => Self::PAIR_MALFORMED_PIN,
            PairingError::IncorrectPin => Self::PAIR_INCORRECT_PIN,
            PairingError::AlreadyPaired => Self::PAIR_ALREADY_PAIRED,
            PairingError::NotPaired => Self::PAIR_NOT_PAIRED,
            PairingError::Throttled { .. } => Self::PAIR_THROTTLED,
            PairingError::LockedOut => Self::PAIR_LOCKED_OUT,
            PairingError::TimedOut => Self::PAIR_TIMED_OUT,
            PairingError::InvalidState => Self::PAIR_OUT_OF_ORDER,
        }
    }
}

impl From<&FeatureError> for StatusCode {
    fn from(e: &FeatureError) -> Self {
        match e {
            FeatureError::Malformed(_) => Self::COMMS_MALFORMED,
            FeatureError::WrongCar { .. } => Self::FEATURE_WRONG_CAR,
            FeatureError::InvalidFeature(_) => Self::FEATURE_INVALID_NUMBER,
            FeatureError::BadSignature => Self::FEATURE_BAD_SIGNATURE,
            FeatureError::AlreadyEnabled(_) => Self::FEATURE_ALREADY_ENABLED,
            FeatureError::Replayed => Self::FEATURE_REPLAYED,
        }
    }
}

impl From<&DispatchError> for StatusCode {
    fn from(e: &DispatchError) -> Self {
        match e {
            DispatchError::UnknownCommand(_) => Self::COMMS_UNKNOWN_COMMAND,
            DispatchError::Timeout => Self::COMMS_TIMEOUT,
            DispatchError::DuplicateHandler(_) | DispatchError::BadResponse => {
                Self::COMMS_MALFORMED
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_grouping() {
        assert_eq!(StatusCode::COMMS_TIMEOUT.0 & 0xF000, 0x1000);
        assert_eq!(StatusCode::FEATURE_BAD_SIGNATURE.0 & 0xF000, 0x3000);
        assert_eq!(StatusCode::PAIR_INCORRECT_PIN.0 & 0xF000, 0x4000);
        assert_eq!(StatusCode::UNLOCK_BAD_TOKEN.0 & 0xF000, 0x5000);
        assert_eq!(StatusCode::START_FEATURE_DISABLED.0 & 0xF000, 0x6000);
    }

    #[test]
    fn only_pairing_is_user_visible() {
        assert!(StatusCode::PAIR_INCORRECT_PIN.user_visible());
        assert!(StatusCode::PAIR_THROTTLED.user_visible());
        assert!(!StatusCode::COMMS_AUTH_FAILED.user_visible());
        assert!(!StatusCode::UNLOCK_BAD_TOKEN.user_visible());
    }

    #[test]
    fn every_code_has_a_description() {
        let codes = [
            StatusCode::SUCCESS,
            StatusCode::COMMS_CRC_MISMATCH,
            StatusCode::COMMS_FRAME_TOO_LONG,
            StatusCode::COMMS_TIMEOUT,
            StatusCode::COMMS_TRUNCATED,
            StatusCode::COMMS_FLOW_VIOLATION,
            StatusCode::COMMS_AUTH_FAILED,
            StatusCode::COMMS_BAD_KEY,
            StatusCode::COMMS_HANDSHAKE_FAILED,
            StatusCode::COMMS_UNKNOWN_COMMAND,
            StatusCode::COMMS_MALFORMED,
            StatusCode::FEATURE_WRONG_CAR,
            StatusCode::FEATURE_ALREADY_ENABLED,
            StatusCode::FEATURE_BAD_SIGNATURE,
            StatusCode::FEATURE_REPLAYED,
            StatusCode::FEATURE_INVALID_NUMBER,
            StatusCode::PAIR_MALFORMED_PIN,
            StatusCode::PAIR_INCORRECT_PIN,
            StatusCode::PAIR_ALREADY_PAIRED,
            StatusCode::PAIR_NOT_PAIRED,
            StatusCode::PAIR_THROTTLED,
            StatusCode::PAIR_LOCKED_OUT,
            StatusCode::PAIR_TIMED_OUT,
            StatusCode::PAIR_OUT_OF_ORDER,
            StatusCode::UNLOCK_BAD_TOKEN,
            StatusCode::UNLOCK_NOT_PAIRED,
            StatusCode::START_FEATURE_DISABLED,
            StatusCode::START_NOT_UNLOCKED,
        ];
        for code in codes {
            assert_ne!(code.describe(), "unrecognized status", "{:#06x}", code.0);
        }
        assert_eq!(StatusCode(0xBEEF).describe(), "unrecognized status");
    }

    #[test]
    fn pairing_errors_translate() {
        use crate::pairing::PairingError;
        assert_eq!(
            StatusCode::from(&PairingError::IncorrectPin),
            StatusCode::PAIR_INCORRECT_PIN
        );
        assert_eq!(
            StatusCode::from(&PairingError::Throttled {
                retry_after: std::time::Duration::from_secs(1)
            }),
            StatusCode::PAIR_THROTTLED
        );
    }
}
